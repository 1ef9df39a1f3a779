use chrono::{DateTime, Utc};
use sqlx::pool::PoolConnection;
use sqlx::types::Json;
use sqlx::{MySql, MySqlConnection};
use std::collections::{BTreeMap, HashMap};
use std::hash::Hasher;

use session_core::error::{Result, SessionError};
use session_core::models::session::{filter_events, next_update_time, SessionStateDoc};
use session_core::models::state::{copy_state, is_reserved_scope_key, merge_scopes, APP_PREFIX};
use session_core::models::track::tracks_from_state;
use session_core::models::{
    Event, GetOptions, Session, SessionKey, StateMap, Summary, TrackEvent, TrackEvents, UserKey,
};

use super::{Store, ACTIVE_FILTER};
use crate::sql::{bind_session_keys, session_key_in_clause};
use crate::subsystems::cleanup::{self, SweepScope};

const CREATE_LOCK_TIMEOUT_SECS: i64 = 10;

/// Advisory lock name for creators of one session key. MySQL caps names at 64 chars.
pub fn create_lock_name(key: &SessionKey) -> String {
    let mut hasher = twox_hash::XxHash64::with_seed(0);
    hasher.write(key.joined().as_bytes());
    format!("session_create:{:016x}:{}", hasher.finish(), key.joined().len())
}

/// Holds a connection with a `GET_LOCK` taken. If dropped before
/// [`CreateLock::release`], the connection is closed so the server frees the lock.
struct CreateLock {
    conn: Option<PoolConnection<MySql>>,
    name: String,
}

impl CreateLock {
    async fn acquire(store: &Store, name: String) -> Result<Self> {
        let mut conn = store
            .pool
            .acquire()
            .await
            .map_err(|e| SessionError::db("acquire connection", e))?;
        let (got,): (Option<i64>,) = sqlx::query_as("SELECT GET_LOCK(?, ?)")
            .bind(&name)
            .bind(CREATE_LOCK_TIMEOUT_SECS)
            .fetch_one(&mut *conn)
            .await
            .map_err(|e| SessionError::db("get create lock", e))?;
        if got != Some(1) {
            return Err(SessionError::Other(format!("timed out waiting for create lock {name}")));
        }
        Ok(Self {
            conn: Some(conn),
            name,
        })
    }

    fn conn(&mut self) -> Result<&mut MySqlConnection> {
        self.conn
            .as_deref_mut()
            .ok_or_else(|| SessionError::Other("create lock already released".to_string()))
    }

    async fn release(mut self) {
        if let Some(mut conn) = self.conn.take() {
            let released = sqlx::query("SELECT RELEASE_LOCK(?)")
                .bind(&self.name)
                .execute(&mut *conn)
                .await;
            if let Err(e) = released {
                tracing::warn!(lock = %self.name, error = %e, "release create lock failed");
                conn.close_on_drop();
            }
        }
    }
}

impl Drop for CreateLock {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.as_mut() {
            conn.close_on_drop();
        }
    }
}

pub(super) type SessionRow = (Option<Json<SessionStateDoc>>, DateTime<Utc>, DateTime<Utc>);

impl Store {
    // ========================================================================
    // CREATE
    // ========================================================================

    pub async fn create_session(&self, key: SessionKey, state: &StateMap) -> Result<Session> {
        key.check_user_key()?;
        let mut key = key;
        if key.session_id.is_empty() {
            key.session_id = uuid::Uuid::new_v4().to_string();
        }
        let state = copy_state(state);

        let mut lock = CreateLock::acquire(self, create_lock_name(&key)).await?;
        let inserted = self.insert_session_locked(lock.conn()?, &key, state).await;
        lock.release().await;
        let doc = inserted?;

        let app_state = self.list_app_states(&key.app_name).await?;
        let user_state = self.list_user_states(&key.user_key()).await?;
        tracing::debug!(app = %key.app_name, user = %key.user_id, session = %key.session_id, "session created");

        Ok(Session::builder(key)
            .state(merge_scopes(&app_state, &user_state, &doc.state))
            .created_at(doc.created_at)
            .updated_at(doc.updated_at)
            .build())
    }

    async fn insert_session_locked(
        &self,
        conn: &mut MySqlConnection,
        key: &SessionKey,
        state: StateMap,
    ) -> Result<SessionStateDoc> {
        let t = &self.tables;
        let existing: Option<(Option<DateTime<Utc>>,)> = sqlx::query_as(&format!(
            "SELECT expires_at FROM {} WHERE app_name = ? AND user_id = ? AND session_id = ? \
             AND deleted_at IS NULL LIMIT 1",
            t.session_states
        ))
        .bind(&key.app_name)
        .bind(&key.user_id)
        .bind(&key.session_id)
        .fetch_optional(&mut *conn)
        .await
        .map_err(|e| SessionError::db("check existing session", e))?;

        let now = Store::now();
        if let Some((expires_at,)) = existing {
            match expires_at {
                Some(at) if at <= now => {
                    let swept = cleanup::sweep_expired_sessions(self, &mut *conn, SweepScope::Session(key)).await?;
                    if swept == 0 {
                        return Err(SessionError::SessionAlreadyExists);
                    }
                    tracing::debug!(
                        app = %key.app_name,
                        user = %key.user_id,
                        session = %key.session_id,
                        "swept expired session before create"
                    );
                }
                _ => return Err(SessionError::SessionAlreadyExists),
            }
        }

        let doc = SessionStateDoc {
            id: key.session_id.clone(),
            state,
            created_at: now,
            updated_at: now,
        };
        let raw = serde_json::to_string(&doc).map_err(|e| SessionError::serde("marshal session state", e))?;
        sqlx::query(&format!(
            "INSERT INTO {} (app_name, user_id, session_id, state, created_at, updated_at, expires_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?)",
            t.session_states
        ))
        .bind(&key.app_name)
        .bind(&key.user_id)
        .bind(&key.session_id)
        .bind(raw)
        .bind(now)
        .bind(now)
        .bind(self.session_expires_at(now))
        .execute(&mut *conn)
        .await
        .map_err(|e| SessionError::db("insert session state", e))?;
        Ok(doc)
    }

    // ========================================================================
    // READ
    // ========================================================================

    pub async fn get_session(&self, key: &SessionKey, options: &GetOptions) -> Result<Option<Session>> {
        key.check_session_key()?;
        let now = Store::now();
        let row: Option<SessionRow> = sqlx::query_as(&format!(
            "SELECT state, created_at, updated_at FROM {} \
             WHERE app_name = ? AND user_id = ? AND session_id = ? AND {ACTIVE_FILTER}",
            self.tables.session_states
        ))
        .bind(&key.app_name)
        .bind(&key.user_id)
        .bind(&key.session_id)
        .bind(now)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| SessionError::db("get session state", e))?;

        let Some(row) = row else {
            return Ok(None);
        };
        let doc = state_doc(key, row);

        let app_state = self.list_app_states(&key.app_name).await?;
        let user_state = self.list_user_states(&key.user_key()).await?;

        let limit = self.event_limit(options);
        let after = self.after_time(options, now);
        let keys = [key.clone()];
        let events = self
            .load_events(&keys, limit, after)
            .await?
            .pop()
            .unwrap_or_default();
        let summaries = if events.is_empty() {
            BTreeMap::new()
        } else {
            self.load_summaries(&keys).await?.pop().unwrap_or_default()
        };
        let tracks = self.load_tracks(key, &doc.state, limit, after).await?;

        if self.config.session_ttl().is_some() {
            if let Err(e) = self.refresh_session_ttl(key).await {
                tracing::warn!(session = %key, error = %e, "refresh session ttl failed");
            }
        }

        Ok(Some(
            Session::builder(key.clone())
                .state(merge_scopes(&app_state, &user_state, &doc.state))
                .events(events)
                .summaries(summaries)
                .tracks(tracks)
                .created_at(doc.created_at)
                .updated_at(doc.updated_at)
                .build(),
        ))
    }

    pub async fn list_sessions(&self, user: &UserKey, options: &GetOptions) -> Result<Vec<Session>> {
        user.check()?;
        let now = Store::now();
        let rows: Vec<(String, Option<Json<SessionStateDoc>>, DateTime<Utc>, DateTime<Utc>)> =
            sqlx::query_as(&format!(
                "SELECT session_id, state, created_at, updated_at FROM {} \
                 WHERE app_name = ? AND user_id = ? AND {ACTIVE_FILTER} ORDER BY updated_at DESC",
                self.tables.session_states
            ))
            .bind(&user.app_name)
            .bind(&user.user_id)
            .bind(now)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| SessionError::db("list session states", e))?;
        if rows.is_empty() {
            return Ok(Vec::new());
        }

        let app_state = self.list_app_states(&user.app_name).await?;
        let user_state = self.list_user_states(user).await?;

        let keys: Vec<SessionKey> = rows
            .iter()
            .map(|(id, ..)| SessionKey::new(user.app_name.clone(), user.user_id.clone(), id.clone()))
            .collect();
        let limit = self.event_limit(options);
        let after = self.after_time(options, now);
        let events = self.load_events(&keys, limit, after).await?;

        let with_events: Vec<SessionKey> = keys
            .iter()
            .zip(&events)
            .filter(|(_, evs)| !evs.is_empty())
            .map(|(k, _)| k.clone())
            .collect();
        let mut summaries_by_id: HashMap<String, BTreeMap<String, Summary>> = HashMap::new();
        if !with_events.is_empty() {
            for (k, s) in with_events.iter().zip(self.load_summaries(&with_events).await?) {
                summaries_by_id.insert(k.session_id.clone(), s);
            }
        }

        let mut sessions = Vec::with_capacity(rows.len());
        for ((key, row), events) in keys.into_iter().zip(rows).zip(events) {
            let (_, state, created_at, updated_at) = row;
            let doc = state_doc(&key, (state, created_at, updated_at));
            let tracks = self.load_tracks(&key, &doc.state, limit, after).await?;
            let summaries = summaries_by_id.remove(&key.session_id).unwrap_or_default();
            sessions.push(
                Session::builder(key)
                    .state(merge_scopes(&app_state, &user_state, &doc.state))
                    .events(events)
                    .summaries(summaries)
                    .tracks(tracks)
                    .created_at(doc.created_at)
                    .updated_at(doc.updated_at)
                    .build(),
            );
        }
        Ok(sessions)
    }

    /// Events for each key, in the order of `keys`. Limit and time filters are
    /// applied per session after grouping.
    pub(crate) async fn load_events(
        &self,
        keys: &[SessionKey],
        limit: usize,
        after: Option<DateTime<Utc>>,
    ) -> Result<Vec<Vec<Event>>> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        // Events live as long as their session; `after` bounds them, not `expires_at`.
        let sql = format!(
            "SELECT app_name, user_id, session_id, event FROM {} WHERE {} AND deleted_at IS NULL \
             ORDER BY created_at ASC, id ASC",
            self.tables.session_events,
            session_key_in_clause(keys.len())
        );
        let rows: Vec<(String, String, String, Json<Event>)> =
            bind_session_keys(sqlx::query_as(&sql), keys)
                .fetch_all(&self.pool)
                .await
                .map_err(|e| SessionError::db("batch get session events", e))?;

        let index = key_index(keys);
        let mut grouped: Vec<Vec<Event>> = vec![Vec::new(); keys.len()];
        for (app, user, session, Json(event)) in rows {
            if let Some(&i) = index.get(&(app, user, session)) {
                grouped[i].push(event);
            }
        }
        Ok(grouped
            .into_iter()
            .map(|events| filter_events(events, limit, after))
            .collect())
    }

    /// Summaries for each key, keyed by filter key, in the order of `keys`.
    pub(crate) async fn load_summaries(
        &self,
        keys: &[SessionKey],
    ) -> Result<Vec<BTreeMap<String, Summary>>> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        let sql = format!(
            "SELECT app_name, user_id, session_id, filter_key, summary FROM {} WHERE {} AND deleted_at IS NULL",
            self.tables.session_summaries,
            session_key_in_clause(keys.len())
        );
        let rows: Vec<(String, String, String, String, Option<Json<Summary>>)> =
            bind_session_keys(sqlx::query_as(&sql), keys)
                .fetch_all(&self.pool)
                .await
                .map_err(|e| SessionError::db("batch get session summaries", e))?;

        let index = key_index(keys);
        let mut grouped: Vec<BTreeMap<String, Summary>> = vec![BTreeMap::new(); keys.len()];
        for (app, user, session, filter_key, summary) in rows {
            let Some(Json(summary)) = summary else {
                continue;
            };
            if let Some(&i) = index.get(&(app, user, session)) {
                grouped[i].insert(filter_key, summary);
            }
        }
        Ok(grouped)
    }

    /// Track events for every track named in the session's track index.
    /// Like events, they are bounded by `after` and the session row's lifecycle.
    pub(crate) async fn load_tracks(
        &self,
        key: &SessionKey,
        state: &StateMap,
        limit: usize,
        after: Option<DateTime<Utc>>,
    ) -> Result<BTreeMap<String, TrackEvents>> {
        let mut tracks = BTreeMap::new();
        for track in tracks_from_state(state)? {
            let mut sql = format!(
                "SELECT event FROM {} WHERE app_name = ? AND user_id = ? AND session_id = ? \
                 AND track = ? AND deleted_at IS NULL",
                self.tables.session_track_events
            );
            if after.is_some() {
                sql.push_str(" AND created_at > ?");
            }
            sql.push_str(" ORDER BY created_at DESC, id DESC");
            if limit > 0 {
                sql.push_str(&format!(" LIMIT {limit}"));
            }

            let mut query = sqlx::query_as::<_, (Json<TrackEvent>,)>(&sql)
                .bind(&key.app_name)
                .bind(&key.user_id)
                .bind(&key.session_id)
                .bind(&track);
            if let Some(after) = after {
                query = query.bind(after);
            }
            let rows = query
                .fetch_all(&self.pool)
                .await
                .map_err(|e| SessionError::db("get track events", e))?;

            let mut events: Vec<TrackEvent> = rows.into_iter().map(|(Json(e),)| e).collect();
            events.reverse();
            tracks.insert(track.clone(), TrackEvents { track, events });
        }
        Ok(tracks)
    }

    async fn refresh_session_ttl(&self, key: &SessionKey) -> Result<()> {
        let now = Store::now();
        sqlx::query(&format!(
            "UPDATE {} SET updated_at = GREATEST(updated_at, ?), expires_at = ? \
             WHERE app_name = ? AND user_id = ? AND session_id = ? AND deleted_at IS NULL",
            self.tables.session_states
        ))
        .bind(now)
        .bind(self.session_expires_at(now))
        .bind(&key.app_name)
        .bind(&key.user_id)
        .bind(&key.session_id)
        .execute(&self.pool)
        .await
        .map_err(|e| SessionError::db("refresh session ttl", e))?;
        Ok(())
    }

    // ========================================================================
    // WRITE
    // ========================================================================

    /// Delete the session row and everything it owns, atomically.
    pub async fn delete_session(&self, key: &SessionKey) -> Result<()> {
        key.check_session_key()?;
        let now = Store::now();
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| SessionError::db("begin delete session", e))?;
        for table in self.tables.session_owned() {
            let sql = if self.soft_delete() {
                format!(
                    "UPDATE {table} SET deleted_at = ? \
                     WHERE app_name = ? AND user_id = ? AND session_id = ? AND deleted_at IS NULL"
                )
            } else {
                format!("DELETE FROM {table} WHERE app_name = ? AND user_id = ? AND session_id = ?")
            };
            let mut query = sqlx::query(&sql);
            if self.soft_delete() {
                query = query.bind(now);
            }
            query
                .bind(&key.app_name)
                .bind(&key.user_id)
                .bind(&key.session_id)
                .execute(&mut *tx)
                .await
                .map_err(|e| SessionError::db(format!("delete from {table}"), e))?;
        }
        tx.commit()
            .await
            .map_err(|e| SessionError::db("commit delete session", e))?;
        tracing::debug!(session = %key, soft = self.soft_delete(), "session deleted");
        Ok(())
    }

    /// Merge `delta` into the stored session document.
    pub async fn update_session_state(&self, key: &SessionKey, delta: &StateMap) -> Result<()> {
        key.check_session_key()?;
        for k in delta.keys() {
            if is_reserved_scope_key(k) {
                let hint = if k.starts_with(APP_PREFIX) {
                    "UpdateAppState"
                } else {
                    "UpdateUserState"
                };
                return Err(SessionError::ReservedKey { key: k.clone(), hint });
            }
        }

        let now = Store::now();
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| SessionError::db("begin update session state", e))?;
        let row: Option<SessionRow> = sqlx::query_as(&format!(
                "SELECT state, created_at, updated_at FROM {} \
                 WHERE app_name = ? AND user_id = ? AND session_id = ? AND {ACTIVE_FILTER} FOR UPDATE",
                self.tables.session_states
            ))
            .bind(&key.app_name)
            .bind(&key.user_id)
            .bind(&key.session_id)
            .bind(now)
            .fetch_optional(&mut *tx)
            .await
            .map_err(|e| SessionError::db("get session state", e))?;
        let Some(row) = row else {
            return Err(SessionError::SessionNotFound);
        };

        let column_updated_at = row.2;
        let mut doc = state_doc(key, row);
        for (k, v) in delta {
            doc.state.insert(k.clone(), v.as_ref().map(|b| b.to_vec()));
        }
        doc.updated_at = next_update_time(doc.updated_at.max(column_updated_at));
        let raw = serde_json::to_string(&doc).map_err(|e| SessionError::serde("marshal session state", e))?;

        let mut sql = format!("UPDATE {} SET state = ?, updated_at = ?", self.tables.session_states);
        let expires_at = self.session_expires_at(now);
        if expires_at.is_some() {
            sql.push_str(", expires_at = ?");
        }
        sql.push_str(" WHERE app_name = ? AND user_id = ? AND session_id = ? AND deleted_at IS NULL");
        let mut query = sqlx::query(&sql).bind(raw).bind(doc.updated_at);
        if let Some(at) = expires_at {
            query = query.bind(at);
        }
        query
            .bind(&key.app_name)
            .bind(&key.user_id)
            .bind(&key.session_id)
            .execute(&mut *tx)
            .await
            .map_err(|e| SessionError::db("update session state", e))?;
        tx.commit()
            .await
            .map_err(|e| SessionError::db("commit update session state", e))?;
        Ok(())
    }
}

/// Decode the stored document; a NULL column yields an empty state stamped
/// with the row timestamps.
pub(super) fn state_doc(key: &SessionKey, row: SessionRow) -> SessionStateDoc {
    let (state, created_at, updated_at) = row;
    match state {
        Some(Json(doc)) => doc,
        None => SessionStateDoc {
            id: key.session_id.clone(),
            state: StateMap::new(),
            created_at,
            updated_at,
        },
    }
}

fn key_index(keys: &[SessionKey]) -> HashMap<(String, String, String), usize> {
    keys.iter()
        .enumerate()
        .map(|(i, k)| ((k.app_name.clone(), k.user_id.clone(), k.session_id.clone()), i))
        .collect()
}
