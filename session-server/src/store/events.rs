use chrono::{DateTime, Utc};
use sqlx::types::Json;
use sqlx::{MySql, Transaction};

use session_core::error::{Result, SessionError};
use session_core::models::session::{next_update_time, SessionStateDoc};
use session_core::models::track::ensure_track;
use session_core::models::{Event, Session, SessionKey, TrackEvent};

use super::session::{state_doc, SessionRow};
use super::Store;

/// Session row locked for the duration of an append.
struct LockedSession {
    doc: SessionStateDoc,
    expires_at: Option<DateTime<Utc>>,
}

impl Store {
    /// Apply the event's session-scope delta to the stored document and, for
    /// persistable events, append the event row. Both writes commit together.
    pub async fn append_event(&self, session: &Session, event: &Event) -> Result<()> {
        let key = session.key();
        key.check_session_key()?;
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| SessionError::db("begin append event", e))?;

        let mut locked = self.lock_session_row(&mut tx, &key).await?;
        event.apply_session_state_delta(&mut locked.doc.state);
        let now = Store::now();
        self.write_session_doc(&mut tx, &key, &mut locked, now).await?;

        if event.is_persistable() {
            let raw = serde_json::to_string(event).map_err(|e| SessionError::serde("marshal event", e))?;
            sqlx::query(&format!(
                "INSERT INTO {} (app_name, user_id, session_id, event, created_at, updated_at) \
                 VALUES (?, ?, ?, ?, ?, ?)",
                self.tables.session_events
            ))
            .bind(&key.app_name)
            .bind(&key.user_id)
            .bind(&key.session_id)
            .bind(raw)
            .bind(now)
            .bind(now)
            .execute(&mut *tx)
            .await
            .map_err(|e| SessionError::db("insert session event", e))?;
        }

        tx.commit()
            .await
            .map_err(|e| SessionError::db("commit append event", e))?;
        Ok(())
    }

    /// Record the track in the session's track index and append the track event.
    pub async fn append_track_event(&self, session: &Session, event: &TrackEvent) -> Result<()> {
        let key = session.key();
        key.check_session_key()?;
        if event.track.is_empty() {
            return Err(SessionError::Other("track name is required".to_string()));
        }
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| SessionError::db("begin append track event", e))?;

        let mut locked = self.lock_session_row(&mut tx, &key).await?;
        ensure_track(&mut locked.doc.state, &event.track)?;
        let now = Store::now();
        let expires_at = self.write_session_doc(&mut tx, &key, &mut locked, now).await?;

        let raw = serde_json::to_string(event).map_err(|e| SessionError::serde("marshal track event", e))?;
        sqlx::query(&format!(
            "INSERT INTO {} (app_name, user_id, session_id, track, event, created_at, updated_at, expires_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
            self.tables.session_track_events
        ))
        .bind(&key.app_name)
        .bind(&key.user_id)
        .bind(&key.session_id)
        .bind(&event.track)
        .bind(raw)
        .bind(now)
        .bind(now)
        .bind(expires_at)
        .execute(&mut *tx)
        .await
        .map_err(|e| SessionError::db("insert track event", e))?;

        tx.commit()
            .await
            .map_err(|e| SessionError::db("commit append track event", e))?;
        Ok(())
    }

    async fn lock_session_row(
        &self,
        tx: &mut Transaction<'static, MySql>,
        key: &SessionKey,
    ) -> Result<LockedSession> {
        let row: Option<(Option<Json<SessionStateDoc>>, DateTime<Utc>, DateTime<Utc>, Option<DateTime<Utc>>)> =
            sqlx::query_as(&format!(
                "SELECT state, created_at, updated_at, expires_at FROM {} \
                 WHERE app_name = ? AND user_id = ? AND session_id = ? AND deleted_at IS NULL FOR UPDATE",
                self.tables.session_states
            ))
            .bind(&key.app_name)
            .bind(&key.user_id)
            .bind(&key.session_id)
            .fetch_optional(&mut **tx)
            .await
            .map_err(|e| SessionError::db("get session state", e))?;

        let Some((state, created_at, updated_at, expires_at)) = row else {
            return Err(SessionError::SessionNotFound);
        };
        let row: SessionRow = (state, created_at, updated_at);
        let mut doc = state_doc(key, row);
        doc.updated_at = doc.updated_at.max(updated_at);
        Ok(LockedSession { doc, expires_at })
    }

    /// Write the document back with a strictly newer `updated_at` and a
    /// refreshed expiry. Returns the expiry written.
    async fn write_session_doc(
        &self,
        tx: &mut Transaction<'static, MySql>,
        key: &SessionKey,
        locked: &mut LockedSession,
        now: DateTime<Utc>,
    ) -> Result<Option<DateTime<Utc>>> {
        locked.doc.updated_at = next_update_time(locked.doc.updated_at);
        let expires_at = self.session_expires_at(now).or(locked.expires_at);
        let raw = serde_json::to_string(&locked.doc)
            .map_err(|e| SessionError::serde("marshal session state", e))?;
        sqlx::query(&format!(
            "UPDATE {} SET state = ?, updated_at = ?, expires_at = ? \
             WHERE app_name = ? AND user_id = ? AND session_id = ? AND deleted_at IS NULL",
            self.tables.session_states
        ))
        .bind(raw)
        .bind(locked.doc.updated_at)
        .bind(expires_at)
        .bind(&key.app_name)
        .bind(&key.user_id)
        .bind(&key.session_id)
        .execute(&mut **tx)
        .await
        .map_err(|e| SessionError::db("update session state", e))?;
        Ok(expires_at)
    }
}
