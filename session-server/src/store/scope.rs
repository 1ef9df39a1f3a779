use chrono::{DateTime, Utc};

use session_core::error::{Result, SessionError};
use session_core::models::state::{strip_app_prefix, strip_user_prefix};
use session_core::models::{StateMap, UserKey};

use super::{Store, ACTIVE_FILTER};

/// Which shared scope a key/value row belongs to.
#[derive(Debug, Clone, Copy)]
enum Scope<'a> {
    App(&'a str),
    User(&'a UserKey),
}

impl Scope<'_> {
    fn scope_filter(&self) -> &'static str {
        match self {
            Scope::App(_) => "app_name = ?",
            Scope::User(_) => "app_name = ? AND user_id = ?",
        }
    }

    fn label(&self) -> &'static str {
        match self {
            Scope::App(_) => "app state",
            Scope::User(_) => "user state",
        }
    }

    fn bind<'q, O>(
        &self,
        query: sqlx::query::QueryAs<'q, sqlx::MySql, O, sqlx::mysql::MySqlArguments>,
    ) -> sqlx::query::QueryAs<'q, sqlx::MySql, O, sqlx::mysql::MySqlArguments> {
        match *self {
            Scope::App(app) => query.bind(app.to_string()),
            Scope::User(user) => query.bind(user.app_name.clone()).bind(user.user_id.clone()),
        }
    }

    fn bind_exec<'q>(
        &self,
        query: sqlx::query::Query<'q, sqlx::MySql, sqlx::mysql::MySqlArguments>,
    ) -> sqlx::query::Query<'q, sqlx::MySql, sqlx::mysql::MySqlArguments> {
        match *self {
            Scope::App(app) => query.bind(app.to_string()),
            Scope::User(user) => query.bind(user.app_name.clone()).bind(user.user_id.clone()),
        }
    }
}

impl Store {
    // ========================================================================
    // APP STATE
    // ========================================================================

    pub async fn update_app_state(&self, app_name: &str, state: &StateMap) -> Result<()> {
        if app_name.is_empty() {
            return Err(SessionError::AppNameRequired);
        }
        let now = Store::now();
        let expires_at = self.app_state_expires_at(now);
        for (k, v) in state {
            self.upsert_scope_value(Scope::App(app_name), strip_app_prefix(k), v.as_deref(), now, expires_at)
                .await?;
        }
        Ok(())
    }

    pub async fn list_app_states(&self, app_name: &str) -> Result<StateMap> {
        if app_name.is_empty() {
            return Err(SessionError::AppNameRequired);
        }
        self.list_scope(Scope::App(app_name)).await
    }

    pub async fn delete_app_state(&self, app_name: &str, key: &str) -> Result<()> {
        if app_name.is_empty() {
            return Err(SessionError::AppNameRequired);
        }
        if key.is_empty() {
            return Err(SessionError::StateKeyRequired);
        }
        self.delete_scope_value(Scope::App(app_name), strip_app_prefix(key)).await
    }

    // ========================================================================
    // USER STATE
    // ========================================================================

    pub async fn update_user_state(&self, user: &UserKey, state: &StateMap) -> Result<()> {
        user.check()?;
        let now = Store::now();
        let expires_at = self.user_state_expires_at(now);
        for (k, v) in state {
            self.upsert_scope_value(Scope::User(user), strip_user_prefix(k), v.as_deref(), now, expires_at)
                .await?;
        }
        Ok(())
    }

    pub async fn list_user_states(&self, user: &UserKey) -> Result<StateMap> {
        user.check()?;
        self.list_scope(Scope::User(user)).await
    }

    pub async fn delete_user_state(&self, user: &UserKey, key: &str) -> Result<()> {
        user.check()?;
        if key.is_empty() {
            return Err(SessionError::StateKeyRequired);
        }
        self.delete_scope_value(Scope::User(user), strip_user_prefix(key)).await
    }

    // ========================================================================
    // SHARED
    // ========================================================================

    fn scope_table(&self, scope: Scope<'_>) -> &str {
        match scope {
            Scope::App(_) => &self.tables.app_states,
            Scope::User(_) => &self.tables.user_states,
        }
    }

    /// Look up the active row id, then UPDATE it or INSERT a new row. The
    /// unique index includes `deleted_at`, so ON DUPLICATE KEY cannot be used.
    async fn upsert_scope_value(
        &self,
        scope: Scope<'_>,
        key: &str,
        value: Option<&[u8]>,
        now: DateTime<Utc>,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<()> {
        let table = self.scope_table(scope);
        let existing: Option<(i64,)> = scope
            .bind(sqlx::query_as(&format!(
                "SELECT id FROM {table} WHERE {} AND `key` = ? AND deleted_at IS NULL LIMIT 1",
                scope.scope_filter()
            )))
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| SessionError::db(format!("get {} id", scope.label()), e))?;

        match existing {
            Some((id,)) => {
                sqlx::query(&format!(
                    "UPDATE {table} SET value = ?, updated_at = GREATEST(updated_at, ?), expires_at = ? \
                     WHERE id = ?"
                ))
                .bind(value)
                .bind(now)
                .bind(expires_at)
                .bind(id)
                .execute(&self.pool)
                .await
                .map_err(|e| SessionError::db(format!("update {}", scope.label()), e))?;
            }
            None => {
                let (columns, marks) = match scope {
                    Scope::App(_) => ("app_name", "?"),
                    Scope::User(_) => ("app_name, user_id", "?, ?"),
                };
                scope
                    .bind_exec(sqlx::query(&format!(
                        "INSERT INTO {table} ({columns}, `key`, value, created_at, updated_at, expires_at) \
                         VALUES ({marks}, ?, ?, ?, ?, ?)"
                    )))
                    .bind(key)
                    .bind(value)
                    .bind(now)
                    .bind(now)
                    .bind(expires_at)
                    .execute(&self.pool)
                    .await
                    .map_err(|e| SessionError::db(format!("insert {}", scope.label()), e))?;
            }
        }
        Ok(())
    }

    async fn list_scope(&self, scope: Scope<'_>) -> Result<StateMap> {
        let table = self.scope_table(scope);
        let rows: Vec<(String, Option<Vec<u8>>)> = scope
            .bind(sqlx::query_as(&format!(
                "SELECT `key`, value FROM {table} WHERE {} AND {ACTIVE_FILTER}",
                scope.scope_filter()
            )))
            .bind(Store::now())
            .fetch_all(&self.pool)
            .await
            .map_err(|e| SessionError::db(format!("list {}", scope.label()), e))?;
        Ok(rows.into_iter().collect())
    }

    async fn delete_scope_value(&self, scope: Scope<'_>, key: &str) -> Result<()> {
        let table = self.scope_table(scope);
        let sql = if self.soft_delete() {
            format!(
                "UPDATE {table} SET deleted_at = ? WHERE {} AND `key` = ? AND deleted_at IS NULL",
                scope.scope_filter()
            )
        } else {
            format!("DELETE FROM {table} WHERE {} AND `key` = ?", scope.scope_filter())
        };
        let mut query = sqlx::query(&sql);
        if self.soft_delete() {
            query = query.bind(Store::now());
        }
        scope
            .bind_exec(query)
            .bind(key)
            .execute(&self.pool)
            .await
            .map_err(|e| SessionError::db(format!("delete {}", scope.label()), e))?;
        Ok(())
    }
}
