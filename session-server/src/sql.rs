//! Prefixed table namespace and small SQL builders shared by the store,
//! the schema manager and the cleanup scheduler.

use session_core::models::SessionKey;

pub const TABLE_SESSION_STATES: &str = "session_states";
pub const TABLE_SESSION_EVENTS: &str = "session_events";
pub const TABLE_SESSION_TRACK_EVENTS: &str = "session_track_events";
pub const TABLE_SESSION_SUMMARIES: &str = "session_summaries";
pub const TABLE_APP_STATES: &str = "app_states";
pub const TABLE_USER_STATES: &str = "user_states";

/// Fully prefixed table names.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableNames {
    prefix: String,
    pub session_states: String,
    pub session_events: String,
    pub session_track_events: String,
    pub session_summaries: String,
    pub app_states: String,
    pub user_states: String,
}

impl TableNames {
    /// The prefix must already be validated.
    pub fn new(prefix: &str) -> Self {
        Self {
            prefix: prefix.to_string(),
            session_states: format!("{prefix}{TABLE_SESSION_STATES}"),
            session_events: format!("{prefix}{TABLE_SESSION_EVENTS}"),
            session_track_events: format!("{prefix}{TABLE_SESSION_TRACK_EVENTS}"),
            session_summaries: format!("{prefix}{TABLE_SESSION_SUMMARIES}"),
            app_states: format!("{prefix}{TABLE_APP_STATES}"),
            user_states: format!("{prefix}{TABLE_USER_STATES}"),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn full(&self, base: &str) -> String {
        format!("{}{}", self.prefix, base)
    }

    /// The four tables owned by a session, owner first.
    pub fn session_owned(&self) -> [&str; 4] {
        [
            &self.session_states,
            &self.session_summaries,
            &self.session_events,
            &self.session_track_events,
        ]
    }

    /// Index names are derived from the prefixed table: `idx_{table}_{suffix}`.
    pub fn index_name(&self, base: &str, suffix: &str) -> String {
        format!("idx_{}{}_{}", self.prefix, base, suffix)
    }
}

/// `(app_name, user_id, session_id) IN ((?, ?, ?), ...)` for `n` keys.
/// Callers bind app, user and session for each key in order.
pub fn session_key_in_clause(n: usize) -> String {
    let tuples = vec!["(?, ?, ?)"; n].join(", ");
    format!("(app_name, user_id, session_id) IN ({tuples})")
}

/// Bind every key of `keys` as an (app, user, session) triple.
pub fn bind_session_keys<'q, O>(
    mut query: sqlx::query::QueryAs<'q, sqlx::MySql, O, sqlx::mysql::MySqlArguments>,
    keys: &'q [SessionKey],
) -> sqlx::query::QueryAs<'q, sqlx::MySql, O, sqlx::mysql::MySqlArguments> {
    for key in keys {
        query = query
            .bind(key.app_name.as_str())
            .bind(key.user_id.as_str())
            .bind(key.session_id.as_str());
    }
    query
}

/// Same as [`bind_session_keys`] for statements without a result row type.
pub fn bind_session_keys_exec<'q>(
    mut query: sqlx::query::Query<'q, sqlx::MySql, sqlx::mysql::MySqlArguments>,
    keys: &'q [SessionKey],
) -> sqlx::query::Query<'q, sqlx::MySql, sqlx::mysql::MySqlArguments> {
    for key in keys {
        query = query
            .bind(key.app_name.as_str())
            .bind(key.user_id.as_str())
            .bind(key.session_id.as_str());
    }
    query
}
