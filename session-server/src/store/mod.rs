//! Synchronous MySQL paths behind the session service.
//!
//! `Store` owns the pool, the prefixed table names and the configuration.
//! Every method here runs to completion against the database; queuing and
//! hooks live in [`crate::service`].

mod events;
mod scope;
mod session;
mod sinks;
mod summary;

use chrono::{DateTime, Utc};
use sqlx::MySqlPool;
use std::sync::Arc;
use std::time::Duration;

use session_core::config::SessionStoreConfig;
use session_core::models::session::truncate_micros;
use session_core::models::GetOptions;

use crate::sql::TableNames;
use crate::subsystems::summarize::Summarizer;

pub use session::create_lock_name;

pub struct Store {
    pool: MySqlPool,
    config: SessionStoreConfig,
    tables: TableNames,
    summarizer: Option<Arc<dyn Summarizer>>,
}

impl Store {
    pub fn new(
        pool: MySqlPool,
        config: SessionStoreConfig,
        summarizer: Option<Arc<dyn Summarizer>>,
    ) -> Self {
        let tables = TableNames::new(&config.schema.table_prefix);
        Self {
            pool,
            config,
            tables,
            summarizer,
        }
    }

    pub fn pool(&self) -> &MySqlPool {
        &self.pool
    }

    pub fn config(&self) -> &SessionStoreConfig {
        &self.config
    }

    pub fn tables(&self) -> &TableNames {
        &self.tables
    }

    pub fn summarizer(&self) -> Option<&Arc<dyn Summarizer>> {
        self.summarizer.as_ref()
    }

    pub fn soft_delete(&self) -> bool {
        self.config.soft_delete
    }

    /// Current time at the column precision (microseconds).
    pub fn now() -> DateTime<Utc> {
        truncate_micros(Utc::now())
    }

    pub(crate) fn session_expires_at(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        expires_after(now, self.config.session_ttl())
    }

    pub(crate) fn app_state_expires_at(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        expires_after(now, self.config.app_state_ttl())
    }

    pub(crate) fn user_state_expires_at(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        expires_after(now, self.config.user_state_ttl())
    }

    /// Per-session event cap: the caller's limit, else the configured default.
    pub(crate) fn event_limit(&self, options: &GetOptions) -> usize {
        if options.event_limit > 0 {
            options.event_limit
        } else {
            self.config.session_event_limit
        }
    }

    /// Lower bound on event time: the caller's, else `now - session_ttl`.
    pub(crate) fn after_time(&self, options: &GetOptions, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        options
            .after_time
            .or_else(|| self.config.session_ttl().and_then(|ttl| now.checked_sub_signed(to_chrono(ttl))))
    }
}

pub(crate) fn to_chrono(d: Duration) -> chrono::Duration {
    chrono::Duration::microseconds(i64::try_from(d.as_micros()).unwrap_or(i64::MAX))
}

pub(crate) fn expires_after(now: DateTime<Utc>, ttl: Option<Duration>) -> Option<DateTime<Utc>> {
    ttl.and_then(|ttl| now.checked_add_signed(to_chrono(ttl)))
}

/// Active and not expired at `now`. Binds one timestamp.
pub(crate) const ACTIVE_FILTER: &str = "deleted_at IS NULL AND (expires_at IS NULL OR expires_at > ?)";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expires_after() {
        let now = Utc::now();
        assert_eq!(expires_after(now, None), None);
        assert_eq!(
            expires_after(now, Some(Duration::from_secs(60))),
            Some(now + chrono::Duration::seconds(60))
        );
    }

    #[test]
    fn test_to_chrono_saturates() {
        assert_eq!(to_chrono(Duration::from_millis(1500)), chrono::Duration::milliseconds(1500));
    }
}
