use config::{Config, Environment, File};
use regex::Regex;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::sync::OnceLock;
use std::time::Duration;

use crate::error::{Result, SessionError};

pub const DEFAULT_SESSION_EVENT_LIMIT: usize = 1000;
pub const DEFAULT_ASYNC_PERSISTER_NUM: usize = 10;
pub const DEFAULT_CHAN_BUFFER_SIZE: usize = 100;
pub const DEFAULT_ASYNC_PERSIST_TIMEOUT_SECS: u64 = 5;
pub const DEFAULT_ASYNC_SUMMARY_NUM: usize = 3;
pub const DEFAULT_SUMMARY_QUEUE_SIZE: usize = 100;
pub const DEFAULT_SUMMARY_JOB_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_CLEANUP_INTERVAL_SECS: u64 = 300;

#[derive(Debug, Deserialize, Clone)]
pub struct SessionStoreConfig {
    #[serde(default)]
    pub service: ServiceConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub persistence: PersistenceConfig,
    #[serde(default)]
    pub summary: SummaryConfig,
    #[serde(default)]
    pub ttl: TtlConfig,
    #[serde(default)]
    pub cleanup: CleanupConfig,
    #[serde(default)]
    pub schema: SchemaConfig,
    #[serde(default = "default_true")]
    pub soft_delete: bool,
    #[serde(default = "default_session_event_limit")]
    pub session_event_limit: usize,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServiceConfig {
    pub socket_path: String,
    pub log_level: String,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            socket_path: "/tmp/session-store.sock".to_string(),
            log_level: "info".to_string(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct DatabaseConfig {
    #[serde(default)]
    pub dsn: Option<String>,
    #[serde(default)]
    pub instance_name: Option<String>,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    /// Driver options appended to the DSN as query parameters.
    #[serde(default)]
    pub extra_options: BTreeMap<String, String>,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            dsn: None,
            instance_name: None,
            max_connections: default_max_connections(),
            extra_options: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct PersistenceConfig {
    #[serde(default)]
    pub enable_async_persist: bool,
    #[serde(default = "default_async_persister_num")]
    pub async_persister_num: usize,
    #[serde(default = "default_chan_buffer_size")]
    pub chan_buffer_size: usize,
    #[serde(default = "default_async_persist_timeout_secs")]
    pub async_persist_timeout_secs: u64,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            enable_async_persist: false,
            async_persister_num: DEFAULT_ASYNC_PERSISTER_NUM,
            chan_buffer_size: DEFAULT_CHAN_BUFFER_SIZE,
            async_persist_timeout_secs: DEFAULT_ASYNC_PERSIST_TIMEOUT_SECS,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct SummaryConfig {
    #[serde(default = "default_async_summary_num")]
    pub async_summary_num: usize,
    #[serde(default = "default_summary_queue_size")]
    pub summary_queue_size: usize,
    #[serde(default = "default_summary_job_timeout_secs")]
    pub summary_job_timeout_secs: u64,
}

impl Default for SummaryConfig {
    fn default() -> Self {
        Self {
            async_summary_num: DEFAULT_ASYNC_SUMMARY_NUM,
            summary_queue_size: DEFAULT_SUMMARY_QUEUE_SIZE,
            summary_job_timeout_secs: DEFAULT_SUMMARY_JOB_TIMEOUT_SECS,
        }
    }
}

/// Time-to-live per scope, in seconds. 0 means rows never expire.
#[derive(Debug, Deserialize, Clone, Default)]
pub struct TtlConfig {
    #[serde(default)]
    pub session_ttl_secs: u64,
    #[serde(default)]
    pub app_state_ttl_secs: u64,
    #[serde(default)]
    pub user_state_ttl_secs: u64,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct CleanupConfig {
    /// 0 keeps the 5 minute default.
    #[serde(default)]
    pub interval_secs: u64,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct SchemaConfig {
    #[serde(default)]
    pub table_prefix: String,
    #[serde(default)]
    pub skip_db_init: bool,
}

fn default_true() -> bool {
    true
}
fn default_session_event_limit() -> usize {
    DEFAULT_SESSION_EVENT_LIMIT
}
fn default_max_connections() -> u32 {
    10
}
fn default_async_persister_num() -> usize {
    DEFAULT_ASYNC_PERSISTER_NUM
}
fn default_chan_buffer_size() -> usize {
    DEFAULT_CHAN_BUFFER_SIZE
}
fn default_async_persist_timeout_secs() -> u64 {
    DEFAULT_ASYNC_PERSIST_TIMEOUT_SECS
}
fn default_async_summary_num() -> usize {
    DEFAULT_ASYNC_SUMMARY_NUM
}
fn default_summary_queue_size() -> usize {
    DEFAULT_SUMMARY_QUEUE_SIZE
}
fn default_summary_job_timeout_secs() -> u64 {
    DEFAULT_SUMMARY_JOB_TIMEOUT_SECS
}

impl Default for SessionStoreConfig {
    fn default() -> Self {
        Self {
            service: ServiceConfig::default(),
            database: DatabaseConfig::default(),
            persistence: PersistenceConfig::default(),
            summary: SummaryConfig::default(),
            ttl: TtlConfig::default(),
            cleanup: CleanupConfig::default(),
            schema: SchemaConfig::default(),
            soft_delete: true,
            session_event_limit: DEFAULT_SESSION_EVENT_LIMIT,
        }
    }
}

fn table_prefix_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").expect("static regex"))
}

/// An empty prefix is valid and means "no prefix".
pub fn validate_table_prefix(prefix: &str) -> Result<()> {
    if prefix.is_empty() || table_prefix_regex().is_match(prefix) {
        Ok(())
    } else {
        Err(SessionError::InvalidTablePrefix(prefix.to_string()))
    }
}

impl SessionStoreConfig {
    /// Load from a TOML file, then apply `SESSION_STORE__SECTION__KEY` overrides.
    pub fn load(path: &str) -> Result<Self> {
        let s = Config::builder()
            .add_source(File::with_name(path).required(false))
            .add_source(
                Environment::with_prefix("SESSION_STORE")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;
        let cfg: Self = s.try_deserialize()?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn with_dsn(mut self, dsn: impl Into<String>) -> Self {
        self.database.dsn = Some(dsn.into());
        self
    }

    pub fn with_instance_name(mut self, name: impl Into<String>) -> Self {
        self.database.instance_name = Some(name.into());
        self
    }

    pub fn with_extra_option(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.database.extra_options.insert(key.into(), value.into());
        self
    }

    pub fn with_async_persist(mut self, enabled: bool) -> Self {
        self.persistence.enable_async_persist = enabled;
        self
    }

    pub fn with_async_persister_num(mut self, n: usize) -> Self {
        self.persistence.async_persister_num = n;
        self
    }

    pub fn with_session_ttl(mut self, ttl: Duration) -> Self {
        self.ttl.session_ttl_secs = ceil_secs(ttl);
        self
    }

    pub fn with_app_state_ttl(mut self, ttl: Duration) -> Self {
        self.ttl.app_state_ttl_secs = ceil_secs(ttl);
        self
    }

    pub fn with_user_state_ttl(mut self, ttl: Duration) -> Self {
        self.ttl.user_state_ttl_secs = ceil_secs(ttl);
        self
    }

    pub fn with_cleanup_interval(mut self, interval: Duration) -> Self {
        self.cleanup.interval_secs = ceil_secs(interval);
        self
    }

    pub fn with_soft_delete(mut self, soft: bool) -> Self {
        self.soft_delete = soft;
        self
    }

    pub fn with_session_event_limit(mut self, limit: usize) -> Self {
        self.session_event_limit = limit;
        self
    }

    pub fn with_skip_db_init(mut self, skip: bool) -> Self {
        self.schema.skip_db_init = skip;
        self
    }

    /// # Panics
    /// Panics when `prefix` is not a valid SQL identifier prefix.
    pub fn with_table_prefix(mut self, prefix: impl Into<String>) -> Self {
        let prefix = prefix.into();
        if let Err(e) = validate_table_prefix(&prefix) {
            panic!("{e}");
        }
        self.schema.table_prefix = prefix;
        self
    }

    pub fn validate(&self) -> Result<()> {
        let has_dsn = self.database.dsn.as_deref().is_some_and(|s| !s.is_empty());
        let has_instance = self
            .database
            .instance_name
            .as_deref()
            .is_some_and(|s| !s.is_empty());
        if has_dsn && has_instance {
            return Err(SessionError::Other(
                "database.dsn and database.instance_name are mutually exclusive".to_string(),
            ));
        }
        if !has_dsn && !has_instance {
            return Err(SessionError::Other(
                "one of database.dsn or database.instance_name is required".to_string(),
            ));
        }
        validate_table_prefix(&self.schema.table_prefix)
    }

    pub fn session_ttl(&self) -> Option<Duration> {
        non_zero(self.ttl.session_ttl_secs)
    }

    pub fn app_state_ttl(&self) -> Option<Duration> {
        non_zero(self.ttl.app_state_ttl_secs)
    }

    pub fn user_state_ttl(&self) -> Option<Duration> {
        non_zero(self.ttl.user_state_ttl_secs)
    }

    /// Non-positive worker counts are coerced to the default.
    pub fn async_persister_num(&self) -> usize {
        if self.persistence.async_persister_num == 0 {
            DEFAULT_ASYNC_PERSISTER_NUM
        } else {
            self.persistence.async_persister_num
        }
    }

    pub fn chan_buffer_size(&self) -> usize {
        self.persistence.chan_buffer_size.max(1)
    }

    pub fn async_persist_timeout(&self) -> Duration {
        Duration::from_secs(self.persistence.async_persist_timeout_secs.max(1))
    }

    pub fn async_summary_num(&self) -> usize {
        if self.summary.async_summary_num == 0 {
            DEFAULT_ASYNC_SUMMARY_NUM
        } else {
            self.summary.async_summary_num
        }
    }

    pub fn summary_queue_size(&self) -> usize {
        self.summary.summary_queue_size.max(1)
    }

    pub fn summary_job_timeout(&self) -> Duration {
        Duration::from_secs(self.summary.summary_job_timeout_secs.max(1))
    }

    /// Cleanup runs only when some TTL is configured.
    pub fn cleanup_interval(&self) -> Option<Duration> {
        if self.session_ttl().is_none()
            && self.app_state_ttl().is_none()
            && self.user_state_ttl().is_none()
        {
            return None;
        }
        let secs = if self.cleanup.interval_secs == 0 {
            DEFAULT_CLEANUP_INTERVAL_SECS
        } else {
            self.cleanup.interval_secs
        };
        Some(Duration::from_secs(secs))
    }
}

/// Whole seconds, rounded up so a non-zero duration never becomes "disabled".
fn ceil_secs(d: Duration) -> u64 {
    d.as_secs() + u64::from(d.subsec_nanos() > 0)
}

fn non_zero(secs: u64) -> Option<Duration> {
    (secs > 0).then(|| Duration::from_secs(secs))
}
