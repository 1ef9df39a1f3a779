use crate::config::DatabaseConfig;
use crate::error::{Result, SessionError};
use sqlx::mysql::{MySqlPool, MySqlPoolOptions};
use std::collections::HashMap;
use std::sync::{OnceLock, RwLock};
use std::time::Duration;
use tokio_retry::strategy::{jitter, ExponentialBackoff};
use tokio_retry::Retry;

const CONNECT_RETRIES: usize = 3;

fn registry() -> &'static RwLock<HashMap<String, String>> {
    static INSTANCES: OnceLock<RwLock<HashMap<String, String>>> = OnceLock::new();
    INSTANCES.get_or_init(|| RwLock::new(HashMap::new()))
}

/// Register a named MySQL instance so configs can refer to it by name.
pub fn register_instance(name: impl Into<String>, dsn: impl Into<String>) {
    let mut guard = match registry().write() {
        Ok(g) => g,
        Err(poisoned) => poisoned.into_inner(),
    };
    guard.insert(name.into(), dsn.into());
}

pub fn lookup_instance(name: &str) -> Option<String> {
    let guard = match registry().read() {
        Ok(g) => g,
        Err(poisoned) => poisoned.into_inner(),
    };
    guard.get(name).cloned()
}

/// Resolve the connection string from either the DSN or a registered
/// instance name, then append `extra_options` as query parameters.
pub fn resolve_dsn(config: &DatabaseConfig) -> Result<String> {
    let base = match (&config.dsn, &config.instance_name) {
        (Some(dsn), _) if !dsn.is_empty() => dsn.clone(),
        (_, Some(name)) if !name.is_empty() => lookup_instance(name)
            .ok_or_else(|| SessionError::Other(format!("mysql instance {name} not found")))?,
        _ => {
            return Err(SessionError::Other(
                "one of database.dsn or database.instance_name is required".to_string(),
            ))
        }
    };

    if config.extra_options.is_empty() {
        return Ok(base);
    }
    let params = config
        .extra_options
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join("&");
    let sep = if base.contains('?') { '&' } else { '?' };
    Ok(format!("{base}{sep}{params}"))
}

pub async fn create_pool(config: &DatabaseConfig) -> Result<MySqlPool> {
    let dsn = resolve_dsn(config)?;
    let retry_strategy = ExponentialBackoff::from_millis(200)
        .max_delay(Duration::from_secs(5))
        .map(jitter)
        .take(CONNECT_RETRIES);

    let result = Retry::spawn(retry_strategy, || {
        MySqlPoolOptions::new()
            .max_connections(config.max_connections.max(1))
            .connect(&dsn)
    })
    .await;

    result.map_err(|e| {
        tracing::error!(attempts = CONNECT_RETRIES, error = %e, "MySQL connection failed");
        SessionError::db("create mysql client", e)
    })
}

pub async fn health_check(pool: &MySqlPool) -> Result<String> {
    let row: (String,) = sqlx::query_as("SELECT VERSION()")
        .fetch_one(pool)
        .await
        .map_err(|e| SessionError::db("health check", e))?;
    Ok(row.0)
}
