use thiserror::Error;

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("appName is required")]
    AppNameRequired,

    #[error("userID is required")]
    UserIdRequired,

    #[error("sessionID is required")]
    SessionIdRequired,

    #[error("state key is required")]
    StateKeyRequired,

    #[error("{key} is not allowed, use {hint} instead")]
    ReservedKey { key: String, hint: &'static str },

    #[error("invalid table prefix {0:?}: must match [A-Za-z_][A-Za-z0-9_]*")]
    InvalidTablePrefix(String),

    #[error("session not found")]
    SessionNotFound,

    #[error("session already exists and has not expired")]
    SessionAlreadyExists,

    #[error("{context}: {source}")]
    Serialization {
        context: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("{op}: {source}")]
    Database {
        op: String,
        #[source]
        source: sqlx::Error,
    },

    #[error("schema error: {0}")]
    Schema(String),

    #[error("summarizer error: {0}")]
    Summarizer(String),

    #[error("service is closed")]
    Closed,

    #[error("Config error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("{context}: {source}")]
    Wrapped {
        context: String,
        #[source]
        source: Box<SessionError>,
    },

    #[error("Other error: {0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, SessionError>;

impl SessionError {
    /// Wrap a database failure with the operation that produced it.
    pub fn db(op: impl Into<String>, source: sqlx::Error) -> Self {
        SessionError::Database {
            op: op.into(),
            source,
        }
    }

    pub fn serde(context: impl Into<String>, source: serde_json::Error) -> Self {
        SessionError::Serialization {
            context: context.into(),
            source,
        }
    }

    /// Prefix the error with a human readable context, keeping the cause chain.
    pub fn context(self, context: impl Into<String>) -> Self {
        SessionError::Wrapped {
            context: context.into(),
            source: Box::new(self),
        }
    }

    /// The innermost error, skipping `Wrapped` layers.
    pub fn root(&self) -> &SessionError {
        match self {
            SessionError::Wrapped { source, .. } => source.root(),
            other => other,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self.root(), SessionError::SessionNotFound)
    }

    pub fn is_already_exists(&self) -> bool {
        matches!(self.root(), SessionError::SessionAlreadyExists)
    }
}

/// Attach context to a fallible result.
pub trait ResultExt<T> {
    fn context(self, context: impl Into<String>) -> Result<T>;
}

impl<T> ResultExt<T> for Result<T> {
    fn context(self, context: impl Into<String>) -> Result<T> {
        self.map_err(|e| e.context(context))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_context_keeps_root_and_message() {
        let err = SessionError::SessionNotFound
            .context("mysql session service update session state failed");
        assert_eq!(
            err.to_string(),
            "mysql session service update session state failed: session not found"
        );
        assert!(err.is_not_found());
        assert!(!err.is_already_exists());
    }

    #[test]
    fn test_reserved_key_message() {
        let err = SessionError::ReservedKey {
            key: "app:x".to_string(),
            hint: "UpdateAppState",
        };
        assert_eq!(err.to_string(), "app:x is not allowed, use UpdateAppState instead");
    }
}
