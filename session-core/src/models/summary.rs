use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A generated summary of (part of) a session, keyed by filter key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Summary {
    pub summary: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub topics: Vec<String>,
    /// Timestamp of the newest event covered by this summary.
    pub updated_at: DateTime<Utc>,
}

impl Summary {
    pub fn new(summary: impl Into<String>, updated_at: DateTime<Utc>) -> Self {
        Self {
            summary: summary.into(),
            topics: Vec::new(),
            updated_at,
        }
    }
}
