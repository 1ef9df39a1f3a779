use serde::{Deserialize, Serialize};

use crate::models::{Event, GetOptions, SessionKey, StateMap, TrackEvent, UserKey};
use crate::models::state::base64_state;

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum SessionRequest {
    Ping,
    Health,
    CreateSession {
        key: SessionKey,
        #[serde(default, with = "base64_state")]
        state: StateMap,
    },
    GetSession {
        key: SessionKey,
        #[serde(default)]
        options: GetOptions,
    },
    ListSessions {
        key: UserKey,
        #[serde(default)]
        options: GetOptions,
    },
    DeleteSession {
        key: SessionKey,
    },
    UpdateSessionState {
        key: SessionKey,
        #[serde(with = "base64_state")]
        state: StateMap,
    },
    UpdateAppState {
        app_name: String,
        #[serde(with = "base64_state")]
        state: StateMap,
    },
    ListAppStates {
        app_name: String,
    },
    DeleteAppState {
        app_name: String,
        key: String,
    },
    UpdateUserState {
        key: UserKey,
        #[serde(with = "base64_state")]
        state: StateMap,
    },
    ListUserStates {
        key: UserKey,
    },
    DeleteUserState {
        key: UserKey,
        state_key: String,
    },
    AppendEvent {
        key: SessionKey,
        event: Event,
    },
    AppendTrackEvent {
        key: SessionKey,
        event: TrackEvent,
    },
    GetSummaryText {
        key: SessionKey,
        #[serde(default)]
        filter_key: String,
    },
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct SessionResponse {
    pub status: String,
    pub data: Option<serde_json::Value>,
    pub error: Option<String>,
    pub version: String,
}

impl SessionResponse {
    pub fn ok(data: serde_json::Value) -> Self {
        Self {
            status: "ok".to_string(),
            data: Some(data),
            error: None,
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }

    pub fn err(msg: impl Into<String>) -> Self {
        Self {
            status: "error".to_string(),
            data: None,
            error: Some(msg.into()),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }

    pub fn pong() -> Self {
        Self::ok(serde_json::json!({"pong": true}))
    }
}
