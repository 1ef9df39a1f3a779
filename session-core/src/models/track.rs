//! Protocol-specific event sub-streams carried beside the main event log.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::state::StateMap;
use crate::error::{Result, SessionError};

/// State key holding the JSON array of track names known to a session.
pub const TRACKS_STATE_KEY: &str = "tracks";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackEvent {
    pub track: String,
    #[serde(default)]
    pub payload: serde_json::Value,
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
}

impl TrackEvent {
    pub fn new(track: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            track: track.into(),
            payload,
            timestamp: Utc::now(),
        }
    }
}

/// Events of one track in chronological order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TrackEvents {
    pub track: String,
    pub events: Vec<TrackEvent>,
}

/// Track names recorded in the state map. A missing or unreadable index is empty.
pub fn tracks_from_state(state: &StateMap) -> Result<Vec<String>> {
    match state.get(TRACKS_STATE_KEY) {
        Some(Some(raw)) if !raw.is_empty() => serde_json::from_slice(raw)
            .map_err(|e| SessionError::serde("decode track index", e)),
        _ => Ok(Vec::new()),
    }
}

/// Record `track` in the index. Returns false when it was already present.
pub fn ensure_track(state: &mut StateMap, track: &str) -> Result<bool> {
    let mut tracks = tracks_from_state(state)?;
    if tracks.iter().any(|t| t == track) {
        return Ok(false);
    }
    tracks.push(track.to_string());
    let raw = serde_json::to_vec(&tracks).map_err(|e| SessionError::serde("encode track index", e))?;
    state.insert(TRACKS_STATE_KEY.to_string(), Some(raw));
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_track_index() {
        let mut state = StateMap::new();
        assert!(tracks_from_state(&state).unwrap().is_empty());
        assert!(ensure_track(&mut state, "telemetry").unwrap());
        assert!(!ensure_track(&mut state, "telemetry").unwrap());
        assert!(ensure_track(&mut state, "ui").unwrap());
        assert_eq!(tracks_from_state(&state).unwrap(), vec!["telemetry", "ui"]);
        assert_eq!(
            state.get(TRACKS_STATE_KEY).cloned().flatten().unwrap(),
            br#"["telemetry","ui"]"#.to_vec()
        );
    }

    #[test]
    fn test_corrupt_index_is_an_error() {
        let mut state = StateMap::from([(TRACKS_STATE_KEY.to_string(), Some(b"{".to_vec()))]);
        assert!(ensure_track(&mut state, "x").is_err());
    }
}
