use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::state::{base64_state, is_reserved_scope_key, StateMap};

/// A response event. The store treats the payload as opaque JSON and only
/// looks at partiality, content validity, the state delta, the timestamp and
/// the filter key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub author: String,
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub partial: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<serde_json::Value>,
    #[serde(default, with = "base64_state", skip_serializing_if = "StateMap::is_empty")]
    pub state_delta: StateMap,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub filter_key: String,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl Event {
    pub fn new(author: impl Into<String>, response: serde_json::Value) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            author: author.into(),
            timestamp: Utc::now(),
            partial: false,
            response: Some(response),
            state_delta: StateMap::new(),
            filter_key: String::new(),
            extra: serde_json::Map::new(),
        }
    }

    pub fn with_partial(mut self, partial: bool) -> Self {
        self.partial = partial;
        self
    }

    pub fn with_state_delta(mut self, delta: StateMap) -> Self {
        self.state_delta = delta;
        self
    }

    pub fn with_filter_key(mut self, filter_key: impl Into<String>) -> Self {
        self.filter_key = filter_key.into();
        self
    }

    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn is_partial(&self) -> bool {
        self.partial
    }

    /// True when the response carries something worth persisting.
    pub fn has_valid_content(&self) -> bool {
        match &self.response {
            None | Some(serde_json::Value::Null) => false,
            Some(serde_json::Value::String(s)) => !s.is_empty(),
            Some(serde_json::Value::Array(a)) => !a.is_empty(),
            Some(serde_json::Value::Object(o)) => !o.is_empty(),
            Some(_) => true,
        }
    }

    /// Non-partial events with valid content are appended to the event log.
    pub fn is_persistable(&self) -> bool {
        !self.is_partial() && self.has_valid_content()
    }

    /// Apply every delta entry to `state`.
    pub fn apply_state_delta(&self, state: &mut StateMap) {
        for (k, v) in &self.state_delta {
            state.insert(k.clone(), v.clone());
        }
    }

    /// Apply only session-scope entries; `app:`/`user:` deltas belong to other scopes.
    pub fn apply_session_state_delta(&self, state: &mut StateMap) {
        for (k, v) in &self.state_delta {
            if is_reserved_scope_key(k) {
                continue;
            }
            state.insert(k.clone(), v.clone());
        }
    }

    /// Hierarchical filter match: an empty key matches everything, otherwise
    /// the event's key must equal it or live beneath it (`key/...`).
    pub fn matches_filter(&self, filter_key: &str) -> bool {
        if filter_key.is_empty() {
            return true;
        }
        self.filter_key == filter_key
            || self
                .filter_key
                .strip_prefix(filter_key)
                .is_some_and(|rest| rest.starts_with('/'))
    }

    /// Text content used by summarizers: a string response, or
    /// `response.content`, or the compact JSON of the response.
    pub fn content_text(&self) -> String {
        match &self.response {
            Some(serde_json::Value::String(s)) => s.clone(),
            Some(serde_json::Value::Object(o)) => match o.get("content") {
                Some(serde_json::Value::String(s)) => s.clone(),
                _ => serde_json::Value::Object(o.clone()).to_string(),
            },
            Some(other) => other.to_string(),
            None => String::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_persistable_predicates() {
        let e = Event::new("assistant", json!({"content": "hi"}));
        assert!(e.is_persistable());
        assert!(!e.clone().with_partial(true).is_persistable());

        let mut empty = e.clone();
        empty.response = Some(json!(""));
        assert!(!empty.has_valid_content());
        empty.response = None;
        assert!(!empty.has_valid_content());
    }

    #[test]
    fn test_session_delta_skips_reserved_scopes() {
        let delta = StateMap::from([
            ("k".to_string(), Some(b"v".to_vec())),
            ("app:a".to_string(), Some(b"x".to_vec())),
            ("user:u".to_string(), Some(b"y".to_vec())),
            ("temp:t".to_string(), Some(b"z".to_vec())),
        ]);
        let e = Event::new("assistant", json!("ok")).with_state_delta(delta);

        let mut state = StateMap::new();
        e.apply_session_state_delta(&mut state);
        assert_eq!(state.len(), 2);
        assert!(state.contains_key("k"));
        assert!(state.contains_key("temp:t"));

        let mut all = StateMap::new();
        e.apply_state_delta(&mut all);
        assert_eq!(all.len(), 4);
    }

    #[test]
    fn test_filter_matching() {
        let e = Event::new("a", json!("x")).with_filter_key("agent/tool");
        assert!(e.matches_filter(""));
        assert!(e.matches_filter("agent"));
        assert!(e.matches_filter("agent/tool"));
        assert!(!e.matches_filter("agen"));
        assert!(!e.matches_filter("other"));
    }

    #[test]
    fn test_unknown_fields_survive_roundtrip() {
        let raw = json!({
            "id": "e1",
            "author": "assistant",
            "timestamp": "2025-01-01T00:00:00Z",
            "response": {"content": "hello"},
            "invocationId": "inv-1"
        });
        let e: Event = serde_json::from_value(raw).unwrap();
        assert_eq!(e.extra.get("invocationId"), Some(&json!("inv-1")));
        assert_eq!(e.content_text(), "hello");
        let back = serde_json::to_value(&e).unwrap();
        assert_eq!(back["invocationId"], json!("inv-1"));
    }
}
