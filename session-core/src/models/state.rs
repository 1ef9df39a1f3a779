//! Byte-valued state maps and the scope prefix convention.
//!
//! A session view carries three scopes in one flat map:
//! `app:k` (application scope), `user:k` (user scope) and bare `k`
//! (session scope). When keys collide the deeper scope wins:
//! session > user > app.

use std::collections::BTreeMap;

/// Values are optional so that an explicit `None` survives a round trip.
pub type StateMap = BTreeMap<String, Option<Vec<u8>>>;

pub const APP_PREFIX: &str = "app:";
pub const USER_PREFIX: &str = "user:";

/// Copies every value so the caller keeps no aliasing with stored state.
pub fn copy_state(state: &StateMap) -> StateMap {
    state
        .iter()
        .map(|(k, v)| (k.clone(), v.as_ref().map(|b| b.to_vec())))
        .collect()
}

/// Overlay `delta` on `target` value by value. `None` values are kept as `None`.
pub fn apply_delta(target: &mut StateMap, delta: &StateMap) {
    for (k, v) in delta {
        target.insert(k.clone(), v.clone());
    }
}

pub fn is_reserved_scope_key(key: &str) -> bool {
    key.starts_with(APP_PREFIX) || key.starts_with(USER_PREFIX)
}

pub fn strip_app_prefix(key: &str) -> &str {
    key.strip_prefix(APP_PREFIX).unwrap_or(key)
}

pub fn strip_user_prefix(key: &str) -> &str {
    key.strip_prefix(USER_PREFIX).unwrap_or(key)
}

/// Build the merged view: app entries as `app:k`, user entries as `user:k`,
/// then the session's own keys verbatim. Later writes win.
pub fn merge_scopes(app_state: &StateMap, user_state: &StateMap, session_state: &StateMap) -> StateMap {
    let mut merged = StateMap::new();
    for (k, v) in app_state {
        merged.insert(format!("{APP_PREFIX}{k}"), v.clone());
    }
    for (k, v) in user_state {
        merged.insert(format!("{USER_PREFIX}{k}"), v.clone());
    }
    for (k, v) in session_state {
        merged.insert(k.clone(), v.clone());
    }
    merged
}

/// Serde adapter storing byte values as base64 strings (or `null`).
pub mod base64_state {
    use super::StateMap;
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::de::Error as _;
    use serde::ser::SerializeMap;
    use serde::{Deserialize, Deserializer, Serializer};
    use std::collections::BTreeMap;

    pub fn serialize<S: Serializer>(map: &StateMap, serializer: S) -> Result<S::Ok, S::Error> {
        let mut out = serializer.serialize_map(Some(map.len()))?;
        for (k, v) in map {
            out.serialize_entry(k, &v.as_ref().map(|b| STANDARD.encode(b)))?;
        }
        out.end()
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<StateMap, D::Error> {
        let raw: Option<BTreeMap<String, Option<String>>> = Option::deserialize(deserializer)?;
        raw.unwrap_or_default()
            .into_iter()
            .map(|(k, v)| {
                let bytes = v
                    .map(|s| STANDARD.decode(s.as_bytes()))
                    .transpose()
                    .map_err(D::Error::custom)?;
                Ok((k, bytes))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bytes(s: &str) -> Option<Vec<u8>> {
        Some(s.as_bytes().to_vec())
    }

    #[test]
    fn test_merge_priority_session_over_user_over_app() {
        let app = StateMap::from([("x".to_string(), bytes("A"))]);
        let user = StateMap::from([("x".to_string(), bytes("U"))]);
        let session = StateMap::from([("x".to_string(), bytes("S"))]);

        let merged = merge_scopes(&app, &user, &session);
        assert_eq!(merged.get("x"), Some(&bytes("S")));
        assert_eq!(merged.get("user:x"), Some(&bytes("U")));
        assert_eq!(merged.get("app:x"), Some(&bytes("A")));
    }

    #[test]
    fn test_merge_session_key_shadows_prefixed_scope() {
        // A session key that literally carries a scope prefix is written last.
        let user = StateMap::from([("k".to_string(), bytes("U"))]);
        let session = StateMap::from([("user:k".to_string(), bytes("S"))]);
        let merged = merge_scopes(&StateMap::new(), &user, &session);
        assert_eq!(merged.get("user:k"), Some(&bytes("S")));
    }

    #[test]
    fn test_apply_delta_preserves_none() {
        let mut state = StateMap::from([("a".to_string(), bytes("1"))]);
        let delta = StateMap::from([("a".to_string(), None), ("b".to_string(), bytes("2"))]);
        apply_delta(&mut state, &delta);
        assert_eq!(state.get("a"), Some(&None));
        assert_eq!(state.get("b"), Some(&bytes("2")));
    }

    #[test]
    fn test_prefix_helpers() {
        assert!(is_reserved_scope_key("app:x"));
        assert!(is_reserved_scope_key("user:x"));
        assert!(!is_reserved_scope_key("temp:x"));
        assert_eq!(strip_app_prefix("app:x"), "x");
        assert_eq!(strip_app_prefix("x"), "x");
        assert_eq!(strip_user_prefix("user:y"), "y");
    }

    #[test]
    fn test_base64_state_json_shape() {
        #[derive(serde::Serialize, serde::Deserialize)]
        struct Doc {
            #[serde(with = "base64_state")]
            state: StateMap,
        }
        let doc = Doc {
            state: StateMap::from([("k".to_string(), bytes("v")), ("n".to_string(), None)]),
        };
        let json = serde_json::to_value(&doc).unwrap();
        assert_eq!(json, serde_json::json!({"state": {"k": "dg==", "n": null}}));

        let back: Doc = serde_json::from_value(serde_json::json!({"state": null})).unwrap();
        assert!(back.state.is_empty());
    }
}
