use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::hash::Hasher;
use twox_hash::XxHash32;

use super::event::Event;
use super::key::SessionKey;
use super::state::{base64_state, copy_state, StateMap};
use super::summary::Summary;
use super::track::{ensure_track, TrackEvent, TrackEvents};
use crate::error::Result;

/// In-memory view of a session: its merged state, events, summaries and tracks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub id: String,
    pub app_name: String,
    pub user_id: String,
    #[serde(default, with = "base64_state")]
    pub state: StateMap,
    #[serde(default)]
    pub events: Vec<Event>,
    #[serde(default)]
    pub summaries: BTreeMap<String, Summary>,
    #[serde(default)]
    pub tracks: BTreeMap<String, TrackEvents>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// JSON document stored in `session_states.state`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionStateDoc {
    #[serde(default)]
    pub id: String,
    #[serde(default, with = "base64_state")]
    pub state: StateMap,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Read options for GetSession / ListSessions.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GetOptions {
    /// Most recent events to keep per session; 0 falls back to the configured default.
    #[serde(default)]
    pub event_limit: usize,
    /// Lower bound on event time; `None` defaults to `now - session_ttl` when a TTL is set.
    #[serde(default)]
    pub after_time: Option<DateTime<Utc>>,
}

impl GetOptions {
    pub fn with_event_limit(mut self, limit: usize) -> Self {
        self.event_limit = limit;
        self
    }

    pub fn with_after_time(mut self, after: DateTime<Utc>) -> Self {
        self.after_time = Some(after);
        self
    }
}

/// Builder for [`Session`].
#[derive(Debug, Clone)]
pub struct SessionOptions {
    key: SessionKey,
    state: StateMap,
    events: Vec<Event>,
    summaries: BTreeMap<String, Summary>,
    tracks: BTreeMap<String, TrackEvents>,
    created_at: Option<DateTime<Utc>>,
    updated_at: Option<DateTime<Utc>>,
}

impl SessionOptions {
    pub fn new(key: SessionKey) -> Self {
        Self {
            key,
            state: StateMap::new(),
            events: Vec::new(),
            summaries: BTreeMap::new(),
            tracks: BTreeMap::new(),
            created_at: None,
            updated_at: None,
        }
    }

    pub fn state(mut self, state: StateMap) -> Self {
        self.state = state;
        self
    }

    pub fn events(mut self, events: Vec<Event>) -> Self {
        self.events = events;
        self
    }

    pub fn summaries(mut self, summaries: BTreeMap<String, Summary>) -> Self {
        self.summaries = summaries;
        self
    }

    pub fn tracks(mut self, tracks: BTreeMap<String, TrackEvents>) -> Self {
        self.tracks = tracks;
        self
    }

    pub fn created_at(mut self, at: DateTime<Utc>) -> Self {
        self.created_at = Some(at);
        self
    }

    pub fn updated_at(mut self, at: DateTime<Utc>) -> Self {
        self.updated_at = Some(at);
        self
    }

    pub fn build(self) -> Session {
        let now = Utc::now();
        let created_at = self.created_at.unwrap_or(now);
        Session {
            id: self.key.session_id,
            app_name: self.key.app_name,
            user_id: self.key.user_id,
            state: self.state,
            events: self.events,
            summaries: self.summaries,
            tracks: self.tracks,
            created_at,
            updated_at: self.updated_at.unwrap_or(created_at),
        }
    }
}

impl Session {
    pub fn new(key: SessionKey) -> Self {
        SessionOptions::new(key).build()
    }

    pub fn builder(key: SessionKey) -> SessionOptions {
        SessionOptions::new(key)
    }

    pub fn key(&self) -> SessionKey {
        SessionKey::new(self.app_name.clone(), self.user_id.clone(), self.id.clone())
    }

    /// Stable 32-bit xxHash of `app:user:session`; used to route work to queues.
    pub fn hash(&self) -> u32 {
        let mut hasher = XxHash32::with_seed(0);
        hasher.write(self.key().joined().as_bytes());
        hasher.finish() as u32
    }

    /// Queue index for a pool of `n` workers.
    pub fn route(&self, n: usize) -> usize {
        if n == 0 {
            return 0;
        }
        self.hash() as usize % n
    }

    /// Fold an event into the in-memory view.
    pub fn apply_event(&mut self, event: &Event) {
        event.apply_state_delta(&mut self.state);
        if event.is_persistable() {
            self.events.push(event.clone());
        }
        self.updated_at = Utc::now();
    }

    /// Record a track event in memory and in the track index.
    pub fn apply_track_event(&mut self, event: &TrackEvent) -> Result<()> {
        ensure_track(&mut self.state, &event.track)?;
        self.tracks
            .entry(event.track.clone())
            .or_insert_with(|| TrackEvents {
                track: event.track.clone(),
                events: Vec::new(),
            })
            .events
            .push(event.clone());
        self.updated_at = Utc::now();
        Ok(())
    }

    /// Drop events older than `after` and keep at most the `limit` most recent.
    pub fn filter_events(&mut self, limit: usize, after: Option<DateTime<Utc>>) {
        self.events = filter_events(std::mem::take(&mut self.events), limit, after);
    }

    /// Events newer than `since` matching `filter_key`, in order.
    pub fn events_for_summary(&self, since: Option<DateTime<Utc>>, filter_key: &str) -> Vec<Event> {
        self.events
            .iter()
            .filter(|e| since.map_or(true, |s| e.timestamp > s))
            .filter(|e| e.matches_filter(filter_key))
            .cloned()
            .collect()
    }

    /// In-memory summary text: the requested key first, then the full-session
    /// summary. Summaries older than the session itself are stale.
    pub fn summary_text(&self, filter_key: &str) -> Option<String> {
        let fresh = |k: &str| {
            self.summaries
                .get(k)
                .filter(|s| s.updated_at >= self.created_at && !s.summary.is_empty())
                .map(|s| s.summary.clone())
        };
        fresh(filter_key).or_else(|| {
            if filter_key.is_empty() {
                None
            } else {
                fresh("")
            }
        })
    }

    /// A deep copy handed to background work.
    pub fn snapshot(&self) -> Session {
        Session {
            state: copy_state(&self.state),
            ..self.clone()
        }
    }
}

/// Keep events with `timestamp >= after`, then the last `limit` (0 = all).
pub fn filter_events(events: Vec<Event>, limit: usize, after: Option<DateTime<Utc>>) -> Vec<Event> {
    let mut kept: Vec<Event> = match after {
        Some(after) => events.into_iter().filter(|e| e.timestamp >= after).collect(),
        None => events,
    };
    if limit > 0 && kept.len() > limit {
        kept.drain(..kept.len() - limit);
    }
    kept
}

/// Next `updated_at` for a row: now, but strictly after `previous`, at microsecond resolution.
pub fn next_update_time(previous: DateTime<Utc>) -> DateTime<Utc> {
    let now = truncate_micros(Utc::now());
    let floor = truncate_micros(previous) + chrono::Duration::microseconds(1);
    now.max(floor)
}

pub fn truncate_micros(at: DateTime<Utc>) -> DateTime<Utc> {
    let nanos = at.timestamp_subsec_nanos();
    at - chrono::Duration::nanoseconds(i64::from(nanos % 1_000))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use serde_json::json;

    fn event_at(text: &str, at: DateTime<Utc>) -> Event {
        Event::new("user", json!(text)).with_timestamp(at)
    }

    #[test]
    fn test_hash_is_stable_and_routes_consistently() {
        let a = Session::new(SessionKey::new("app", "u", "s"));
        let b = Session::new(SessionKey::new("app", "u", "s"));
        let c = Session::new(SessionKey::new("app", "u", "s2"));
        assert_eq!(a.hash(), b.hash());
        assert_eq!(a.route(10), b.route(10));
        assert_ne!(a.hash(), c.hash());
        assert!(a.route(10) < 10);
        assert_eq!(a.route(0), 0);
    }

    #[test]
    fn test_apply_event_skips_partial() {
        let mut s = Session::new(SessionKey::new("a", "u", "s"));
        let full = Event::new("assistant", json!("hello"))
            .with_state_delta(StateMap::from([("k".to_string(), Some(b"v".to_vec()))]));
        let partial = Event::new("assistant", json!("hel")).with_partial(true);

        s.apply_event(&full);
        s.apply_event(&partial);
        assert_eq!(s.events.len(), 1);
        assert_eq!(s.state.get("k"), Some(&Some(b"v".to_vec())));
    }

    #[test]
    fn test_filter_events_by_time_then_limit() {
        let base = Utc::now();
        let events: Vec<Event> = (0..5)
            .map(|i| event_at(&format!("e{i}"), base + Duration::seconds(i)))
            .collect();

        let kept = filter_events(events.clone(), 2, Some(base + Duration::seconds(1)));
        assert_eq!(kept.len(), 2);
        assert_eq!(kept[0].content_text(), "e3");
        assert_eq!(kept[1].content_text(), "e4");

        assert_eq!(filter_events(events.clone(), 0, None).len(), 5);
        assert_eq!(filter_events(events, 0, Some(base + Duration::seconds(3))).len(), 2);
    }

    #[test]
    fn test_summary_text_prefers_requested_key() {
        let created = Utc::now() - Duration::minutes(5);
        let mut s = Session::builder(SessionKey::new("a", "u", "s"))
            .created_at(created)
            .build();
        s.summaries.insert("".into(), Summary::new("all", Utc::now()));
        assert_eq!(s.summary_text("tool").as_deref(), Some("all"));

        s.summaries.insert("tool".into(), Summary::new("tools only", Utc::now()));
        assert_eq!(s.summary_text("tool").as_deref(), Some("tools only"));

        s.summaries
            .insert("".into(), Summary::new("stale", created - Duration::minutes(1)));
        assert_eq!(s.summary_text(""), None);
    }

    #[test]
    fn test_apply_track_event_indexes_track() {
        let mut s = Session::new(SessionKey::new("a", "u", "s"));
        s.apply_track_event(&TrackEvent::new("telemetry", json!({"t": 1})))
            .unwrap();
        s.apply_track_event(&TrackEvent::new("telemetry", json!({"t": 2})))
            .unwrap();
        assert_eq!(s.tracks["telemetry"].events.len(), 2);
        assert_eq!(
            crate::models::track::tracks_from_state(&s.state).unwrap(),
            vec!["telemetry"]
        );
    }

    #[test]
    fn test_next_update_time_strictly_increases() {
        let future = Utc::now() + Duration::seconds(10);
        let next = next_update_time(future);
        assert!(next > future);
        assert_eq!(next.timestamp_subsec_nanos() % 1_000, 0);
    }

    #[test]
    fn test_state_doc_json_shape() {
        let at = DateTime::parse_from_rfc3339("2025-01-01T00:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        let doc = SessionStateDoc {
            id: "s".into(),
            state: StateMap::from([("k".to_string(), Some(b"v".to_vec()))]),
            created_at: at,
            updated_at: at,
        };
        let v = serde_json::to_value(&doc).unwrap();
        assert_eq!(v["id"], json!("s"));
        assert_eq!(v["state"]["k"], json!("dg=="));
        assert!(v.get("createdAt").is_some());
        assert!(v.get("updatedAt").is_some());
    }
}
