//! Delta summarization
//!
//! A summary for a filter key covers every matching event up to its
//! `updated_at`. A refresh only feeds the summarizer the events after that
//! point, prefixed by the previous summary text as a synthetic `system`
//! event, so long sessions never have to be re-read in full.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use session_core::error::Result;
use session_core::models::{Event, Session, Summary};

/// External summary generator.
#[async_trait]
pub trait Summarizer: Send + Sync {
    /// Cheap pre-check; a `false` skips the summarizer unless forced.
    fn should_summarize(&self, _session: &Session) -> bool {
        true
    }

    async fn summarize(&self, session: &Session) -> Result<String>;
}

pub const PREVIOUS_SUMMARY_AUTHOR: &str = "system";

/// Summarize what happened since the previous summary for `filter_key`.
/// Returns `None` when there is nothing new and `force` is off.
pub async fn summarize_delta(
    summarizer: &dyn Summarizer,
    session: &Session,
    filter_key: &str,
    force: bool,
) -> Result<Option<Summary>> {
    let previous = session.summaries.get(filter_key);
    let since = previous.map(|s| s.updated_at);
    let delta = session.events_for_summary(since, filter_key);
    if delta.is_empty() && !force {
        return Ok(None);
    }

    let input = delta_session(session, previous, &delta);
    if !force && !summarizer.should_summarize(&input) {
        tracing::debug!(session = %session.key(), filter_key, "summarizer declined");
        return Ok(None);
    }

    let text = summarizer.summarize(&input).await?;
    let updated_at = delta
        .last()
        .map(|e| e.timestamp)
        .or(since)
        .unwrap_or_else(Utc::now);
    Ok(Some(Summary::new(text, updated_at)))
}

/// A copy of `session` whose events are the previous summary (if any)
/// followed by `delta`.
fn delta_session(session: &Session, previous: Option<&Summary>, delta: &[Event]) -> Session {
    let mut events = Vec::with_capacity(delta.len() + 1);
    if let Some(prev) = previous.filter(|p| !p.summary.is_empty()) {
        events.push(previous_summary_event(&prev.summary, prev.updated_at));
    }
    events.extend(delta.iter().cloned());
    Session {
        events,
        ..session.clone()
    }
}

fn previous_summary_event(text: &str, at: DateTime<Utc>) -> Event {
    Event::new(PREVIOUS_SUMMARY_AUTHOR, serde_json::json!({ "content": text })).with_timestamp(at)
}
