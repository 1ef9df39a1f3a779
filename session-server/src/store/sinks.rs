use async_trait::async_trait;

use session_core::error::Result;
use session_core::models::{Event, Session, TrackEvent};

use super::Store;
use crate::subsystems::persister::EventSink;
use crate::subsystems::summary_worker::{SummaryJob, SummaryJobHandler};

#[async_trait]
impl EventSink for Store {
    async fn persist_event(&self, session: &Session, event: &Event) -> Result<()> {
        self.append_event(session, event).await
    }

    async fn persist_track_event(&self, session: &Session, event: &TrackEvent) -> Result<()> {
        self.append_track_event(session, event).await
    }
}

#[async_trait]
impl SummaryJobHandler for Store {
    async fn handle(&self, job: SummaryJob) -> Result<()> {
        self.process_summary_job(job).await
    }
}
