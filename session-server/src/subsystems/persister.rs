//! Write-behind persistence
//!
//! N bounded queues, one worker each. A job is routed by the session hash, so
//! every append for one session lands on the same worker and is written in
//! FIFO order. Nothing is ordered across sessions.

use async_trait::async_trait;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::Instrument;

use session_core::error::Result;
use session_core::models::{Event, Session, TrackEvent};

/// The synchronous write path a worker replays.
#[async_trait]
pub trait EventSink: Send + Sync + 'static {
    async fn persist_event(&self, session: &Session, event: &Event) -> Result<()>;
    async fn persist_track_event(&self, session: &Session, event: &TrackEvent) -> Result<()>;
}

#[derive(Debug, Clone)]
pub enum PersistKind {
    Event(Event),
    Track(TrackEvent),
}

#[derive(Debug)]
pub struct PersistJob {
    pub session: Session,
    pub kind: PersistKind,
    /// Caller's span; the worker logs under it but is not bound by the caller's lifetime.
    pub span: tracing::Span,
}

impl PersistJob {
    pub fn new(session: Session, kind: PersistKind) -> Self {
        Self {
            session,
            kind,
            span: tracing::Span::current(),
        }
    }
}

pub struct Persister {
    name: &'static str,
    senders: RwLock<Option<Vec<mpsc::Sender<PersistJob>>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl Persister {
    /// Spawn `workers` queues of `buffer` slots each. Every job runs under `timeout`.
    pub fn start<S: EventSink>(
        name: &'static str,
        sink: Arc<S>,
        workers: usize,
        buffer: usize,
        timeout: Duration,
    ) -> Self {
        let workers = workers.max(1);
        let mut senders = Vec::with_capacity(workers);
        let mut handles = Vec::with_capacity(workers);
        for index in 0..workers {
            let (tx, rx) = mpsc::channel(buffer.max(1));
            senders.push(tx);
            handles.push(tokio::spawn(run_worker(name, index, rx, sink.clone(), timeout)));
        }
        tracing::info!(persister = name, workers, buffer, "async persister started");
        Self {
            name,
            senders: RwLock::new(Some(senders)),
            workers: Mutex::new(handles),
        }
    }

    pub fn worker_count(&self) -> usize {
        match self.senders.read() {
            Ok(guard) => guard.as_ref().map_or(0, Vec::len),
            Err(poisoned) => poisoned.into_inner().as_ref().map_or(0, Vec::len),
        }
    }

    /// Queue a job on the worker chosen by the session hash. Waits while the
    /// queue is full; dropping the returned future abandons the send. After
    /// [`Persister::close`] the job is logged and dropped.
    pub async fn enqueue(&self, job: PersistJob) -> Result<()> {
        let sender = {
            let guard = match self.senders.read() {
                Ok(g) => g,
                Err(poisoned) => poisoned.into_inner(),
            };
            guard.as_ref().and_then(|senders| {
                let index = job.session.route(senders.len());
                senders.get(index).cloned()
            })
        };

        let Some(sender) = sender else {
            tracing::warn!(persister = self.name, session = %job.session.key(), "persister closed, job dropped");
            return Ok(());
        };
        if let Err(e) = sender.send(job).await {
            tracing::warn!(
                persister = self.name,
                session = %e.0.session.key(),
                "persister queue closed, job dropped"
            );
        }
        Ok(())
    }

    /// Close every queue and wait for the workers to drain them.
    pub async fn close(&self) {
        let senders = match self.senders.write() {
            Ok(mut g) => g.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        drop(senders);

        let handles: Vec<JoinHandle<()>> = self.workers.lock().await.drain(..).collect();
        for handle in handles {
            if let Err(e) = handle.await {
                tracing::error!(persister = self.name, error = %e, "persister worker panicked");
            }
        }
        tracing::info!(persister = self.name, "async persister stopped");
    }
}

async fn run_worker<S: EventSink>(
    name: &'static str,
    index: usize,
    mut rx: mpsc::Receiver<PersistJob>,
    sink: Arc<S>,
    timeout: Duration,
) {
    while let Some(job) = rx.recv().await {
        let span = job.span.clone();
        async {
            let work = async {
                match &job.kind {
                    PersistKind::Event(event) => sink.persist_event(&job.session, event).await,
                    PersistKind::Track(event) => sink.persist_track_event(&job.session, event).await,
                }
            };
            match tokio::time::timeout(timeout, work).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => tracing::error!(
                    persister = name,
                    worker = index,
                    session = %job.session.key(),
                    error = %e,
                    "async persist failed"
                ),
                Err(_) => tracing::error!(
                    persister = name,
                    worker = index,
                    session = %job.session.key(),
                    timeout_secs = timeout.as_secs(),
                    "async persist timed out"
                ),
            }
        }
        .instrument(span)
        .await;
    }
    tracing::debug!(persister = name, worker = index, "persister worker exited");
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use session_core::models::SessionKey;
    use std::sync::Mutex as StdMutex;

    #[derive(Default)]
    struct Recording {
        writes: StdMutex<Vec<(String, String)>>,
    }

    #[async_trait]
    impl EventSink for Recording {
        async fn persist_event(&self, session: &Session, event: &Event) -> Result<()> {
            tokio::task::yield_now().await;
            self.writes
                .lock()
                .unwrap()
                .push((session.id.clone(), event.content_text()));
            Ok(())
        }

        async fn persist_track_event(&self, session: &Session, event: &TrackEvent) -> Result<()> {
            self.writes
                .lock()
                .unwrap()
                .push((session.id.clone(), format!("track:{}", event.track)));
            Ok(())
        }
    }

    fn job(session: &str, text: String) -> PersistJob {
        PersistJob::new(
            Session::new(SessionKey::new("app", "user", session)),
            PersistKind::Event(Event::new("user", json!(text))),
        )
    }

    #[tokio::test]
    async fn test_per_session_fifo_after_close() {
        let sink = Arc::new(Recording::default());
        let persister = Persister::start("events", sink.clone(), 4, 8, Duration::from_secs(5));

        for i in 0..100 {
            persister.enqueue(job("s1", format!("a{i}"))).await.unwrap();
            persister.enqueue(job("s2", format!("b{i}"))).await.unwrap();
        }
        persister.close().await;

        let writes = sink.writes.lock().unwrap();
        let s1: Vec<&str> = writes.iter().filter(|(s, _)| s == "s1").map(|(_, t)| t.as_str()).collect();
        let expected: Vec<String> = (0..100).map(|i| format!("a{i}")).collect();
        assert_eq!(s1, expected);
        assert_eq!(writes.len(), 200);
    }

    #[tokio::test]
    async fn test_close_is_idempotent_and_enqueue_after_close_is_dropped() {
        let sink = Arc::new(Recording::default());
        let persister = Persister::start("events", sink.clone(), 2, 1, Duration::from_secs(5));
        persister.close().await;
        persister.close().await;

        persister.enqueue(job("s1", "late".to_string())).await.unwrap();
        assert!(sink.writes.lock().unwrap().is_empty());
        assert_eq!(persister.worker_count(), 0);
    }

    #[tokio::test]
    async fn test_track_jobs_reach_sink() {
        let sink = Arc::new(Recording::default());
        let persister = Persister::start("tracks", sink.clone(), 1, 4, Duration::from_secs(5));
        persister
            .enqueue(PersistJob::new(
                Session::new(SessionKey::new("a", "u", "s")),
                PersistKind::Track(TrackEvent::new("telemetry", json!({}))),
            ))
            .await
            .unwrap();
        persister.close().await;
        assert_eq!(
            *sink.writes.lock().unwrap(),
            vec![("s".to_string(), "track:telemetry".to_string())]
        );
    }
}
