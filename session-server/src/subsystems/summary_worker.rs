//! Summary worker pool
//!
//! M workers, each with its own bounded queue; jobs are routed by session
//! hash. Enqueueing never waits: when the queue is full or the pool is gone
//! the job is handed back so the caller can run it inline.

use async_trait::async_trait;
use std::sync::{Arc, RwLock};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::Instrument;

use session_core::error::Result;
use session_core::models::Session;

#[derive(Debug)]
pub struct SummaryJob {
    pub session: Session,
    pub filter_key: String,
    pub force: bool,
    /// Caller's span. The job keeps its values but has its own deadline.
    pub span: tracing::Span,
}

impl SummaryJob {
    pub fn new(session: Session, filter_key: impl Into<String>, force: bool) -> Self {
        Self {
            session,
            filter_key: filter_key.into(),
            force,
            span: tracing::Span::current(),
        }
    }
}

#[async_trait]
pub trait SummaryJobHandler: Send + Sync + 'static {
    async fn handle(&self, job: SummaryJob) -> Result<()>;
}

pub struct SummaryPool {
    senders: RwLock<Option<Vec<mpsc::Sender<SummaryJob>>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl SummaryPool {
    pub fn start<H: SummaryJobHandler>(handler: Arc<H>, workers: usize, queue_size: usize) -> Self {
        let workers = workers.max(1);
        let mut senders = Vec::with_capacity(workers);
        let mut handles = Vec::with_capacity(workers);
        for index in 0..workers {
            let (tx, rx) = mpsc::channel(queue_size.max(1));
            senders.push(tx);
            handles.push(tokio::spawn(run_worker(index, rx, handler.clone())));
        }
        tracing::info!(workers, queue_size, "summary worker pool started");
        Self {
            senders: RwLock::new(Some(senders)),
            workers: Mutex::new(handles),
        }
    }

    /// Queue without waiting. Returns the job when it could not be queued.
    pub fn try_enqueue(&self, job: SummaryJob) -> std::result::Result<(), SummaryJob> {
        let guard = match self.senders.read() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        let Some(senders) = guard.as_ref() else {
            return Err(job);
        };
        let index = job.session.route(senders.len());
        let Some(sender) = senders.get(index) else {
            return Err(job);
        };
        sender.try_send(job).map_err(|e| match e {
            mpsc::error::TrySendError::Full(job) | mpsc::error::TrySendError::Closed(job) => job,
        })
    }

    pub async fn close(&self) {
        let senders = match self.senders.write() {
            Ok(mut g) => g.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        drop(senders);

        let handles: Vec<JoinHandle<()>> = self.workers.lock().await.drain(..).collect();
        for handle in handles {
            if let Err(e) = handle.await {
                tracing::error!(error = %e, "summary worker panicked");
            }
        }
        tracing::info!("summary worker pool stopped");
    }
}

async fn run_worker<H: SummaryJobHandler>(index: usize, mut rx: mpsc::Receiver<SummaryJob>, handler: Arc<H>) {
    while let Some(job) = rx.recv().await {
        let span = job.span.clone();
        let session = job.session.key();
        let filter_key = job.filter_key.clone();
        if let Err(e) = handler.handle(job).instrument(span).await {
            tracing::warn!(
                worker = index,
                session = %session,
                filter_key = %filter_key,
                error = %e,
                "summary job failed"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use session_core::models::SessionKey;
    use std::sync::Mutex as StdMutex;
    use tokio::sync::Semaphore;

    #[derive(Default)]
    struct Collect {
        handled: StdMutex<Vec<String>>,
        gate: Option<Arc<Semaphore>>,
    }

    #[async_trait]
    impl SummaryJobHandler for Collect {
        async fn handle(&self, job: SummaryJob) -> Result<()> {
            if let Some(gate) = &self.gate {
                gate.acquire().await.unwrap().forget();
            }
            self.handled.lock().unwrap().push(format!("{}:{}", job.session.id, job.filter_key));
            Ok(())
        }
    }

    fn job(session: &str, filter_key: &str) -> SummaryJob {
        SummaryJob::new(Session::new(SessionKey::new("a", "u", session)), filter_key, false)
    }

    #[tokio::test]
    async fn test_jobs_are_processed_before_close_returns() {
        let handler = Arc::new(Collect::default());
        let pool = SummaryPool::start(handler.clone(), 3, 10);
        for i in 0..5 {
            assert!(pool.try_enqueue(job(&format!("s{i}"), "")).is_ok());
        }
        pool.close().await;
        assert_eq!(handler.handled.lock().unwrap().len(), 5);
    }

    #[tokio::test]
    async fn test_full_queue_hands_job_back() {
        let gate = Arc::new(Semaphore::new(0));
        let handler = Arc::new(Collect {
            gate: Some(gate.clone()),
            ..Default::default()
        });
        let pool = SummaryPool::start(handler.clone(), 1, 1);

        // One job may be taken by the worker, one sits in the queue, the rest overflow.
        let mut rejected = 0;
        for _ in 0..4 {
            if pool.try_enqueue(job("s", "k")).is_err() {
                rejected += 1;
            }
        }
        assert!(rejected >= 2);

        gate.add_permits(4);
        pool.close().await;
        assert!(handler.handled.lock().unwrap().len() <= 2);
    }

    #[tokio::test]
    async fn test_closed_pool_rejects() {
        let pool = SummaryPool::start(Arc::new(Collect::default()), 2, 4);
        pool.close().await;
        let back = pool.try_enqueue(job("s", "f")).unwrap_err();
        assert_eq!(back.filter_key, "f");
    }
}
