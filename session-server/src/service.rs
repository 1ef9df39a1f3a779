//! MySQL-backed session service.
//!
//! Foreground methods validate, run hooks, and either call the store
//! directly or hand work to the background subsystems. Every error returned
//! here is prefixed with the failing method.

use sqlx::MySqlPool;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;

use session_core::config::{validate_table_prefix, SessionStoreConfig};
use session_core::error::{Result, ResultExt, SessionError};
use session_core::models::{
    Event, GetOptions, Session, SessionKey, StateMap, Summary, TrackEvent, UserKey,
};

use crate::hooks::{
    AppendEventContext, AppendEventHook, AppendEventNext, GetSessionContext, GetSessionHook, GetSessionNext,
};
use crate::store::Store;
use crate::subsystems::cleanup::run_cleanup_loop;
use crate::subsystems::persister::{PersistJob, PersistKind, Persister};
use crate::subsystems::schema::{self, SchemaReport};
use crate::subsystems::summarize::Summarizer;
use crate::subsystems::summary_worker::{SummaryJob, SummaryPool};

const INIT_DB_TIMEOUT: Duration = Duration::from_secs(30);

pub struct SessionServiceBuilder {
    config: SessionStoreConfig,
    pool: Option<MySqlPool>,
    summarizer: Option<Arc<dyn Summarizer>>,
    get_hooks: Vec<Arc<dyn GetSessionHook>>,
    append_hooks: Vec<Arc<dyn AppendEventHook>>,
}

impl SessionServiceBuilder {
    pub fn new(config: SessionStoreConfig) -> Self {
        Self {
            config,
            pool: None,
            summarizer: None,
            get_hooks: Vec::new(),
            append_hooks: Vec::new(),
        }
    }

    /// Use an existing pool instead of connecting from the config.
    pub fn pool(mut self, pool: MySqlPool) -> Self {
        self.pool = Some(pool);
        self
    }

    pub fn summarizer(mut self, summarizer: Arc<dyn Summarizer>) -> Self {
        self.summarizer = Some(summarizer);
        self
    }

    pub fn get_session_hook(mut self, hook: Arc<dyn GetSessionHook>) -> Self {
        self.get_hooks.push(hook);
        self
    }

    pub fn append_event_hook(mut self, hook: Arc<dyn AppendEventHook>) -> Self {
        self.append_hooks.push(hook);
        self
    }

    pub async fn build(self) -> Result<SessionService> {
        let config = self.config;
        let pool = match self.pool {
            Some(pool) => {
                validate_table_prefix(&config.schema.table_prefix)?;
                pool
            }
            None => {
                config.validate()?;
                session_core::db::create_pool(&config.database).await?
            }
        };

        let store = Arc::new(Store::new(pool, config, self.summarizer));
        let cfg = store.config().clone();

        if !cfg.schema.skip_db_init {
            match tokio::time::timeout(INIT_DB_TIMEOUT, schema::init_schema(store.pool(), store.tables())).await {
                Ok(result) => {
                    result.context("init mysql session schema failed")?;
                }
                Err(_) => {
                    return Err(SessionError::Schema(format!(
                        "schema init timed out after {}s",
                        INIT_DB_TIMEOUT.as_secs()
                    )))
                }
            }
        }

        let (event_persister, track_persister) = if cfg.persistence.enable_async_persist {
            let n = cfg.async_persister_num();
            let buffer = cfg.chan_buffer_size();
            let timeout = cfg.async_persist_timeout();
            (
                Some(Persister::start("events", store.clone(), n, buffer, timeout)),
                Some(Persister::start("track_events", store.clone(), n, buffer, timeout)),
            )
        } else {
            (None, None)
        };

        let summary_pool = store
            .summarizer()
            .is_some()
            .then(|| SummaryPool::start(store.clone(), cfg.async_summary_num(), cfg.summary_queue_size()));

        let (shutdown, _) = broadcast::channel(1);
        let cleanup = cfg.cleanup_interval().map(|interval| {
            tokio::spawn(run_cleanup_loop(store.clone(), interval, shutdown.subscribe()))
        });

        tracing::info!(
            prefix = store.tables().prefix(),
            async_persist = cfg.persistence.enable_async_persist,
            summaries = summary_pool.is_some(),
            cleanup = cleanup.is_some(),
            "mysql session service ready"
        );

        Ok(SessionService {
            store,
            event_persister,
            track_persister,
            summary_pool,
            shutdown,
            cleanup: Mutex::new(cleanup),
            get_hooks: self.get_hooks,
            append_hooks: self.append_hooks,
            closed: AtomicBool::new(false),
        })
    }
}

pub struct SessionService {
    store: Arc<Store>,
    event_persister: Option<Persister>,
    track_persister: Option<Persister>,
    summary_pool: Option<SummaryPool>,
    shutdown: broadcast::Sender<()>,
    cleanup: Mutex<Option<JoinHandle<()>>>,
    get_hooks: Vec<Arc<dyn GetSessionHook>>,
    append_hooks: Vec<Arc<dyn AppendEventHook>>,
    closed: AtomicBool,
}

impl SessionService {
    pub fn builder(config: SessionStoreConfig) -> SessionServiceBuilder {
        SessionServiceBuilder::new(config)
    }

    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    pub fn pool(&self) -> &MySqlPool {
        self.store.pool()
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            Err(SessionError::Closed)
        } else {
            Ok(())
        }
    }

    // ========================================================================
    // SESSIONS
    // ========================================================================

    /// Create a session; the id is generated when `key.session_id` is empty.
    pub async fn create_session(&self, key: SessionKey, state: &StateMap) -> Result<Session> {
        self.ensure_open()?;
        self.store
            .create_session(key, state)
            .await
            .context("mysql session service create session failed")
    }

    /// `Ok(None)` when the session does not exist or has expired.
    pub async fn get_session(&self, key: &SessionKey, options: &GetOptions) -> Result<Option<Session>> {
        key.check_session_key()?;
        let store = &self.store;
        GetSessionNext::new(&self.get_hooks, &|ctx| {
            Box::pin(store.get_session(ctx.key, ctx.options))
        })
        .run(GetSessionContext { key, options })
        .await
        .context("mysql session service get session failed")
    }

    pub async fn list_sessions(&self, user: &UserKey, options: &GetOptions) -> Result<Vec<Session>> {
        self.store
            .list_sessions(user, options)
            .await
            .context("mysql session service list sessions failed")
    }

    pub async fn delete_session(&self, key: &SessionKey) -> Result<()> {
        self.store
            .delete_session(key)
            .await
            .context("mysql session service delete session failed")
    }

    /// Merge `delta` into the session's own state. `app:`/`user:` keys are rejected.
    pub async fn update_session_state(&self, key: &SessionKey, delta: &StateMap) -> Result<()> {
        self.store
            .update_session_state(key, delta)
            .await
            .context("mysql session service update session state failed")
    }

    // ========================================================================
    // APP / USER STATE
    // ========================================================================

    pub async fn update_app_state(&self, app_name: &str, state: &StateMap) -> Result<()> {
        self.store
            .update_app_state(app_name, state)
            .await
            .context("mysql session service update app state failed")
    }

    pub async fn list_app_states(&self, app_name: &str) -> Result<StateMap> {
        self.store
            .list_app_states(app_name)
            .await
            .context("mysql session service list app states failed")
    }

    pub async fn delete_app_state(&self, app_name: &str, key: &str) -> Result<()> {
        self.store
            .delete_app_state(app_name, key)
            .await
            .context("mysql session service delete app state failed")
    }

    pub async fn update_user_state(&self, user: &UserKey, state: &StateMap) -> Result<()> {
        self.store
            .update_user_state(user, state)
            .await
            .context("mysql session service update user state failed")
    }

    pub async fn list_user_states(&self, user: &UserKey) -> Result<StateMap> {
        self.store
            .list_user_states(user)
            .await
            .context("mysql session service list user states failed")
    }

    pub async fn delete_user_state(&self, user: &UserKey, key: &str) -> Result<()> {
        self.store
            .delete_user_state(user, key)
            .await
            .context("mysql session service delete user state failed")
    }

    // ========================================================================
    // EVENTS
    // ========================================================================

    /// Fold `event` into `session` and persist it, inline or through the
    /// write-behind queue.
    pub async fn append_event(&self, session: &mut Session, event: Event) -> Result<()> {
        self.ensure_open()?;
        session.key().check_session_key()?;
        let this = self;
        AppendEventNext::new(&self.append_hooks, &|ctx| {
            Box::pin(this.append_event_final(ctx.session, ctx.event))
        })
        .run(AppendEventContext {
            session,
            event: &event,
        })
        .await
        .context("mysql session service append event failed")
    }

    async fn append_event_final(&self, session: &mut Session, event: &Event) -> Result<()> {
        session.apply_event(event);
        match &self.event_persister {
            Some(persister) => {
                persister
                    .enqueue(PersistJob::new(session.snapshot(), PersistKind::Event(event.clone())))
                    .await
            }
            None => self.store.append_event(session, event).await,
        }
    }

    pub async fn append_track_event(&self, session: &mut Session, event: TrackEvent) -> Result<()> {
        self.ensure_open()?;
        session.key().check_session_key()?;
        session
            .apply_track_event(&event)
            .context("mysql session service append track event failed")?;
        let result = match &self.track_persister {
            Some(persister) => {
                persister
                    .enqueue(PersistJob::new(session.snapshot(), PersistKind::Track(event)))
                    .await
            }
            None => self.store.append_track_event(session, &event).await,
        };
        result.context("mysql session service append track event failed")
    }

    // ========================================================================
    // SUMMARIES
    // ========================================================================

    /// Summarize now and persist. Returns the new summary, if one was produced.
    pub async fn create_session_summary(
        &self,
        session: &Session,
        filter_key: &str,
        force: bool,
    ) -> Result<Option<Summary>> {
        self.store
            .create_session_summary(session, filter_key, force)
            .await
            .context("mysql session service create session summary failed")
    }

    /// Queue a summary job. When there is no pool, or its queue is full or
    /// closed, the job runs inline instead of being dropped.
    pub async fn enqueue_summary_job(&self, session: &Session, filter_key: &str, force: bool) -> Result<()> {
        self.ensure_open()?;
        if self.store.summarizer().is_none() {
            return Ok(());
        }
        session.key().check_session_key()?;
        let job = SummaryJob::new(session.snapshot(), filter_key, force);
        let job = match &self.summary_pool {
            Some(pool) => match pool.try_enqueue(job) {
                Ok(()) => return Ok(()),
                Err(job) => {
                    tracing::debug!(session = %session.key(), "summary queue unavailable, summarizing inline");
                    job
                }
            },
            None => job,
        };
        self.store
            .process_summary_job(job)
            .await
            .context("mysql session service enqueue summary job failed")
    }

    pub async fn get_session_summary_text(&self, session: &Session, filter_key: &str) -> Result<Option<String>> {
        self.store
            .get_session_summary_text(session, filter_key)
            .await
            .context("mysql session service get session summary text failed")
    }

    // ========================================================================
    // ADMIN
    // ========================================================================

    pub async fn verify_schema(&self) -> Result<SchemaReport> {
        schema::verify_schema(self.store.pool(), self.store.tables()).await
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Stop cleanup, drain the write-behind queues and the summary pool,
    /// then close the pool. Safe to call more than once.
    pub async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let _ = self.shutdown.send(());
        if let Some(handle) = self.cleanup.lock().await.take() {
            if let Err(e) = handle.await {
                tracing::error!(error = %e, "cleanup task panicked");
            }
        }
        if let Some(persister) = &self.event_persister {
            persister.close().await;
        }
        if let Some(persister) = &self.track_persister {
            persister.close().await;
        }
        if let Some(pool) = &self.summary_pool {
            pool.close().await;
        }
        self.store.pool().close().await;
        tracing::info!("mysql session service closed");
        Ok(())
    }
}
