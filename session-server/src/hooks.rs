//! Interceptors around GetSession and AppendEvent.
//!
//! Hooks wrap the real operation in registration order: the first registered
//! hook is the outermost. A hook continues the chain with `next.run(ctx)` and
//! may short-circuit by returning without calling it.

use async_trait::async_trait;
use futures::future::BoxFuture;
use std::sync::Arc;

use session_core::error::Result;
use session_core::models::{Event, GetOptions, Session, SessionKey};

#[derive(Debug, Clone, Copy)]
pub struct GetSessionContext<'a> {
    pub key: &'a SessionKey,
    pub options: &'a GetOptions,
}

#[derive(Debug)]
pub struct AppendEventContext<'a> {
    pub session: &'a mut Session,
    pub event: &'a Event,
}

#[async_trait]
pub trait GetSessionHook: Send + Sync {
    async fn around<'a>(
        &'a self,
        ctx: GetSessionContext<'a>,
        next: GetSessionNext<'a>,
    ) -> Result<Option<Session>>;
}

#[async_trait]
pub trait AppendEventHook: Send + Sync {
    async fn around<'a>(&'a self, ctx: AppendEventContext<'a>, next: AppendEventNext<'a>) -> Result<()>;
}

type GetFinal<'a> =
    dyn Fn(GetSessionContext<'a>) -> BoxFuture<'a, Result<Option<Session>>> + Send + Sync + 'a;
type AppendFinal<'a> = dyn Fn(AppendEventContext<'a>) -> BoxFuture<'a, Result<()>> + Send + Sync + 'a;

/// Remaining GetSession chain.
pub struct GetSessionNext<'a> {
    hooks: &'a [Arc<dyn GetSessionHook>],
    last: &'a GetFinal<'a>,
}

impl<'a> GetSessionNext<'a> {
    pub fn new(hooks: &'a [Arc<dyn GetSessionHook>], last: &'a GetFinal<'a>) -> Self {
        Self { hooks, last }
    }

    pub fn run(self, ctx: GetSessionContext<'a>) -> BoxFuture<'a, Result<Option<Session>>> {
        match self.hooks.split_first() {
            Some((hook, rest)) => hook.around(
                ctx,
                GetSessionNext {
                    hooks: rest,
                    last: self.last,
                },
            ),
            None => (self.last)(ctx),
        }
    }
}

/// Remaining AppendEvent chain.
pub struct AppendEventNext<'a> {
    hooks: &'a [Arc<dyn AppendEventHook>],
    last: &'a AppendFinal<'a>,
}

impl<'a> AppendEventNext<'a> {
    pub fn new(hooks: &'a [Arc<dyn AppendEventHook>], last: &'a AppendFinal<'a>) -> Self {
        Self { hooks, last }
    }

    pub fn run(self, ctx: AppendEventContext<'a>) -> BoxFuture<'a, Result<()>> {
        match self.hooks.split_first() {
            Some((hook, rest)) => hook.around(
                ctx,
                AppendEventNext {
                    hooks: rest,
                    last: self.last,
                },
            ),
            None => (self.last)(ctx),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct Recorder {
        name: &'static str,
        log: Arc<Mutex<Vec<String>>>,
        short_circuit: bool,
    }

    #[async_trait]
    impl GetSessionHook for Recorder {
        async fn around<'a>(
            &'a self,
            ctx: GetSessionContext<'a>,
            next: GetSessionNext<'a>,
        ) -> Result<Option<Session>> {
            self.log.lock().unwrap().push(format!("{}:before", self.name));
            if self.short_circuit {
                return Ok(None);
            }
            let out = next.run(ctx).await;
            self.log.lock().unwrap().push(format!("{}:after", self.name));
            out
        }
    }

    #[async_trait]
    impl AppendEventHook for Recorder {
        async fn around<'a>(&'a self, ctx: AppendEventContext<'a>, next: AppendEventNext<'a>) -> Result<()> {
            ctx.session
                .state
                .insert(format!("temp:{}", self.name), Some(b"1".to_vec()));
            next.run(ctx).await
        }
    }

    fn recorder(name: &'static str, log: &Arc<Mutex<Vec<String>>>, short_circuit: bool) -> Arc<Recorder> {
        Arc::new(Recorder {
            name,
            log: log.clone(),
            short_circuit,
        })
    }

    #[tokio::test]
    async fn test_get_hooks_wrap_in_registration_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let hooks: Vec<Arc<dyn GetSessionHook>> =
            vec![recorder("outer", &log, false), recorder("inner", &log, false)];
        let key = SessionKey::new("a", "u", "s");
        let options = GetOptions::default();
        let final_log = log.clone();

        let out = GetSessionNext::new(&hooks, &|ctx| {
            final_log.lock().unwrap().push("final".to_string());
            let session = Session::new(ctx.key.clone());
            Box::pin(async move { Ok(Some(session)) })
        })
        .run(GetSessionContext {
            key: &key,
            options: &options,
        })
        .await
        .unwrap();

        assert!(out.is_some());
        assert_eq!(
            *log.lock().unwrap(),
            vec!["outer:before", "inner:before", "final", "inner:after", "outer:after"]
        );
    }

    #[tokio::test]
    async fn test_get_hook_short_circuit() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let hooks: Vec<Arc<dyn GetSessionHook>> =
            vec![recorder("stop", &log, true), recorder("never", &log, false)];
        let key = SessionKey::new("a", "u", "s");
        let options = GetOptions::default();

        let out = GetSessionNext::new(&hooks, &|_ctx| Box::pin(async { Err(session_core::SessionError::Closed) }))
            .run(GetSessionContext {
                key: &key,
                options: &options,
            })
            .await
            .unwrap();

        assert!(out.is_none());
        assert_eq!(*log.lock().unwrap(), vec!["stop:before"]);
    }

    #[tokio::test]
    async fn test_append_hooks_see_mutable_session() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let hooks: Vec<Arc<dyn AppendEventHook>> =
            vec![recorder("h1", &log, false), recorder("h2", &log, false)];
        let mut session = Session::new(SessionKey::new("a", "u", "s"));
        let event = Event::new("user", serde_json::json!("hi"));

        AppendEventNext::new(&hooks, &|ctx| {
            ctx.session.apply_event(ctx.event);
            Box::pin(async { Ok(()) })
        })
        .run(AppendEventContext {
            session: &mut session,
            event: &event,
        })
        .await
        .unwrap();

        assert!(session.state.contains_key("temp:h1"));
        assert!(session.state.contains_key("temp:h2"));
        assert_eq!(session.events.len(), 1);
    }
}
