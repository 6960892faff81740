//! Shared fixtures for session scenarios driven by the scripted mock engine.

#![allow(dead_code)]

use std::sync::Arc;

use parking_lot::Mutex;
use parley_core::ErrorEvent;
use parley_router::SessionHooks;
use parley_session::{RealtimeSession, SessionOptions};
use parley_settings::SessionSettings;
use parley_transport::mock::{MediaOutcome, MockEngine, MockExchange, MockHandle, MockMediaEngine};
use parley_transport::StaticTokenProvider;
use serde_json::Value;

pub struct Harness {
    pub session: RealtimeSession,
    pub handle: MockHandle,
    pub exchange: MockExchange,
    pub media: MockMediaEngine,
    pub errors: Arc<Mutex<Vec<ErrorEvent>>>,
}

pub struct Setup {
    pub engine: MockEngine,
    pub exchange: MockExchange,
    pub media: MockMediaEngine,
    pub settings: Value,
    pub token: String,
}

impl Default for Setup {
    fn default() -> Self {
        Self {
            engine: MockEngine::new(),
            exchange: MockExchange::answering(),
            media: MockMediaEngine::new(MediaOutcome::Grant),
            settings: Value::Null,
            token: "ek_test".into(),
        }
    }
}

impl Setup {
    pub fn build(self) -> Harness {
        self.build_with(|options| options)
    }

    pub fn build_with(self, configure: impl FnOnce(SessionOptions) -> SessionOptions) -> Harness {
        let settings = SessionSettings::with_overrides(self.settings).unwrap();
        let errors = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&errors);
        let handle = self.engine.handle();
        let options = SessionOptions::new(
            settings,
            Arc::new(StaticTokenProvider::new(self.token)),
            Arc::new(self.engine),
        )
        .with_media_engine(Arc::new(self.media.clone()))
        .with_exchange(Arc::new(self.exchange.clone()))
        .with_observer(Arc::new(move |e: &ErrorEvent| sink.lock().push(e.clone())));
        Harness {
            session: RealtimeSession::new(configure(options)),
            handle,
            exchange: self.exchange,
            media: self.media,
            errors,
        }
    }
}

pub fn harness() -> Harness {
    Setup::default().build()
}

pub fn with_hooks(hooks: Arc<dyn SessionHooks>) -> Harness {
    Setup::default().build_with(|options| options.with_hooks(hooks))
}

/// Yield until `cond` holds, giving the session pumps a chance to run.
pub async fn eventually(cond: impl Fn() -> bool) -> bool {
    for _ in 0..500 {
        if cond() {
            return true;
        }
        tokio::task::yield_now().await;
    }
    cond()
}

/// Let queued pump work run to completion.
pub async fn settle() {
    for _ in 0..50 {
        tokio::task::yield_now().await;
    }
}
