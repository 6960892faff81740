//! Session construction options.

use std::sync::Arc;

use parley_chat::{default_meaningful, MeaningfulFn};
use parley_core::ErrorObserver;
use parley_router::{IncomingMiddleware, NoHooks, OutgoingMiddleware, SessionHooks};
use parley_settings::SessionSettings;
use parley_transport::{
    DescriptionExchange, HttpDescriptionExchange, MediaEngine, TokenProvider, TransportEngine,
};

/// Everything a [`RealtimeSession`](crate::RealtimeSession) is built from.
///
/// `settings` is plain data; the rest are runtime capabilities. Options are
/// consumed at construction and never change afterwards, except for the
/// credential supplier, which
/// [`set_token_provider`](crate::RealtimeSession::set_token_provider) can swap.
pub struct SessionOptions {
    pub(crate) settings: SessionSettings,
    pub(crate) token_provider: Arc<dyn TokenProvider>,
    pub(crate) engine: Arc<dyn TransportEngine>,
    pub(crate) media_engine: Option<Arc<dyn MediaEngine>>,
    pub(crate) exchange: Arc<dyn DescriptionExchange>,
    pub(crate) hooks: Arc<dyn SessionHooks>,
    pub(crate) incoming: Vec<Arc<dyn IncomingMiddleware>>,
    pub(crate) outgoing: Vec<Arc<dyn OutgoingMiddleware>>,
    pub(crate) meaningful: MeaningfulFn,
    pub(crate) observer: Option<Arc<dyn ErrorObserver>>,
}

impl SessionOptions {
    /// Options with no hooks or middleware, no media engine, and the HTTP
    /// description exchange configured from `settings.exchange`.
    pub fn new(
        settings: SessionSettings,
        token_provider: Arc<dyn TokenProvider>,
        engine: Arc<dyn TransportEngine>,
    ) -> Self {
        let exchange = Arc::new(HttpDescriptionExchange::new(&settings.exchange));
        Self {
            settings,
            token_provider,
            engine,
            media_engine: None,
            exchange,
            hooks: Arc::new(NoHooks),
            incoming: Vec::new(),
            outgoing: Vec::new(),
            meaningful: Arc::new(default_meaningful),
            observer: None,
        }
    }

    #[must_use]
    pub fn with_media_engine(mut self, engine: Arc<dyn MediaEngine>) -> Self {
        self.media_engine = Some(engine);
        self
    }

    #[must_use]
    pub fn with_exchange(mut self, exchange: Arc<dyn DescriptionExchange>) -> Self {
        self.exchange = exchange;
        self
    }

    #[must_use]
    pub fn with_hooks(mut self, hooks: Arc<dyn SessionHooks>) -> Self {
        self.hooks = hooks;
        self
    }

    /// Append an incoming middleware stage.
    #[must_use]
    pub fn with_incoming(mut self, stage: Arc<dyn IncomingMiddleware>) -> Self {
        self.incoming.push(stage);
        self
    }

    /// Append an outgoing middleware stage.
    #[must_use]
    pub fn with_outgoing(mut self, stage: Arc<dyn OutgoingMiddleware>) -> Self {
        self.outgoing.push(stage);
        self
    }

    #[must_use]
    pub fn with_meaningful(mut self, predicate: MeaningfulFn) -> Self {
        self.meaningful = predicate;
        self
    }

    /// Receive every reported error in addition to the `on_error` hook.
    #[must_use]
    pub fn with_observer(mut self, observer: Arc<dyn ErrorObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    pub fn settings(&self) -> &SessionSettings {
        &self.settings
    }
}
