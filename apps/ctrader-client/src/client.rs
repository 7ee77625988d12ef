//! Client
//!
//! The connection object the domain layer talks to. It owns one session at
//! a time (transport, protocol handler, authentication, heartbeat) and a
//! supervisor task that replaces the session whenever the connection is
//! lost. Persistent handlers and streams live on the [`SessionLink`] and
//! follow every replacement.
//!
//! # Recovery
//!
//! Requests pending on a lost session fail with `Error::Cancelled` and are
//! never resent. After a reconnect the client resubscribes every live
//! stream and then runs the registered [`RecoveryHook`]s, which refresh
//! state only.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::BroadcastStream;
use tokio_util::sync::CancellationToken;

use crate::application::ports::{
    InstrumentationHooks, RecoveryHook, SymbolInfo, SymbolResolver, Transport,
};
use crate::domain::TrendbarPeriod;
use crate::error::{Error, Result};
use crate::infrastructure::config::ClientConfig;
use crate::infrastructure::events::{ClientEvent, EventBus};
use crate::infrastructure::metrics::{self, MetricsHooks};
use crate::infrastructure::schema::{DynMessage, MessageRegistry, Payload, WireMessage, ensure_not_error};
use crate::infrastructure::transport::build_transport;
use crate::protocol::{Handler, HandlerId, ProtocolHandler};
use crate::session::{Authenticator, HeartbeatConfig, HeartbeatManager, ReconnectConfig, ReconnectManager, SessionLink};
use crate::streaming::{
    CandleStream, DepthStream, DepthTopic, MultiTickStream, SpotTopic, Subscription, TickStream,
    TrendbarTopic,
};

/// Builds a fresh, disconnected transport for each session.
pub type TransportFactory = Arc<dyn Fn() -> Arc<dyn Transport> + Send + Sync>;

/// The heartbeat task of the attached session.
struct Heartbeat {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl Heartbeat {
    async fn stop(self) {
        self.cancel.cancel();
        if let Err(e) = self.task.await
            && !e.is_cancelled()
        {
            tracing::warn!(error = %e, "Heartbeat task failed");
        }
    }
}

#[derive(Default)]
struct Lifecycle {
    shutdown: Option<CancellationToken>,
    supervisor: Option<JoinHandle<()>>,
}

struct ClientInner {
    config: ClientConfig,
    registry: Arc<MessageRegistry>,
    symbols: Arc<dyn SymbolResolver>,
    transports: TransportFactory,
    link: Arc<SessionLink>,
    events: EventBus,
    authenticator: Authenticator,
    reconnect: ReconnectManager,
    hooks: RwLock<Option<Arc<dyn InstrumentationHooks>>>,
    recovery: RwLock<Vec<Arc<dyn RecoveryHook>>>,
    heartbeat: Mutex<Option<Heartbeat>>,
    lifecycle: tokio::sync::Mutex<Lifecycle>,
}

/// cTrader Open API client.
///
/// Cheap to clone; clones share the connection.
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

impl Client {
    /// Create a disconnected client using the configured transport kind.
    #[must_use]
    pub fn new(config: ClientConfig, symbols: Arc<dyn SymbolResolver>) -> Self {
        let kind = config.transport;
        let max_message_size = config.protocol.max_message_size;
        Self::with_transport_factory(
            config,
            symbols,
            Arc::new(move || build_transport(kind, max_message_size)),
        )
    }

    /// Create a disconnected client whose sessions use `transports`.
    #[must_use]
    pub fn with_transport_factory(
        config: ClientConfig,
        symbols: Arc<dyn SymbolResolver>,
        transports: TransportFactory,
    ) -> Self {
        Self::with_registry(config, symbols, transports, Arc::new(MessageRegistry::standard()))
    }

    /// Create a disconnected client with a custom message registry.
    #[must_use]
    pub fn with_registry(
        config: ClientConfig,
        symbols: Arc<dyn SymbolResolver>,
        transports: TransportFactory,
        registry: Arc<MessageRegistry>,
    ) -> Self {
        let events = EventBus::new(config.event_capacity);
        let link = Arc::new(SessionLink::new(
            config.credentials.account_id(),
            config.protocol.request_timeout,
            events.clone(),
        ));
        let authenticator = Authenticator::new(config.credentials.clone(), config.auth_timeout);
        let reconnect = ReconnectManager::new(
            ReconnectConfig::from_settings(&config.reconnect),
            events.clone(),
        );
        let hooks: Arc<dyn InstrumentationHooks> = Arc::new(MetricsHooks);

        Self {
            inner: Arc::new(ClientInner {
                config,
                registry,
                symbols,
                transports,
                link,
                events,
                authenticator,
                reconnect,
                hooks: RwLock::new(Some(hooks)),
                recovery: RwLock::new(Vec::new()),
                heartbeat: Mutex::new(None),
                lifecycle: tokio::sync::Mutex::new(Lifecycle::default()),
            }),
        }
    }

    // =========================================================================
    // Connection
    // =========================================================================

    /// Connect, authenticate and start supervising the connection.
    ///
    /// Calling this while connected does nothing. Streams left over from a
    /// session that ended for good are resubscribed.
    ///
    /// # Errors
    ///
    /// Returns configuration, connection and authentication failures. No
    /// retry happens here; only a lost connection is retried.
    pub async fn connect(&self) -> Result<()> {
        let mut lifecycle = self.inner.lifecycle.lock().await;
        if lifecycle
            .supervisor
            .as_ref()
            .is_some_and(|task| !task.is_finished())
        {
            return Ok(());
        }
        self.inner.config.validate()?;
        if let Some(stale) = self.inner.link.detach() {
            stale.stop().await;
        }

        let protocol = self.inner.open_session().await?;
        if !self.inner.link.streams().is_empty() {
            self.inner.resubscribe().await;
        }

        let shutdown = CancellationToken::new();
        lifecycle.supervisor = Some(tokio::spawn(supervise(
            Arc::clone(&self.inner),
            protocol,
            shutdown.clone(),
        )));
        lifecycle.shutdown = Some(shutdown);

        self.inner.events.emit(ClientEvent::Connected);
        tracing::info!(
            host = self.inner.config.endpoint_host(),
            port = self.inner.config.port,
            account_id = self.inner.config.credentials.account_id(),
            "Client connected"
        );
        Ok(())
    }

    /// Stop supervising and close the current session.
    ///
    /// Pending requests fail with `Error::Cancelled`. Open streams stay
    /// registered and resume on the next [`connect`](Self::connect).
    pub async fn disconnect(&self) {
        let mut lifecycle = self.inner.lifecycle.lock().await;
        if let Some(shutdown) = lifecycle.shutdown.take() {
            shutdown.cancel();
        }
        if let Some(supervisor) = lifecycle.supervisor.take()
            && let Err(e) = supervisor.await
        {
            tracing::warn!(error = %e, "Supervisor task failed");
        }

        let was_connected = self.inner.end_session().await;
        if was_connected {
            self.inner.events.emit(ClientEvent::Disconnected);
            tracing::info!("Client disconnected");
        }
    }

    /// Whether a session is attached and its transport is up.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.inner.link.is_connected()
    }

    /// Whether the supervisor is currently reconnecting.
    #[must_use]
    pub fn is_reconnecting(&self) -> bool {
        self.inner.reconnect.is_reconnecting()
    }

    /// The current session's protocol handler.
    ///
    /// # Errors
    ///
    /// Returns `Error::Connection` while disconnected.
    pub fn protocol(&self) -> Result<Arc<ProtocolHandler>> {
        self.inner.link.protocol()
    }

    // =========================================================================
    // Requests
    // =========================================================================

    /// Send a correlated request and await its response.
    ///
    /// `timeout` defaults to the configured request timeout.
    ///
    /// # Errors
    ///
    /// Fails while disconnected, on send failure, on timeout, or with
    /// `Error::Cancelled` if the session ends first.
    pub async fn send_request(
        &self,
        message: &dyn DynMessage,
        timeout: Option<Duration>,
        type_name: Option<&str>,
    ) -> Result<Payload> {
        self.inner
            .link
            .protocol()?
            .send_request(message, timeout, type_name)
            .await
    }

    /// Send a request and decode the response as `R`.
    ///
    /// # Errors
    ///
    /// Everything [`send_request`](Self::send_request) returns, plus
    /// `Error::Protocol` for broker error responses or a response of
    /// another type.
    pub async fn request<R: WireMessage>(&self, message: &dyn DynMessage) -> Result<R> {
        let payload = ensure_not_error(self.send_request(message, None, None).await?)?;
        payload.downcast_ref::<R>().cloned().ok_or_else(|| {
            Error::protocol(format!(
                "expected {} in response to {}, got {}",
                std::any::type_name::<R>(),
                message.message_name(),
                payload.message_name()
            ))
        })
    }

    /// Send a message without waiting for anything.
    ///
    /// # Errors
    ///
    /// Fails while disconnected or when the transport rejects the write.
    pub async fn send_message(&self, message: &dyn DynMessage) -> Result<()> {
        self.inner.link.protocol()?.send_message(message).await
    }

    // =========================================================================
    // Handlers and Hooks
    // =========================================================================

    /// Register a handler for `payload_type` that survives reconnects.
    pub fn register_handler(&self, payload_type: u32, handler: Handler, priority: i32) -> HandlerId {
        self.inner.link.register_handler(payload_type, handler, priority)
    }

    /// Register a handler for messages no typed handler claims.
    pub fn register_default_handler(&self, handler: Handler, priority: i32) -> HandlerId {
        self.inner.link.register_default_handler(handler, priority)
    }

    /// Remove a handler. Returns `false` for unknown ids.
    pub fn unregister_handler(&self, id: HandlerId) -> bool {
        self.inner.link.unregister_handler(id)
    }

    /// Replace the request instrumentation hooks; `None` disables them.
    ///
    /// Applies to the current session and every later one.
    pub fn set_hooks(&self, hooks: Option<Arc<dyn InstrumentationHooks>>) {
        *self.inner.hooks.write() = hooks.clone();
        if let Ok(protocol) = self.inner.link.protocol() {
            protocol.set_hooks(hooks);
        }
    }

    /// Add a refresh-only step run after every successful reconnect.
    pub fn add_recovery_hook(&self, hook: Arc<dyn RecoveryHook>) {
        self.inner.recovery.write().push(hook);
    }

    /// Lifecycle events from now on.
    #[must_use]
    pub fn events(&self) -> BroadcastStream<ClientEvent> {
        self.inner.events.stream()
    }

    /// The lifecycle event bus.
    #[must_use]
    pub fn event_bus(&self) -> &EventBus {
        &self.inner.events
    }

    /// Number of live streams.
    #[must_use]
    pub fn active_streams(&self) -> usize {
        self.inner.link.streams().len()
    }

    /// Configuration in use.
    #[must_use]
    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    // =========================================================================
    // Streams
    // =========================================================================

    /// Stream bid/ask ticks of one symbol.
    ///
    /// # Errors
    ///
    /// Fails for unknown symbols, while disconnected, or when the broker
    /// rejects the subscription.
    pub async fn stream_ticks(&self, symbol: &str) -> Result<TickStream> {
        let symbol = self.inner.symbols.resolve(symbol).await?;
        Subscription::open(
            Arc::clone(&self.inner.link),
            SpotTopic::single(symbol),
            self.inner.config.streams.queue_size,
            None,
        )
        .await
    }

    /// Stream ticks of several symbols through one subscription.
    ///
    /// With `coalesce`, only the latest tick per symbol is delivered each
    /// flush interval.
    ///
    /// # Errors
    ///
    /// As [`stream_ticks`](Self::stream_ticks); an empty symbol list is a
    /// protocol error.
    pub async fn stream_ticks_multi(
        &self,
        symbols: &[&str],
        coalesce: bool,
    ) -> Result<MultiTickStream> {
        if symbols.is_empty() {
            return Err(Error::protocol("multi-tick stream needs at least one symbol"));
        }
        let mut resolved: Vec<SymbolInfo> = Vec::with_capacity(symbols.len());
        for symbol in symbols {
            resolved.push(self.inner.symbols.resolve(symbol).await?);
        }
        let streams = &self.inner.config.streams;
        Subscription::open(
            Arc::clone(&self.inner.link),
            SpotTopic::multi(resolved),
            streams.queue_size,
            coalesce.then_some(streams.flush_interval),
        )
        .await
    }

    /// Stream live candles of `period` for one symbol.
    ///
    /// # Errors
    ///
    /// As [`stream_ticks`](Self::stream_ticks).
    pub async fn stream_candles(&self, symbol: &str, period: TrendbarPeriod) -> Result<CandleStream> {
        let symbol = self.inner.symbols.resolve(symbol).await?;
        Subscription::open(
            Arc::clone(&self.inner.link),
            TrendbarTopic::new(symbol, period),
            self.inner.config.streams.queue_size,
            None,
        )
        .await
    }

    /// Stream order book snapshots of one symbol.
    ///
    /// # Errors
    ///
    /// As [`stream_ticks`](Self::stream_ticks).
    pub async fn stream_depth(&self, symbol: &str) -> Result<DepthStream> {
        let symbol = self.inner.symbols.resolve(symbol).await?;
        Subscription::open(
            Arc::clone(&self.inner.link),
            DepthTopic::new(symbol),
            self.inner.config.streams.depth_queue_size,
            None,
        )
        .await
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("connected", &self.is_connected())
            .field("reconnecting", &self.is_reconnecting())
            .field("auth", &self.inner.authenticator.phase())
            .field("link", &self.inner.link)
            .finish_non_exhaustive()
    }
}

// =============================================================================
// Sessions
// =============================================================================

impl ClientInner {
    /// Connect, start and authenticate a new session and attach it.
    async fn open_session(&self) -> Result<Arc<ProtocolHandler>> {
        let transport = (self.transports)();
        transport
            .connect(
                self.config.endpoint_host(),
                self.config.port,
                self.config.connection_timeout,
                self.config.use_tls,
            )
            .await?;

        let protocol = Arc::new(ProtocolHandler::new(
            transport,
            Arc::clone(&self.registry),
            self.config.protocol.clone(),
            self.events.clone(),
        ));
        protocol.set_hooks(self.hooks.read().clone());
        if let Err(e) = protocol.start() {
            protocol.stop().await;
            return Err(e);
        }

        self.authenticator.reset();
        if let Err(e) = self
            .authenticator
            .authenticate(&protocol, self.config.auth_max_attempts)
            .await
        {
            protocol.stop().await;
            return Err(e);
        }

        self.link.attach(Arc::clone(&protocol));
        let cancel = CancellationToken::new();
        let task = tokio::spawn(
            HeartbeatManager::new(
                HeartbeatConfig::from_client_config(&self.config),
                Arc::clone(&protocol),
                cancel.clone(),
            )
            .run(),
        );
        let previous = self.heartbeat.lock().replace(Heartbeat { cancel, task });
        if let Some(previous) = previous {
            previous.stop().await;
        }
        metrics::set_connected(true);
        Ok(protocol)
    }

    /// Detach and stop the current session. Returns whether one existed.
    async fn end_session(&self) -> bool {
        let heartbeat = self.heartbeat.lock().take();
        if let Some(heartbeat) = heartbeat {
            heartbeat.stop().await;
        }
        metrics::set_connected(false);
        match self.link.detach() {
            Some(protocol) => {
                protocol.stop().await;
                true
            }
            None => false,
        }
    }

    async fn resubscribe(&self) {
        for (stream, error) in self.link.streams().resubscribe_all(&self.link).await {
            self.events.emit(ClientEvent::StreamDropped {
                stream,
                reason: error.to_string(),
            });
        }
        metrics::set_active_streams(self.link.streams().len());
    }

    async fn recover(&self, protocol: &Arc<ProtocolHandler>) {
        self.resubscribe().await;
        let hooks = self.recovery.read().clone();
        for hook in hooks {
            match hook.refresh(protocol).await {
                Ok(()) => tracing::debug!(hook = hook.name(), "Recovery hook finished"),
                Err(e) => tracing::warn!(hook = hook.name(), error = %e, "Recovery hook failed"),
            }
        }
    }
}

/// Watch the session and replace it whenever the connection is lost.
async fn supervise(inner: Arc<ClientInner>, mut protocol: Arc<ProtocolHandler>, shutdown: CancellationToken) {
    loop {
        let lost = protocol.connection_lost();
        tokio::select! {
            () = shutdown.cancelled() => return,
            () = lost.cancelled() => {}
        }

        inner.end_session().await;
        if !inner.config.reconnect.enabled {
            tracing::error!("Connection lost and reconnect is disabled");
            inner.events.emit(ClientEvent::ReconnectFatal {
                error: "connection lost, reconnect disabled".to_string(),
            });
            return;
        }

        let outcome = tokio::select! {
            () = shutdown.cancelled() => return,
            outcome = inner
                .reconnect
                .connect_with_retry(|| inner.open_session(), Error::is_retriable) => outcome,
        };

        match outcome {
            Ok(next) => {
                protocol = next;
                inner.recover(&protocol).await;
                let attempts = inner.reconnect.attempts();
                tracing::info!(attempts, "Reconnected");
                inner.events.emit(ClientEvent::ReconnectSuccess { attempts });
            }
            Err(e) => {
                tracing::error!(error = %e, "Reconnect failed, giving up");
                inner.events.emit(ClientEvent::ReconnectFatal {
                    error: e.to_string(),
                });
                return;
            }
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
