//! Session Link
//!
//! The part of a connection that outlives any single session. Sessions
//! (transport, protocol handler, authentication) are replaced on every
//! reconnect; the link keeps what must survive that: persistent handler
//! registrations, the stream registry, and the event bus. Attaching a new
//! session installs every persistent handler into its dispatcher.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};

use crate::error::{Error, Result};
use crate::infrastructure::events::EventBus;
use crate::infrastructure::schema::{DynMessage, Payload};
use crate::protocol::{Handler, HandlerId, ProtocolHandler};
use crate::streaming::registry::StreamRegistry;

struct PersistentHandler {
    id: HandlerId,
    payload_type: Option<u32>,
    handler: Handler,
    priority: i32,
}

/// Handle to whichever session is current.
pub struct SessionLink {
    current: RwLock<Option<Arc<ProtocolHandler>>>,
    handlers: Mutex<Vec<PersistentHandler>>,
    streams: StreamRegistry,
    events: EventBus,
    account_id: i64,
    request_timeout: Duration,
}

impl SessionLink {
    /// Create a link with no session attached.
    #[must_use]
    pub fn new(account_id: i64, request_timeout: Duration, events: EventBus) -> Self {
        Self {
            current: RwLock::new(None),
            handlers: Mutex::new(Vec::new()),
            streams: StreamRegistry::new(),
            events,
            account_id,
            request_timeout,
        }
    }

    /// Make `protocol` the current session, installing persistent handlers.
    pub fn attach(&self, protocol: Arc<ProtocolHandler>) {
        let handlers = self.handlers.lock();
        for entry in handlers.iter() {
            protocol.dispatcher().register_as(
                entry.id,
                entry.payload_type,
                Arc::clone(&entry.handler),
                entry.priority,
            );
        }
        *self.current.write() = Some(protocol);
        tracing::debug!(handlers = handlers.len(), "Session attached");
    }

    /// Forget the current session and hand it back.
    pub fn detach(&self) -> Option<Arc<ProtocolHandler>> {
        self.current.write().take()
    }

    /// The current session.
    ///
    /// # Errors
    ///
    /// Returns `Error::Connection` when no session is attached.
    pub fn protocol(&self) -> Result<Arc<ProtocolHandler>> {
        self.current
            .read()
            .clone()
            .ok_or_else(|| Error::connection("not connected"))
    }

    /// Whether a session is attached and its transport is up.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.current
            .read()
            .as_ref()
            .is_some_and(|protocol| protocol.is_connected())
    }

    /// Send a request over the current session with the link's timeout.
    ///
    /// # Errors
    ///
    /// Fails when detached or for any reason `send_request` fails.
    pub async fn request(&self, message: &dyn DynMessage, type_name: &str) -> Result<Payload> {
        self.protocol()?
            .send_request(message, Some(self.request_timeout), Some(type_name))
            .await
    }

    /// Register a handler for `payload_type` that survives reconnects.
    pub fn register_handler(&self, payload_type: u32, handler: Handler, priority: i32) -> HandlerId {
        self.add(Some(payload_type), handler, priority)
    }

    /// Register a default handler that survives reconnects.
    pub fn register_default_handler(&self, handler: Handler, priority: i32) -> HandlerId {
        self.add(None, handler, priority)
    }

    fn add(&self, payload_type: Option<u32>, handler: Handler, priority: i32) -> HandlerId {
        let id = HandlerId::next();
        let mut handlers = self.handlers.lock();
        if let Some(protocol) = self.current.read().as_ref() {
            protocol
                .dispatcher()
                .register_as(id, payload_type, Arc::clone(&handler), priority);
        }
        handlers.push(PersistentHandler {
            id,
            payload_type,
            handler,
            priority,
        });
        id
    }

    /// Remove a persistent handler from the link and the current session.
    pub fn unregister_handler(&self, id: HandlerId) -> bool {
        let mut handlers = self.handlers.lock();
        let Some(position) = handlers.iter().position(|entry| entry.id == id) else {
            return false;
        };
        let entry = handlers.remove(position);
        if let Some(protocol) = self.current.read().as_ref() {
            let dispatcher = protocol.dispatcher();
            match entry.payload_type {
                Some(payload_type) => dispatcher.unregister(payload_type, id),
                None => dispatcher.unregister_default(id),
            };
        }
        true
    }

    /// Number of persistent handlers.
    #[must_use]
    pub fn handler_count(&self) -> usize {
        self.handlers.lock().len()
    }

    /// Registry of live streams.
    #[must_use]
    pub const fn streams(&self) -> &StreamRegistry {
        &self.streams
    }

    /// Lifecycle event bus.
    #[must_use]
    pub const fn events(&self) -> &EventBus {
        &self.events
    }

    /// Trading account id used in subscription requests.
    #[must_use]
    pub const fn account_id(&self) -> i64 {
        self.account_id
    }

    /// Deadline for requests sent through the link.
    #[must_use]
    pub const fn request_timeout(&self) -> Duration {
        self.request_timeout
    }
}

impl std::fmt::Debug for SessionLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionLink")
            .field("attached", &self.current.read().is_some())
            .field("handlers", &self.handler_count())
            .field("streams", &self.streams)
            .field("account_id", &self.account_id)
            .finish_non_exhaustive()
    }
}
