//! Unsolicited message dispatch.
//!
//! Handlers register per payload type with a priority; a separate default
//! list catches types nobody registered for. Dispatch runs every matching
//! handler concurrently and isolates each one: an error or a panic is
//! logged and counted, never propagated to siblings or to the caller.

use std::any::Any;
use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use futures::FutureExt;
use futures::future::BoxFuture;
use parking_lot::RwLock;

use crate::infrastructure::metrics;
use crate::infrastructure::schema::{Envelope, Payload, WireMessage};

// =============================================================================
// Handler Types
// =============================================================================

/// One decoded inbound message as seen by handlers.
#[derive(Debug, Clone)]
pub struct InboundMessage {
    /// Raw envelope.
    pub envelope: Envelope,
    /// Decoded payload; `None` when the type tag is unknown or the bytes
    /// did not decode.
    pub payload: Option<Payload>,
}

impl InboundMessage {
    /// Payload type tag.
    #[must_use]
    pub const fn payload_type(&self) -> u32 {
        self.envelope.payload_type
    }

    /// Borrow the payload as concrete type `T`.
    #[must_use]
    pub fn payload_as<T: WireMessage>(&self) -> Option<&T> {
        self.payload.as_deref()?.downcast_ref::<T>()
    }
}

/// Normalized handler: every handler produces a boxed future.
pub type Handler =
    Arc<dyn Fn(Arc<InboundMessage>) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

/// Wrap an async function as a [`Handler`].
pub fn handler<F, Fut>(f: F) -> Handler
where
    F: Fn(Arc<InboundMessage>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    Arc::new(move |message| f(message).boxed())
}

/// Wrap a synchronous function as a [`Handler`].
///
/// The body runs inside the returned future, so it is awaited and isolated
/// exactly like an async handler.
pub fn sync_handler<F>(f: F) -> Handler
where
    F: Fn(&InboundMessage) -> anyhow::Result<()> + Send + Sync + 'static,
{
    let f = Arc::new(f);
    Arc::new(move |message| {
        let f = Arc::clone(&f);
        async move { f(&message) }.boxed()
    })
}

/// Registration handle used to unregister a handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(u64);

impl HandlerId {
    /// Allocate a process-unique id.
    #[must_use]
    pub fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

#[derive(Clone)]
struct Registration {
    id: HandlerId,
    priority: i32,
    handler: Handler,
}

/// Insert keeping priority descending and registration order within ties.
fn insert_sorted(list: &mut Vec<Registration>, registration: Registration) {
    let position = list
        .iter()
        .position(|existing| existing.priority < registration.priority)
        .unwrap_or(list.len());
    list.insert(position, registration);
}

// =============================================================================
// Dispatcher
// =============================================================================

/// Priority-ordered handler table.
#[derive(Default)]
pub struct MessageDispatcher {
    by_type: RwLock<HashMap<u32, Vec<Registration>>>,
    defaults: RwLock<Vec<Registration>>,
}

impl MessageDispatcher {
    /// Create an empty dispatcher.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for `payload_type`.
    pub fn register(&self, payload_type: u32, handler: Handler, priority: i32) -> HandlerId {
        let id = HandlerId::next();
        self.register_as(id, Some(payload_type), handler, priority);
        id
    }

    /// Register a fallback handler for types without specific handlers.
    pub fn register_default(&self, handler: Handler, priority: i32) -> HandlerId {
        let id = HandlerId::next();
        self.register_as(id, None, handler, priority);
        id
    }

    /// Register under an existing id; `None` targets the default list.
    pub(crate) fn register_as(
        &self,
        id: HandlerId,
        payload_type: Option<u32>,
        handler: Handler,
        priority: i32,
    ) {
        let registration = Registration {
            id,
            priority,
            handler,
        };
        match payload_type {
            Some(payload_type) => {
                insert_sorted(
                    self.by_type.write().entry(payload_type).or_default(),
                    registration,
                );
            }
            None => insert_sorted(&mut self.defaults.write(), registration),
        }
        tracing::debug!(?id, payload_type, priority, "Handler registered");
    }

    /// Remove a type-specific handler. Returns whether it was registered.
    pub fn unregister(&self, payload_type: u32, id: HandlerId) -> bool {
        let mut by_type = self.by_type.write();
        let Some(list) = by_type.get_mut(&payload_type) else {
            return false;
        };
        let before = list.len();
        list.retain(|registration| registration.id != id);
        let removed = list.len() != before;
        if list.is_empty() {
            by_type.remove(&payload_type);
        }
        removed
    }

    /// Remove a default handler. Returns whether it was registered.
    pub fn unregister_default(&self, id: HandlerId) -> bool {
        let mut defaults = self.defaults.write();
        let before = defaults.len();
        defaults.retain(|registration| registration.id != id);
        defaults.len() != before
    }

    /// Remove handlers for one type, or every handler when `None`.
    pub fn clear(&self, payload_type: Option<u32>) {
        match payload_type {
            Some(payload_type) => {
                self.by_type.write().remove(&payload_type);
            }
            None => {
                self.by_type.write().clear();
                self.defaults.write().clear();
            }
        }
    }

    /// Number of handlers registered for `payload_type`.
    #[must_use]
    pub fn handler_count(&self, payload_type: u32) -> usize {
        self.by_type.read().get(&payload_type).map_or(0, Vec::len)
    }

    /// Number of default handlers.
    #[must_use]
    pub fn default_count(&self) -> usize {
        self.defaults.read().len()
    }

    fn select(&self, payload_type: u32) -> Vec<(HandlerId, Handler)> {
        let pick = |list: &[Registration]| {
            list.iter()
                .map(|registration| (registration.id, Arc::clone(&registration.handler)))
                .collect::<Vec<_>>()
        };
        if let Some(list) = self.by_type.read().get(&payload_type)
            && !list.is_empty()
        {
            return pick(list);
        }
        pick(&self.defaults.read())
    }

    /// Run every handler matching the message concurrently.
    ///
    /// Returns the number of handlers that completed successfully.
    pub async fn dispatch(&self, message: Arc<InboundMessage>) -> usize {
        let payload_type = message.payload_type();
        let handlers = self.select(payload_type);
        if handlers.is_empty() {
            tracing::trace!(payload_type, "No handler for message");
            return 0;
        }

        let runs = handlers.into_iter().map(|(id, handler)| {
            let message = Arc::clone(&message);
            async move {
                let outcome = match std::panic::catch_unwind(AssertUnwindSafe(|| handler(message))) {
                    Ok(future) => AssertUnwindSafe(future).catch_unwind().await,
                    Err(panic) => Err(panic),
                };
                match outcome {
                    Ok(Ok(())) => true,
                    Ok(Err(e)) => {
                        tracing::warn!(?id, payload_type, error = %e, "Handler failed");
                        metrics::record_handler_failure(payload_type);
                        false
                    }
                    Err(panic) => {
                        tracing::error!(
                            ?id,
                            payload_type,
                            panic = panic_message(panic.as_ref()),
                            "Handler panicked"
                        );
                        metrics::record_handler_failure(payload_type);
                        false
                    }
                }
            }
        });

        futures::future::join_all(runs)
            .await
            .into_iter()
            .filter(|succeeded| *succeeded)
            .count()
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    panic
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| panic.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("non-string panic payload")
}

impl std::fmt::Debug for MessageDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let by_type = self.by_type.read();
        f.debug_struct("MessageDispatcher")
            .field("types", &by_type.len())
            .field("handlers", &by_type.values().map(Vec::len).sum::<usize>())
            .field("defaults", &self.defaults.read().len())
            .finish()
    }
}
