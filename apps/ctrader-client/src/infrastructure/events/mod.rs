//! Lifecycle Event Bus
//!
//! Publishes connection and stream lifecycle events over a tokio broadcast
//! channel. Any number of observers can subscribe; a slow observer lags and
//! loses old events instead of stalling the engine.

use std::time::Duration;

use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;

// =============================================================================
// Events
// =============================================================================

/// Connection and stream lifecycle event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientEvent {
    /// A session was established and authenticated.
    Connected,
    /// The client was disconnected on request.
    Disconnected,
    /// The connection dropped without being asked to.
    ConnectionLost {
        /// What ended the connection.
        reason: String,
    },
    /// A reconnect attempt is about to run.
    ReconnectAttempt {
        /// One-based attempt number.
        attempt: u32,
        /// Delay waited before this attempt.
        delay: Duration,
    },
    /// A reconnect succeeded.
    ReconnectSuccess {
        /// Attempts it took.
        attempts: u32,
    },
    /// Reconnecting was abandoned; the client stays disconnected.
    ReconnectFatal {
        /// Final error.
        error: String,
    },
    /// A stream could not be resubscribed after a reconnect.
    StreamDropped {
        /// Stream description.
        stream: String,
        /// Resubscription failure.
        reason: String,
    },
    /// A full stream queue evicted its oldest item.
    StreamItemDropped {
        /// Stream description.
        stream: String,
        /// Items evicted by this stream so far.
        total: u64,
    },
    /// A full inbound queue evicted its oldest frame.
    InboundDropped {
        /// Frames evicted by this handler so far.
        total: u64,
    },
}

impl ClientEvent {
    /// Dotted event name.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Connected => "client.connected",
            Self::Disconnected => "client.disconnected",
            Self::ConnectionLost { .. } => "connection_lost",
            Self::ReconnectAttempt { .. } => "reconnect.attempt",
            Self::ReconnectSuccess { .. } => "reconnect.success",
            Self::ReconnectFatal { .. } => "reconnect.fatal",
            Self::StreamDropped { .. } => "stream.dropped",
            Self::StreamItemDropped { .. } => "stream.item_dropped",
            Self::InboundDropped { .. } => "protocol.inbound_dropped",
        }
    }
}

// =============================================================================
// Event Bus
// =============================================================================

/// Default channel capacity.
pub const DEFAULT_EVENT_CAPACITY: usize = 1024;

/// Cloneable handle to the lifecycle channel.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<ClientEvent>,
}

impl EventBus {
    /// Create a bus holding up to `capacity` undelivered events per observer.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Publish an event.
    ///
    /// Returns the number of observers that will see it.
    pub fn emit(&self, event: ClientEvent) -> usize {
        tracing::trace!(event = event.name(), "Lifecycle event");
        self.tx.send(event).unwrap_or(0)
    }

    /// Subscribe to events published from now on.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<ClientEvent> {
        self.tx.subscribe()
    }

    /// Subscribe as a `Stream`; lag surfaces as `Err` items.
    #[must_use]
    pub fn stream(&self) -> BroadcastStream<ClientEvent> {
        BroadcastStream::new(self.tx.subscribe())
    }

    /// Number of active observers.
    #[must_use]
    pub fn receiver_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_CAPACITY)
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use futures::StreamExt;

    use super::*;

    #[test]
    fn emit_without_observers_returns_zero() {
        let bus = EventBus::default();
        assert_eq!(bus.emit(ClientEvent::Connected), 0);
    }

    #[test]
    fn receiver_count_tracks_subscriptions() {
        let bus = EventBus::new(8);
        let rx1 = bus.subscribe();
        let rx2 = bus.subscribe();
        assert_eq!(bus.receiver_count(), 2);
        drop(rx1);
        assert_eq!(bus.receiver_count(), 1);
        drop(rx2);
        assert_eq!(bus.receiver_count(), 0);
    }

    #[tokio::test]
    async fn every_observer_sees_every_event() {
        let bus = EventBus::new(8);
        let mut rx1 = bus.subscribe();
        let mut stream = bus.stream();

        assert_eq!(
            bus.emit(ClientEvent::ConnectionLost {
                reason: "reset".to_string()
            }),
            2
        );

        let expected = ClientEvent::ConnectionLost {
            reason: "reset".to_string(),
        };
        assert_eq!(rx1.recv().await.unwrap(), expected);
        assert_eq!(stream.next().await.unwrap().unwrap(), expected);
    }

    #[test]
    fn event_names() {
        assert_eq!(
            ClientEvent::ReconnectAttempt {
                attempt: 1,
                delay: Duration::ZERO
            }
            .name(),
            "reconnect.attempt"
        );
        assert_eq!(
            ClientEvent::StreamDropped {
                stream: "ticks:EURUSD".to_string(),
                reason: String::new()
            }
            .name(),
            "stream.dropped"
        );
        assert_eq!(
            ClientEvent::ReconnectFatal {
                error: String::new()
            }
            .name(),
            "reconnect.fatal"
        );
    }
}
