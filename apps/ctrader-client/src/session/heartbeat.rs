//! Heartbeat Manager
//!
//! Keeps the session alive by sending a heartbeat event every interval and
//! watches inbound traffic. When nothing arrives for longer than the
//! timeout the transport is closed, which surfaces as a lost connection.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::infrastructure::config::ClientConfig;
use crate::infrastructure::schema::messages::HeartbeatEvent;
use crate::protocol::ProtocolHandler;

/// Configuration for heartbeat behavior.
#[derive(Debug, Clone)]
pub struct HeartbeatConfig {
    /// Interval between outbound heartbeats.
    pub interval: Duration,
    /// Inbound silence after which the connection is considered dead.
    pub timeout: Duration,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(10),
            timeout: Duration::from_secs(45),
        }
    }
}

impl HeartbeatConfig {
    /// Create a new configuration with custom values.
    #[must_use]
    pub const fn new(interval: Duration, timeout: Duration) -> Self {
        Self { interval, timeout }
    }

    /// Create configuration from `ClientConfig`.
    #[must_use]
    pub const fn from_client_config(config: &ClientConfig) -> Self {
        Self {
            interval: config.heartbeat_interval,
            timeout: config.heartbeat_timeout,
        }
    }
}

/// Inbound liveness shared between the reader loop and the heartbeat.
#[derive(Debug)]
pub struct HeartbeatState {
    last_inbound: RwLock<Instant>,
}

impl Default for HeartbeatState {
    fn default() -> Self {
        Self::new()
    }
}

impl HeartbeatState {
    /// Create new heartbeat state.
    #[must_use]
    pub fn new() -> Self {
        Self {
            last_inbound: RwLock::new(Instant::now()),
        }
    }

    /// Record that a frame arrived.
    pub fn record_inbound(&self) {
        *self.last_inbound.write() = Instant::now();
    }

    /// Time since the last inbound frame.
    #[must_use]
    pub fn time_since_inbound(&self) -> Duration {
        self.last_inbound.read().elapsed()
    }

    /// Reset state for a new connection.
    pub fn reset(&self) {
        self.record_inbound();
    }
}

/// Periodic heartbeat sender and liveness watchdog for one session.
pub struct HeartbeatManager {
    config: HeartbeatConfig,
    protocol: Arc<ProtocolHandler>,
    cancel: CancellationToken,
}

impl HeartbeatManager {
    /// Create a new heartbeat manager.
    #[must_use]
    pub const fn new(
        config: HeartbeatConfig,
        protocol: Arc<ProtocolHandler>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            config,
            protocol,
            cancel,
        }
    }

    /// Run until cancelled or the connection is declared dead.
    pub async fn run(self) {
        let mut interval = tokio::time::interval(self.config.interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        interval.tick().await;

        let lost = self.protocol.connection_lost();
        loop {
            tokio::select! {
                () = self.cancel.cancelled() => {
                    tracing::debug!("Heartbeat manager cancelled");
                    break;
                }
                () = lost.cancelled() => {
                    tracing::debug!("Heartbeat manager stopping, connection lost");
                    break;
                }
                _ = interval.tick() => {
                    if !self.check_and_beat().await {
                        break;
                    }
                }
            }
        }
    }

    /// Returns `false` once the connection was declared dead.
    async fn check_and_beat(&self) -> bool {
        let silent_for = self.protocol.liveness().time_since_inbound();
        if silent_for > self.config.timeout {
            tracing::warn!(
                silent_ms = silent_for.as_millis(),
                timeout_ms = self.config.timeout.as_millis(),
                "Heartbeat timeout detected, closing connection"
            );
            if let Err(e) = self.protocol.transport().close().await {
                tracing::debug!(error = %e, "Close after heartbeat timeout failed");
            }
            return false;
        }

        if let Err(e) = self.protocol.send_message(&HeartbeatEvent {}).await {
            tracing::debug!(error = %e, "Heartbeat send failed");
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::config::ProtocolSettings;
    use crate::infrastructure::events::EventBus;
    use crate::infrastructure::schema::MessageRegistry;
    use crate::infrastructure::schema::messages::HEARTBEAT_EVENT;
    use crate::testing::channel_transport;

    #[test]
    fn default_config_values() {
        let config = HeartbeatConfig::default();
        assert_eq!(config.interval, Duration::from_secs(10));
        assert_eq!(config.timeout, Duration::from_secs(45));
    }

    #[test]
    fn config_from_client_config() {
        let client = ClientConfig {
            heartbeat_interval: Duration::from_secs(3),
            heartbeat_timeout: Duration::from_secs(9),
            ..ClientConfig::default()
        };
        let config = HeartbeatConfig::from_client_config(&client);
        assert_eq!(config.interval, Duration::from_secs(3));
        assert_eq!(config.timeout, Duration::from_secs(9));
    }

    #[tokio::test(start_paused = true)]
    async fn state_tracks_inbound() {
        let state = HeartbeatState::new();
        tokio::time::advance(Duration::from_secs(5)).await;
        assert!(state.time_since_inbound() >= Duration::from_secs(5));
        state.record_inbound();
        assert!(state.time_since_inbound() < Duration::from_secs(1));
    }

    async fn started_handler() -> (Arc<ProtocolHandler>, crate::testing::Peer) {
        let (transport, peer) = channel_transport();
        let protocol = Arc::new(ProtocolHandler::new(
            transport,
            Arc::new(MessageRegistry::standard()),
            ProtocolSettings::default(),
            EventBus::default(),
        ));
        protocol.start().unwrap();
        (protocol, peer)
    }

    #[tokio::test]
    async fn sends_heartbeats_while_traffic_flows() {
        let (protocol, mut peer) = started_handler().await;
        let cancel = CancellationToken::new();
        let manager = HeartbeatManager::new(
            HeartbeatConfig::new(Duration::from_millis(20), Duration::from_secs(5)),
            Arc::clone(&protocol),
            cancel.clone(),
        );
        let handle = tokio::spawn(manager.run());

        let envelope = tokio::time::timeout(Duration::from_secs(1), peer.next_envelope())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(envelope.payload_type, HEARTBEAT_EVENT);
        assert!(envelope.correlation_id().is_none());

        cancel.cancel();
        handle.await.unwrap();
        protocol.stop().await;
    }

    #[tokio::test]
    async fn silence_closes_the_connection() {
        let (protocol, _peer) = started_handler().await;
        let cancel = CancellationToken::new();
        let manager = HeartbeatManager::new(
            HeartbeatConfig::new(Duration::from_millis(20), Duration::from_millis(60)),
            Arc::clone(&protocol),
            cancel.clone(),
        );
        let handle = tokio::spawn(manager.run());

        tokio::time::timeout(Duration::from_secs(2), protocol.connection_lost().cancelled())
            .await
            .unwrap();
        assert!(!protocol.is_connected());
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
        protocol.stop().await;
    }
}
