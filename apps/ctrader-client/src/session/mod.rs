//! Session Lifecycle
//!
//! Handshake, liveness and reconnection for one broker connection, plus
//! the link that carries handlers and streams across sessions.

pub mod auth;
pub mod heartbeat;
pub mod link;
pub mod reconnect;

pub use auth::{AuthPhase, AuthState, Authenticator};
pub use heartbeat::{HeartbeatConfig, HeartbeatManager, HeartbeatState};
pub use link::SessionLink;
pub use reconnect::{ReconnectConfig, ReconnectManager, ReconnectPolicy};
