//! Recovery Port
//!
//! Domain-layer hooks run after a reconnect has re-established and
//! re-authenticated the session and streams have been resubscribed.
//!
//! Hooks must only refresh state (reconcile orders, positions, balances).
//! A hook never resends a request that mutates broker state: whether such
//! a request took effect before the disconnect is unknown.

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::Result;
use crate::protocol::ProtocolHandler;

/// Refresh-only recovery step.
#[async_trait]
pub trait RecoveryHook: Send + Sync {
    /// Name for logs.
    fn name(&self) -> &str;

    /// Refresh state over the new session.
    async fn refresh(&self, protocol: &Arc<ProtocolHandler>) -> Result<()>;
}
