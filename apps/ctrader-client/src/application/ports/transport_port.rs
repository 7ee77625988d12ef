//! Transport Port (Driven Port)
//!
//! A connected byte pipe. Outbound data is written as-is (already framed by
//! [`Framing`](crate::protocol::Framing)); inbound data is split into
//! complete frames by the shared frame buffer so every implementation
//! yields identical frame sequences.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;

use crate::error::Result;

/// One complete inbound frame, length prefix stripped.
pub type Frame = Bytes;

/// Lazy sequence of inbound frames for one connection.
///
/// Ends with `None` on a clean close at a frame boundary and yields one
/// `Err` before ending on a read failure or a close mid-frame.
pub type FrameStream = BoxStream<'static, Result<Frame>>;

/// Connection to the broker.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Open the connection, replacing any existing one.
    ///
    /// Fails with `Error::Connection` on OS failure or when `timeout`
    /// elapses first.
    async fn connect(&self, host: &str, port: u16, timeout: Duration, use_tls: bool)
    -> Result<()>;

    /// Write already-framed bytes.
    ///
    /// Fails with `Error::Connection` when not connected.
    async fn send(&self, data: &[u8]) -> Result<()>;

    /// Take the inbound frame sequence of the current connection.
    ///
    /// Each connection hands out its sequence once; a new one is available
    /// after the next successful `connect`.
    fn receive(&self) -> Result<FrameStream>;

    /// Close the connection and end any active frame sequence. Idempotent.
    async fn close(&self) -> Result<()>;

    /// Lock-free snapshot of the connection state.
    fn is_connected(&self) -> bool;

    /// Implementation name for logs.
    fn kind(&self) -> &'static str;
}
