//! Transport Adapters
//!
//! Two interchangeable [`Transport`] implementations sharing one frame
//! codec:
//!
//! - **tcp**: raw stream socket, TLS via rustls
//! - **websocket**: binary WebSocket tunnel

pub mod frame;
pub mod tcp;
pub mod websocket;

use std::sync::Arc;

pub use frame::{FrameBuffer, FrameReader, encode_frame};
pub use tcp::TcpTransport;
pub use websocket::WebSocketTransport;

use crate::application::ports::Transport;
use crate::infrastructure::config::TransportKind;

/// Create a disconnected transport of the configured kind.
#[must_use]
pub fn build_transport(kind: TransportKind, max_message_size: usize) -> Arc<dyn Transport> {
    match kind {
        TransportKind::Tcp => Arc::new(TcpTransport::new(max_message_size)),
        TransportKind::WebSocket => Arc::new(WebSocketTransport::new(max_message_size)),
    }
}
