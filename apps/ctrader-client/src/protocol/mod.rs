//! Protocol Engine
//!
//! Framing, request correlation, unsolicited dispatch, and the
//! [`ProtocolHandler`] that composes them over one transport.

pub mod correlator;
pub mod dispatcher;
pub mod framing;
pub mod handler;

pub use correlator::RequestCorrelator;
pub use dispatcher::{Handler, HandlerId, InboundMessage, MessageDispatcher, handler, sync_handler};
pub use framing::Framing;
pub use handler::ProtocolHandler;
