//! Envelope framing.
//!
//! Turns outbound messages into length-prefixed envelope frames and inbound
//! frames back into envelopes and typed payloads, using the injected
//! [`MessageRegistry`].

use std::sync::Arc;

use prost::Message;

use crate::error::{Error, Result};
use crate::infrastructure::schema::{DynMessage, Envelope, MessageRegistry, Payload};
use crate::infrastructure::transport::encode_frame;

/// Envelope encoder/decoder bound to one registry.
#[derive(Debug, Clone)]
pub struct Framing {
    registry: Arc<MessageRegistry>,
}

impl Framing {
    /// Create framing over `registry`.
    #[must_use]
    pub const fn new(registry: Arc<MessageRegistry>) -> Self {
        Self { registry }
    }

    /// The registry in use.
    #[must_use]
    pub const fn registry(&self) -> &Arc<MessageRegistry> {
        &self.registry
    }

    /// Build the envelope for `message`.
    ///
    /// # Errors
    ///
    /// Returns `Error::Protocol` if the message type is not registered.
    pub fn envelope(&self, message: &dyn DynMessage, correlation_id: Option<&str>) -> Result<Envelope> {
        let payload_type = self.registry.type_tag_of(message)?;
        Ok(Envelope {
            payload_type,
            payload: Some(message.encode_payload()),
            client_msg_id: correlation_id.map(str::to_string),
        })
    }

    /// Encode `message` into one complete frame, length prefix included.
    ///
    /// # Errors
    ///
    /// Returns `Error::Protocol` for unregistered types and
    /// `Error::Connection` if the frame would exceed the length field.
    pub fn encode(&self, message: &dyn DynMessage, correlation_id: Option<&str>) -> Result<Vec<u8>> {
        let envelope = self.envelope(message, correlation_id)?;
        encode_frame(&envelope.encode_to_vec())
    }

    /// Decode one frame body (length prefix already stripped).
    ///
    /// # Errors
    ///
    /// Returns `Error::Protocol` if the bytes are not a valid envelope.
    pub fn decode(&self, frame: &[u8]) -> Result<Envelope> {
        Envelope::decode(frame)
            .map_err(|e| Error::protocol(format!("malformed envelope ({} bytes): {e}", frame.len())))
    }

    /// Decode the typed payload of `envelope`.
    ///
    /// # Errors
    ///
    /// Returns `Error::Protocol` for an unknown type tag and `Error::Decode`
    /// for payload bytes that do not match the registered type.
    pub fn extract_payload(&self, envelope: &Envelope) -> Result<Payload> {
        self.registry
            .decode(envelope.payload_type, envelope.payload_bytes())
    }

    /// Schema name for an envelope, for logs.
    #[must_use]
    pub fn name_of(&self, envelope: &Envelope) -> &'static str {
        self.registry
            .name_of(envelope.payload_type)
            .unwrap_or("unknown")
    }
}
