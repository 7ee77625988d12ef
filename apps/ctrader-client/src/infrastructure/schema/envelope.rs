//! Envelope and message traits.
//!
//! Every frame on the wire carries one [`Envelope`]: the payload type tag,
//! the serialized inner message, and an optional client correlation id.

use std::any::Any;
use std::fmt;
use std::sync::Arc;

/// Outer wire wrapper (`ProtoMessage`).
#[derive(Clone, PartialEq, Eq, prost::Message)]
pub struct Envelope {
    /// Payload type tag.
    #[prost(uint32, required, tag = "1")]
    pub payload_type: u32,
    /// Serialized inner message.
    #[prost(bytes = "vec", optional, tag = "2")]
    pub payload: Option<Vec<u8>>,
    /// Client-generated correlation id echoed by the server.
    #[prost(string, optional, tag = "3")]
    pub client_msg_id: Option<String>,
}

impl Envelope {
    /// Correlation id, if the envelope carries a non-empty one.
    #[must_use]
    pub fn correlation_id(&self) -> Option<&str> {
        self.client_msg_id.as_deref().filter(|id| !id.is_empty())
    }

    /// Inner payload bytes (empty when absent).
    #[must_use]
    pub fn payload_bytes(&self) -> &[u8] {
        self.payload.as_deref().unwrap_or_default()
    }
}

/// A concrete broker message with a fixed payload type tag.
pub trait WireMessage: prost::Message + Default + Clone + fmt::Debug + 'static {
    /// Payload type tag carried in the envelope.
    const PAYLOAD_TYPE: u32;
    /// Schema name used in logs and timeout errors.
    const NAME: &'static str;
}

/// Object-safe view of any [`WireMessage`].
pub trait DynMessage: Any + Send + Sync + fmt::Debug + 'static {
    /// Payload type tag.
    fn payload_type(&self) -> u32;
    /// Schema name.
    fn message_name(&self) -> &'static str;
    /// Serialize the message body.
    fn encode_payload(&self) -> Vec<u8>;
    /// Upcast for downcasting to the concrete type.
    fn as_any(&self) -> &dyn Any;
}

impl<T: WireMessage> DynMessage for T {
    fn payload_type(&self) -> u32 {
        T::PAYLOAD_TYPE
    }

    fn message_name(&self) -> &'static str {
        T::NAME
    }

    fn encode_payload(&self) -> Vec<u8> {
        self.encode_to_vec()
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl dyn DynMessage {
    /// Borrow the message as its concrete type.
    #[must_use]
    pub fn downcast_ref<T: WireMessage>(&self) -> Option<&T> {
        self.as_any().downcast_ref::<T>()
    }

    /// Whether the message is of concrete type `T`.
    #[must_use]
    pub fn is<T: WireMessage>(&self) -> bool {
        self.as_any().is::<T>()
    }
}

/// A decoded inbound payload, shared between the correlator and handlers.
pub type Payload = Arc<dyn DynMessage>;
