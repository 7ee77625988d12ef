//! Wire Schema
//!
//! The protobuf envelope, the object-safe message traits, the subset of
//! broker messages the engine needs, and the registry that maps payload
//! type tags to decoders.

pub mod envelope;
pub mod messages;
pub mod registry;

pub use envelope::{DynMessage, Envelope, Payload, WireMessage};
pub use messages::{ensure_not_error, error_response};
pub use registry::MessageRegistry;
