//! Application Layer - Port definitions.
//!
//! The interfaces the protocol engine drives (transports, symbol catalog)
//! and the extension points it exposes to the domain layer (instrumentation
//! and reconnect recovery hooks).

/// Port interfaces for external systems.
pub mod ports;
