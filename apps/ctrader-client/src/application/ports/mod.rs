//! Port Interfaces
//!
//! ## Driven Ports (Outbound)
//!
//! - `Transport`: byte pipe carrying length-prefixed frames
//! - `SymbolResolver`: symbol name to broker id lookup
//!
//! ## Extension Ports
//!
//! - `InstrumentationHooks`: observe each request around send and response
//! - `RecoveryHook`: refresh-only state recovery after a reconnect

mod instrumentation_port;
mod recovery_port;
mod symbol_port;
mod transport_port;

pub use instrumentation_port::{InstrumentationHooks, RequestContext};
pub use recovery_port::RecoveryHook;
#[cfg(test)]
pub use symbol_port::MockSymbolResolver;
pub use symbol_port::{StaticSymbols, SymbolInfo, SymbolResolver};
pub use transport_port::{Frame, FrameStream, Transport};
