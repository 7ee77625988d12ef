//! Configuration Module
//!
//! Settings consumed by the protocol engine, loaded from environment
//! variables.

mod settings;

pub use settings::{
    BackpressurePolicy, ClientConfig, ConfigError, Credentials, HostType, ProtocolSettings,
    ReconnectSettings, StreamSettings, TransportKind,
};
