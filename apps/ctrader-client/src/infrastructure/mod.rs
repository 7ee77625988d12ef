//! Infrastructure Layer - Adapters and external integrations.
//!
//! Concrete transports, the wire schema, configuration loading and the
//! observability stack.

/// Environment-driven configuration.
pub mod config;

/// Lifecycle event bus.
pub mod events;

/// Prometheus metrics instrumentation.
pub mod metrics;

/// Envelope, payload messages and the type tag registry.
pub mod schema;

/// OpenTelemetry tracing integration.
pub mod telemetry;

/// Raw socket and WebSocket transports.
pub mod transport;
