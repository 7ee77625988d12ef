#![cfg_attr(
    test,
    allow(
        clippy::unwrap_used,
        clippy::expect_used,
        clippy::significant_drop_tightening,
        clippy::too_many_lines,
        clippy::needless_pass_by_value,
        clippy::items_after_statements,
        clippy::default_trait_access
    )
)]

//! cTrader Client - Open API Protocol Engine
//!
//! Keeps one persistent, authenticated connection to the cTrader Open API
//! and multiplexes correlated request/response calls with unsolicited
//! spot, depth and trendbar event streams over it.
//!
//! # Layers (inside → outside)
//!
//! - **Domain**: Market data values
//!   - `market`: ticks, candles, trendbar periods
//!   - `order_book`: incremental depth book and snapshots
//!
//! - **Application**: Port definitions
//!   - `ports`: transport, symbol lookup, instrumentation and recovery hooks
//!
//! - **Protocol**: Framing, request correlation, dispatch, the session
//!   orchestrator
//!
//! - **Session**: Two-phase authentication, heartbeat, reconnect backoff,
//!   and the link that carries handlers and streams across sessions
//!
//! - **Streaming**: Bounded queues, subscriptions, the stream registry,
//!   keyed fan-out
//!
//! - **Infrastructure**: Adapters and external integrations
//!   - `transport`: raw TLS socket and WebSocket tunnel
//!   - `schema`: envelope and payload messages
//!   - `config`, `events`, `metrics`, `telemetry`
//!
//! # Data Flow
//!
//! ```text
//! socket ─► Transport ─► reader ─► inbound queue ─► workers ─┬─► Correlator ─► send_request caller
//!                                                            └─► Dispatcher ─► handlers / streams
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::pedantic)]

// =============================================================================
// Module Declarations
// =============================================================================

/// Domain layer - Market data types with no protocol dependencies.
pub mod domain;

/// Application layer - Port definitions.
pub mod application;

/// Wire protocol engine.
pub mod protocol;

/// Session lifecycle.
pub mod session;

/// Streaming primitives and market data subscriptions.
pub mod streaming;

/// Infrastructure layer - Adapters and external integrations.
pub mod infrastructure;

/// Connection object for the domain layer.
pub mod client;

/// Error taxonomy.
pub mod error;

#[cfg(test)]
mod testing;

// =============================================================================
// Re-exports
// =============================================================================

// Client
pub use client::{Client, TransportFactory};

// Errors
pub use error::{Error, Result};

// Domain types
pub use domain::{Candle, DepthLevel, DepthSnapshot, OrderBook, Tick, TrendbarPeriod};

// Ports
pub use application::ports::{
    InstrumentationHooks, RecoveryHook, RequestContext, StaticSymbols, SymbolInfo,
    SymbolResolver, Transport,
};

// Protocol
pub use protocol::{Handler, HandlerId, InboundMessage, ProtocolHandler, handler, sync_handler};

// Streams
pub use streaming::{
    CandleStream, DepthStream, Fanout, MultiTickStream, Subscription, TickStream,
};

// Infrastructure config
pub use infrastructure::config::{
    BackpressurePolicy, ClientConfig, ConfigError, Credentials, HostType, ProtocolSettings,
    ReconnectSettings, StreamSettings, TransportKind,
};

// Events
pub use infrastructure::events::{ClientEvent, EventBus};

// Metrics
pub use infrastructure::metrics::{MetricsHooks, init_metrics};

// Telemetry
pub use infrastructure::telemetry::{TelemetryConfig, TelemetryGuard, init as init_telemetry};
