//! Prometheus Metrics Module
//!
//! Engine metrics recorded through the `metrics` facade. Without an
//! installed recorder every call is a no-op, so the library records
//! unconditionally and binaries opt in with [`init_metrics`].
//!
//! # Metrics Categories
//!
//! - **Requests**: sent, settled by outcome, latency
//! - **Backpressure**: inbound frames and stream items evicted
//! - **Connection**: reconnect attempts, connection state, active streams
//! - **Dispatch**: handler failures

use std::sync::OnceLock;
use std::time::Duration;

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

use crate::application::ports::{InstrumentationHooks, RequestContext};
use crate::error::Result;
use crate::infrastructure::schema::{Payload, error_response};

// =============================================================================
// Global Metrics Handle
// =============================================================================

static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Initialize the Prometheus metrics recorder.
///
/// If another recorder is already installed, the returned handle renders an
/// empty registry and a warning is logged.
pub fn init_metrics() -> PrometheusHandle {
    PROMETHEUS_HANDLE
        .get_or_init(|| {
            let handle = match PrometheusBuilder::new().install_recorder() {
                Ok(handle) => handle,
                Err(e) => {
                    tracing::warn!(error = %e, "Prometheus recorder not installed");
                    PrometheusBuilder::new().build_recorder().handle()
                }
            };
            register_metrics();
            handle
        })
        .clone()
}

/// Get the Prometheus handle for rendering metrics.
///
/// Returns `None` if metrics have not been initialized.
#[must_use]
pub fn get_metrics_handle() -> Option<PrometheusHandle> {
    PROMETHEUS_HANDLE.get().cloned()
}

// =============================================================================
// Metric Registration
// =============================================================================

fn register_metrics() {
    // Requests
    describe_counter!(
        "ctrader_client_requests_sent_total",
        "Correlated requests written to the connection"
    );
    describe_counter!(
        "ctrader_client_requests_settled_total",
        "Correlated requests settled, by outcome"
    );
    describe_histogram!(
        "ctrader_client_request_duration_seconds",
        "Time from request write to settlement"
    );

    // Backpressure
    describe_counter!(
        "ctrader_client_inbound_dropped_total",
        "Inbound frames evicted from a full inbound queue"
    );
    describe_counter!(
        "ctrader_client_stream_items_dropped_total",
        "Stream items evicted from a full stream queue"
    );

    // Connection
    describe_counter!(
        "ctrader_client_reconnects_total",
        "Reconnect attempts, by result"
    );
    describe_gauge!(
        "ctrader_client_connected",
        "1 while an authenticated session is up"
    );
    describe_gauge!(
        "ctrader_client_active_streams",
        "Streams registered for resubscription"
    );

    // Dispatch
    describe_counter!(
        "ctrader_client_handler_failures_total",
        "Dispatcher handlers that returned an error or panicked"
    );
}

// =============================================================================
// Metric Recording Functions
// =============================================================================

/// Metric labels for stream kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    /// Single-symbol spot ticks.
    Ticks,
    /// Multi-symbol spot ticks.
    MultiTicks,
    /// Live trendbars.
    Candles,
    /// Depth of market.
    Depth,
}

impl StreamKind {
    /// Label value.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Ticks => "ticks",
            Self::MultiTicks => "multi_ticks",
            Self::Candles => "candles",
            Self::Depth => "depth",
        }
    }
}

/// How a correlated request settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestOutcome {
    /// Regular response payload.
    Response,
    /// Broker error response.
    ErrorResponse,
    /// Deadline elapsed.
    Timeout,
    /// Send failure or cancellation.
    Failed,
}

impl RequestOutcome {
    /// Classify a settled request.
    #[must_use]
    pub fn of(outcome: &Result<Payload>) -> Self {
        match outcome {
            Ok(payload) if error_response(payload.as_ref()).is_some() => Self::ErrorResponse,
            Ok(_) => Self::Response,
            Err(e) if e.is_timeout() => Self::Timeout,
            Err(_) => Self::Failed,
        }
    }

    const fn as_str(self) -> &'static str {
        match self {
            Self::Response => "response",
            Self::ErrorResponse => "error_response",
            Self::Timeout => "timeout",
            Self::Failed => "failed",
        }
    }
}

/// Record a request written to the connection.
pub fn record_request_sent(type_name: &str) {
    counter!(
        "ctrader_client_requests_sent_total",
        "type" => type_name.to_string()
    )
    .increment(1);
}

/// Record a settled request and its latency.
pub fn record_request_settled(type_name: &str, outcome: RequestOutcome, elapsed: Duration) {
    counter!(
        "ctrader_client_requests_settled_total",
        "type" => type_name.to_string(),
        "outcome" => outcome.as_str()
    )
    .increment(1);
    histogram!(
        "ctrader_client_request_duration_seconds",
        "type" => type_name.to_string()
    )
    .record(elapsed.as_secs_f64());
}

/// Record an inbound frame evicted by drop-oldest backpressure.
pub fn record_inbound_dropped() {
    counter!("ctrader_client_inbound_dropped_total").increment(1);
}

/// Record a stream item evicted from a full queue.
pub fn record_stream_item_dropped(kind: StreamKind) {
    counter!(
        "ctrader_client_stream_items_dropped_total",
        "stream" => kind.as_str()
    )
    .increment(1);
}

/// Record a reconnect attempt result.
pub fn record_reconnect(succeeded: bool) {
    counter!(
        "ctrader_client_reconnects_total",
        "result" => if succeeded { "success" } else { "failure" }
    )
    .increment(1);
}

/// Update the connection state gauge.
pub fn set_connected(connected: bool) {
    gauge!("ctrader_client_connected").set(if connected { 1.0 } else { 0.0 });
}

/// Update the active stream gauge.
#[allow(clippy::cast_precision_loss)]
pub fn set_active_streams(count: usize) {
    gauge!("ctrader_client_active_streams").set(count as f64);
}

/// Record a failed dispatcher handler.
pub fn record_handler_failure(payload_type: u32) {
    counter!(
        "ctrader_client_handler_failures_total",
        "payload_type" => payload_type.to_string()
    )
    .increment(1);
}

// =============================================================================
// Instrumentation Hooks
// =============================================================================

/// Request hooks backed by the Prometheus metrics above.
#[derive(Debug, Clone, Copy, Default)]
pub struct MetricsHooks;

impl InstrumentationHooks for MetricsHooks {
    fn after_send(&self, ctx: &RequestContext<'_>, _bytes: usize) {
        record_request_sent(ctx.type_name);
    }

    fn after_response(
        &self,
        ctx: &RequestContext<'_>,
        elapsed: Duration,
        outcome: &Result<Payload>,
    ) {
        record_request_settled(ctx.type_name, RequestOutcome::of(outcome), elapsed);
    }
}

// =============================================================================
// Tests
// =============================================================================
