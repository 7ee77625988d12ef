//! Instrumentation Port
//!
//! Optional callbacks around every correlated request. All methods default
//! to no-ops and run inline on the caller's task, so implementations must
//! not block.

use std::time::Duration;

use crate::error::Result;
use crate::infrastructure::schema::Payload;

/// Identity of one in-flight request.
#[derive(Debug, Clone, Copy)]
pub struct RequestContext<'a> {
    /// Correlation id carried in the envelope.
    pub correlation_id: &'a str,
    /// Request type name.
    pub type_name: &'a str,
    /// Payload type tag of the request.
    pub payload_type: u32,
}

/// Request lifecycle observer.
pub trait InstrumentationHooks: Send + Sync {
    /// Called right before the request bytes are written.
    fn before_send(&self, _ctx: &RequestContext<'_>) {}

    /// Called right after the request bytes were written.
    fn after_send(&self, _ctx: &RequestContext<'_>, _bytes: usize) {}

    /// Called right after the request settled (response, timeout or failure).
    fn after_response(
        &self,
        _ctx: &RequestContext<'_>,
        _elapsed: Duration,
        _outcome: &Result<Payload>,
    ) {
    }
}
