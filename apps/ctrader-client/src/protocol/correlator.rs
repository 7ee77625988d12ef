//! Request/response correlation.
//!
//! Every outbound request gets a fresh correlation id and a one-shot result
//! slot. Whoever pops the slot from the pending table first settles it:
//! the response path, an explicit rejection, the caller's deadline, or the
//! periodic sweep. Popping happens under one lock, so each request settles
//! exactly once and a late response for an expired id is a logged no-op.

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};
use crate::infrastructure::schema::Payload;

/// Default period of the expiry sweep.
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(5);

/// Receiving half of a pending request.
pub type ResponseSlot = oneshot::Receiver<Result<Payload>>;

struct PendingRequest {
    slot: oneshot::Sender<Result<Payload>>,
    created_at: Instant,
    timeout: Duration,
    type_name: String,
}

impl PendingRequest {
    fn timeout_error(&self) -> Error {
        Error::Timeout {
            timeout: self.timeout,
            type_name: self.type_name.clone(),
        }
    }
}

struct Sweeper {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// Pending request table with timeout sweeping.
pub struct RequestCorrelator {
    pending: Mutex<HashMap<String, PendingRequest>>,
    sweep_interval: Duration,
    sweeper: Mutex<Option<Sweeper>>,
}

impl RequestCorrelator {
    /// Create a correlator with the default sweep interval.
    #[must_use]
    pub fn new() -> Self {
        Self::with_sweep_interval(DEFAULT_SWEEP_INTERVAL)
    }

    /// Create a correlator sweeping every `sweep_interval`.
    #[must_use]
    pub fn with_sweep_interval(sweep_interval: Duration) -> Self {
        Self {
            pending: Mutex::new(HashMap::new()),
            sweep_interval,
            sweeper: Mutex::new(None),
        }
    }

    /// Register a new request and return its correlation id and slot.
    pub fn create_request(&self, timeout: Duration, type_name: &str) -> (String, ResponseSlot) {
        let (tx, rx) = oneshot::channel();
        let id = uuid::Uuid::new_v4().to_string();
        self.pending.lock().insert(
            id.clone(),
            PendingRequest {
                slot: tx,
                created_at: Instant::now(),
                timeout,
                type_name: type_name.to_string(),
            },
        );
        (id, rx)
    }

    fn take(&self, correlation_id: &str) -> Option<PendingRequest> {
        self.pending.lock().remove(correlation_id)
    }

    /// Settle a request with its response.
    ///
    /// Returns `false` if the id is unknown or already settled.
    pub fn resolve_response(&self, correlation_id: &str, payload: Payload) -> bool {
        let Some(pending) = self.take(correlation_id) else {
            tracing::warn!(
                correlation_id,
                payload = payload.message_name(),
                "Response for unknown or settled request"
            );
            return false;
        };
        tracing::debug!(
            correlation_id,
            request = %pending.type_name,
            elapsed_ms = pending.created_at.elapsed().as_millis(),
            "Request resolved"
        );
        // The caller may have stopped waiting; nothing to do then.
        let _ = pending.slot.send(Ok(payload));
        true
    }

    /// Settle a request with an error.
    ///
    /// Returns `false` if the id is unknown or already settled.
    pub fn reject_request(&self, correlation_id: &str, error: Error) -> bool {
        let Some(pending) = self.take(correlation_id) else {
            tracing::debug!(correlation_id, %error, "Rejection for unknown or settled request");
            return false;
        };
        tracing::debug!(correlation_id, request = %pending.type_name, %error, "Request rejected");
        let _ = pending.slot.send(Err(error));
        true
    }

    /// Settle a request with its own timeout error.
    fn expire(&self, correlation_id: &str) -> bool {
        let Some(pending) = self.take(correlation_id) else {
            return false;
        };
        tracing::warn!(
            correlation_id,
            request = %pending.type_name,
            timeout_ms = pending.timeout.as_millis(),
            "Request timed out"
        );
        let error = pending.timeout_error();
        let _ = pending.slot.send(Err(error));
        true
    }

    /// Wait for a request to settle, expiring it after `timeout`.
    ///
    /// # Errors
    ///
    /// Returns the rejection error, `Error::Timeout` when the deadline
    /// elapses first, or `Error::Cancelled` if the slot was dropped.
    pub async fn wait(
        &self,
        correlation_id: &str,
        mut slot: ResponseSlot,
        timeout: Duration,
    ) -> Result<Payload> {
        let settled = match tokio::time::timeout(timeout, &mut slot).await {
            Ok(settled) => settled,
            Err(_) => {
                // Either the expiry wins the pop or a response just did;
                // the slot holds whichever outcome that was.
                self.expire(correlation_id);
                slot.await
            }
        };
        settled.unwrap_or_else(|_| {
            Err(Error::Cancelled(format!(
                "request {correlation_id} was abandoned"
            )))
        })
    }

    /// Expire every request whose deadline has passed.
    ///
    /// Returns the number of requests expired.
    pub fn sweep_expired(&self) -> usize {
        let expired: Vec<String> = self
            .pending
            .lock()
            .iter()
            .filter(|(_, pending)| pending.created_at.elapsed() >= pending.timeout)
            .map(|(id, _)| id.clone())
            .collect();

        expired.iter().filter(|id| self.expire(id)).count()
    }

    /// Start the periodic sweep. Calling it again while running is a no-op.
    pub fn start(self: &Arc<Self>) {
        let mut sweeper = self.sweeper.lock();
        if sweeper.is_some() {
            return;
        }

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(sweep_loop(
            Arc::downgrade(self),
            self.sweep_interval,
            cancel.clone(),
        ));
        *sweeper = Some(Sweeper { cancel, handle });
    }

    /// Stop the sweep and cancel every outstanding request.
    pub async fn stop(&self) {
        let sweeper = self.sweeper.lock().take();
        if let Some(sweeper) = sweeper {
            sweeper.cancel.cancel();
            if let Err(e) = sweeper.handle.await {
                tracing::warn!(error = %e, "Correlator sweep task failed");
            }
        }
        self.cancel_all("protocol handler stopped");
    }

    /// Stop the sweep without waiting for it and cancel every outstanding
    /// request. Usable where nothing can be awaited.
    pub fn halt(&self, reason: &str) {
        if let Some(sweeper) = self.sweeper.lock().take() {
            sweeper.cancel.cancel();
            sweeper.handle.abort();
        }
        self.cancel_all(reason);
    }

    /// Reject every outstanding request with `Error::Cancelled`.
    ///
    /// Returns the number of requests cancelled.
    pub fn cancel_all(&self, reason: &str) -> usize {
        let drained: Vec<(String, PendingRequest)> = self.pending.lock().drain().collect();
        let count = drained.len();
        for (id, pending) in drained {
            tracing::debug!(correlation_id = %id, request = %pending.type_name, "Request cancelled");
            let _ = pending.slot.send(Err(Error::Cancelled(reason.to_string())));
        }
        if count > 0 {
            tracing::info!(count, reason, "Cancelled outstanding requests");
        }
        count
    }

    /// Number of requests awaiting a response.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }
}

impl Default for RequestCorrelator {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for RequestCorrelator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestCorrelator")
            .field("pending", &self.pending_count())
            .field("sweep_interval", &self.sweep_interval)
            .finish_non_exhaustive()
    }
}

async fn sweep_loop(
    correlator: Weak<RequestCorrelator>,
    interval: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    ticker.tick().await;

    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }
        let Some(correlator) = correlator.upgrade() else {
            break;
        };
        let expired = correlator.sweep_expired();
        if expired > 0 {
            tracing::debug!(expired, "Sweep expired requests");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::schema::messages::{HeartbeatEvent, SubscribeSpotsRes};

    fn payload() -> Payload {
        Arc::new(HeartbeatEvent {})
    }

    #[tokio::test]
    async fn resolve_settles_exactly_once() {
        let correlator = RequestCorrelator::new();
        let (id, slot) = correlator.create_request(Duration::from_secs(1), "Req");
        assert_eq!(correlator.pending_count(), 1);

        assert!(correlator.resolve_response(&id, payload()));
        assert!(!correlator.resolve_response(&id, payload()));
        assert!(!correlator.reject_request(&id, Error::protocol("late")));
        assert_eq!(correlator.pending_count(), 0);

        let settled = slot.await.unwrap().unwrap();
        assert!(settled.is::<HeartbeatEvent>());
    }

    #[test]
    fn ids_are_unique() {
        let correlator = RequestCorrelator::new();
        let (a, _sa) = correlator.create_request(Duration::from_secs(1), "Req");
        let (b, _sb) = correlator.create_request(Duration::from_secs(1), "Req");
        assert_ne!(a, b);
    }

    #[tokio::test]
    async fn reject_delivers_error() {
        let correlator = RequestCorrelator::new();
        let (id, slot) = correlator.create_request(Duration::from_secs(1), "Req");
        assert!(correlator.reject_request(&id, Error::connection("write failed")));
        assert!(slot.await.unwrap().unwrap_err().is_connection());
    }

    #[tokio::test(start_paused = true)]
    async fn wait_times_out_after_exact_deadline() {
        let correlator = RequestCorrelator::new();
        let timeout = Duration::from_millis(300);
        let (id, slot) = correlator.create_request(timeout, "ProtoOASubscribeSpotsReq");

        let started = Instant::now();
        let err = correlator.wait(&id, slot, timeout).await.unwrap_err();
        let elapsed = started.elapsed();
        assert!(elapsed >= timeout && elapsed < timeout + Duration::from_millis(5));
        assert!(matches!(
            err,
            Error::Timeout { type_name, .. } if type_name == "ProtoOASubscribeSpotsReq"
        ));

        assert!(!correlator.resolve_response(&id, payload()));
        assert_eq!(correlator.pending_count(), 0);
    }

    #[tokio::test]
    async fn wait_returns_response() {
        let correlator = Arc::new(RequestCorrelator::new());
        let (id, slot) = correlator.create_request(Duration::from_secs(5), "Req");

        let responder = {
            let correlator = Arc::clone(&correlator);
            let id = id.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(10)).await;
                correlator.resolve_response(&id, Arc::new(SubscribeSpotsRes::default()))
            })
        };

        let settled = correlator
            .wait(&id, slot, Duration::from_secs(5))
            .await
            .unwrap();
        assert!(settled.is::<SubscribeSpotsRes>());
        assert!(responder.await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn sweep_expires_only_overdue_requests() {
        let correlator = RequestCorrelator::new();
        let (_short, short_slot) = correlator.create_request(Duration::from_millis(100), "Short");
        let (_long, _long_slot) = correlator.create_request(Duration::from_secs(60), "Long");

        tokio::time::advance(Duration::from_millis(150)).await;
        assert_eq!(correlator.sweep_expired(), 1);
        assert_eq!(correlator.pending_count(), 1);
        assert!(short_slot.await.unwrap().unwrap_err().is_timeout());
    }

    #[tokio::test(start_paused = true)]
    async fn background_sweep_runs_until_stopped() {
        let correlator = Arc::new(RequestCorrelator::with_sweep_interval(Duration::from_millis(50)));
        correlator.start();
        correlator.start();

        let (_id, slot) = correlator.create_request(Duration::from_millis(120), "Req");
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(slot.await.unwrap().unwrap_err().is_timeout());

        correlator.stop().await;
    }

    #[tokio::test]
    async fn stop_cancels_outstanding_requests() {
        let correlator = Arc::new(RequestCorrelator::new());
        correlator.start();
        let (_a, slot_a) = correlator.create_request(Duration::from_secs(60), "A");
        let (_b, slot_b) = correlator.create_request(Duration::from_secs(60), "B");

        correlator.stop().await;

        assert!(matches!(slot_a.await.unwrap(), Err(Error::Cancelled(_))));
        assert!(matches!(slot_b.await.unwrap(), Err(Error::Cancelled(_))));
        assert_eq!(correlator.pending_count(), 0);
    }

    #[tokio::test]
    async fn resolving_abandoned_request_is_harmless() {
        let correlator = RequestCorrelator::new();
        let (id, slot) = correlator.create_request(Duration::from_secs(1), "Req");
        drop(slot);
        assert!(correlator.resolve_response(&id, payload()));
    }
}
