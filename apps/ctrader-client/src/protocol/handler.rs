//! Protocol handler.
//!
//! Composes one transport, one correlator and one dispatcher into a
//! session-scoped engine. A reader task pumps inbound frames into a
//! bounded queue; a worker pool drains it, settling correlated responses
//! and dispatching everything else.
//!
//! # Backpressure
//!
//! With [`BackpressurePolicy::Block`] a full queue suspends the reader,
//! which pushes pressure back onto the socket. With
//! [`BackpressurePolicy::DropOldest`] the oldest queued frame is evicted so
//! a slow handler never stalls request/response traffic.
//!
//! # Ordering
//!
//! Frames are handled in arrival order only with a single worker.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use futures::StreamExt;
use parking_lot::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::correlator::RequestCorrelator;
use super::dispatcher::{InboundMessage, MessageDispatcher};
use super::framing::Framing;
use crate::application::ports::{
    Frame, FrameStream, InstrumentationHooks, RequestContext, Transport,
};
use crate::error::{Error, Result};
use crate::infrastructure::config::{BackpressurePolicy, ProtocolSettings};
use crate::infrastructure::events::{ClientEvent, EventBus};
use crate::infrastructure::metrics;
use crate::infrastructure::schema::messages::HEARTBEAT_EVENT;
use crate::infrastructure::schema::{DynMessage, MessageRegistry, Payload};
use crate::session::heartbeat::HeartbeatState;
use crate::streaming::queue::{BoundedQueue, PushOutcome};

/// Time `stop` waits for each task before aborting it.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Session-scoped protocol engine.
pub struct ProtocolHandler {
    transport: Arc<dyn Transport>,
    framing: Framing,
    correlator: Arc<RequestCorrelator>,
    dispatcher: Arc<MessageDispatcher>,
    settings: ProtocolSettings,
    inbound: Arc<BoundedQueue<Frame>>,
    hooks: RwLock<Option<Arc<dyn InstrumentationHooks>>>,
    events: EventBus,
    liveness: Arc<HeartbeatState>,
    inbound_dropped: Arc<AtomicU64>,
    shutdown: CancellationToken,
    connection_lost: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    started: AtomicBool,
}

impl ProtocolHandler {
    /// Create a handler over a connected transport. Nothing runs until
    /// [`start`](Self::start).
    #[must_use]
    pub fn new(
        transport: Arc<dyn Transport>,
        registry: Arc<MessageRegistry>,
        settings: ProtocolSettings,
        events: EventBus,
    ) -> Self {
        let inbound = Arc::new(BoundedQueue::new(settings.inbound_queue_size));
        Self {
            transport,
            framing: Framing::new(registry),
            correlator: Arc::new(RequestCorrelator::new()),
            dispatcher: Arc::new(MessageDispatcher::new()),
            settings,
            inbound,
            hooks: RwLock::new(None),
            events,
            liveness: Arc::new(HeartbeatState::new()),
            inbound_dropped: Arc::new(AtomicU64::new(0)),
            shutdown: CancellationToken::new(),
            connection_lost: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
            started: AtomicBool::new(false),
        }
    }

    /// Start the correlator sweep, the workers and the reader.
    ///
    /// # Errors
    ///
    /// Fails if already started or if the transport has no inbound frame
    /// sequence to hand out.
    pub fn start(&self) -> Result<()> {
        if self.started.swap(true, Ordering::AcqRel) {
            return Err(Error::protocol("protocol handler already started"));
        }
        let frames = self.transport.receive()?;
        self.liveness.reset();
        self.correlator.start();

        let workers = self.settings.workers.max(1);
        let mut tasks = self.tasks.lock();
        for worker in 0..workers {
            let ctx = WorkerContext {
                worker,
                framing: self.framing.clone(),
                correlator: Arc::clone(&self.correlator),
                dispatcher: Arc::clone(&self.dispatcher),
                inbound: Arc::clone(&self.inbound),
            };
            tasks.push(tokio::spawn(ctx.run()));
        }

        let reader = ReaderContext {
            inbound: Arc::clone(&self.inbound),
            policy: self.settings.backpressure,
            events: self.events.clone(),
            liveness: Arc::clone(&self.liveness),
            dropped: Arc::clone(&self.inbound_dropped),
            shutdown: self.shutdown.clone(),
            connection_lost: self.connection_lost.clone(),
        };
        tasks.push(tokio::spawn(reader.run(frames)));

        tracing::debug!(
            transport = self.transport.kind(),
            workers,
            backpressure = self.settings.backpressure.as_str(),
            queue = self.settings.inbound_queue_size,
            "Protocol handler started"
        );
        Ok(())
    }

    /// Send a correlated request and wait for its response.
    ///
    /// `timeout` defaults to the configured request timeout and
    /// `type_name` to the message's schema name.
    ///
    /// # Errors
    ///
    /// Returns `Error::Connection` if not connected or the write fails,
    /// `Error::Timeout` when no response arrives in time, and
    /// `Error::Cancelled` if the handler stops first.
    pub async fn send_request(
        &self,
        message: &dyn DynMessage,
        timeout: Option<Duration>,
        type_name: Option<&str>,
    ) -> Result<Payload> {
        if !self.transport.is_connected() {
            return Err(Error::connection("not connected"));
        }
        let timeout = timeout.unwrap_or(self.settings.request_timeout);
        let type_name = type_name.unwrap_or_else(|| message.message_name());

        let (id, slot) = self.correlator.create_request(timeout, type_name);
        let frame = match self.framing.encode(message, Some(&id)) {
            Ok(frame) => frame,
            Err(e) => {
                self.correlator
                    .reject_request(&id, Error::Cancelled("request was not sent".to_string()));
                return Err(e);
            }
        };

        let hooks = self.hooks.read().clone();
        let ctx = RequestContext {
            correlation_id: &id,
            type_name,
            payload_type: message.payload_type(),
        };
        if let Some(hooks) = &hooks {
            hooks.before_send(&ctx);
        }

        let started = Instant::now();
        if let Err(e) = self.transport.send(&frame).await {
            self.correlator
                .reject_request(&id, Error::Cancelled("request was not sent".to_string()));
            let outcome = Err(e);
            if let Some(hooks) = &hooks {
                hooks.after_response(&ctx, started.elapsed(), &outcome);
            }
            return outcome;
        }
        if let Some(hooks) = &hooks {
            hooks.after_send(&ctx, frame.len());
        }
        tracing::debug!(correlation_id = %id, request = type_name, bytes = frame.len(), "Request sent");

        let outcome = self.correlator.wait(&id, slot, timeout).await;
        if let Some(hooks) = &hooks {
            hooks.after_response(&ctx, started.elapsed(), &outcome);
        }
        outcome
    }

    /// Send a message without waiting for any reply.
    ///
    /// # Errors
    ///
    /// Returns `Error::Connection` if not connected or the write fails.
    pub async fn send_message(&self, message: &dyn DynMessage) -> Result<()> {
        if !self.transport.is_connected() {
            return Err(Error::connection("not connected"));
        }
        let frame = self.framing.encode(message, None)?;
        self.transport.send(&frame).await?;
        tracing::trace!(message = message.message_name(), "Message sent");
        Ok(())
    }

    /// Stop the reader and workers, close the transport and cancel every
    /// outstanding request. Idempotent.
    pub async fn stop(&self) {
        self.shutdown.cancel();
        if let Err(e) = self.transport.close().await {
            tracing::debug!(error = %e, "Transport close failed during stop");
        }
        self.inbound.close();

        let tasks = std::mem::take(&mut *self.tasks.lock());
        for mut task in tasks {
            match tokio::time::timeout(DRAIN_TIMEOUT, &mut task).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => tracing::warn!(error = %e, "Protocol task failed"),
                Err(_) => {
                    tracing::warn!("Protocol task did not drain in time, aborting");
                    task.abort();
                }
            }
        }

        self.correlator.stop().await;
        tracing::debug!("Protocol handler stopped");
    }

    /// Token cancelled when the connection drops without `stop`.
    #[must_use]
    pub fn connection_lost(&self) -> CancellationToken {
        self.connection_lost.clone()
    }

    /// Install or remove instrumentation hooks.
    pub fn set_hooks(&self, hooks: Option<Arc<dyn InstrumentationHooks>>) {
        *self.hooks.write() = hooks;
    }

    /// Handler table for unsolicited messages.
    #[must_use]
    pub const fn dispatcher(&self) -> &Arc<MessageDispatcher> {
        &self.dispatcher
    }

    /// Pending request table.
    #[must_use]
    pub const fn correlator(&self) -> &Arc<RequestCorrelator> {
        &self.correlator
    }

    /// The owned transport.
    #[must_use]
    pub const fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    /// Framing in use.
    #[must_use]
    pub const fn framing(&self) -> &Framing {
        &self.framing
    }

    /// Lifecycle event bus.
    #[must_use]
    pub const fn events(&self) -> &EventBus {
        &self.events
    }

    /// Inbound liveness tracker.
    #[must_use]
    pub const fn liveness(&self) -> &Arc<HeartbeatState> {
        &self.liveness
    }

    /// Settings in use.
    #[must_use]
    pub const fn settings(&self) -> &ProtocolSettings {
        &self.settings
    }

    /// Frames evicted by drop-oldest backpressure so far.
    #[must_use]
    pub fn inbound_dropped(&self) -> u64 {
        self.inbound_dropped.load(Ordering::Relaxed)
    }

    /// Lock-free connection snapshot.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.transport.is_connected()
    }
}

impl Drop for ProtocolHandler {
    fn drop(&mut self) {
        if !*self.started.get_mut() {
            return;
        }
        let stopped = self.shutdown.is_cancelled();
        self.shutdown.cancel();
        self.inbound.close();
        for task in self.tasks.get_mut().drain(..) {
            task.abort();
        }
        self.correlator.halt("protocol handler dropped");
        if !stopped {
            tracing::debug!("Protocol handler dropped without stop");
        }
    }
}

impl std::fmt::Debug for ProtocolHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProtocolHandler")
            .field("transport", &self.transport.kind())
            .field("connected", &self.is_connected())
            .field("pending", &self.correlator.pending_count())
            .field("queued", &self.inbound.len())
            .field("inbound_dropped", &self.inbound_dropped())
            .finish_non_exhaustive()
    }
}

// =============================================================================
// Reader
// =============================================================================

struct ReaderContext {
    inbound: Arc<BoundedQueue<Frame>>,
    policy: BackpressurePolicy,
    events: EventBus,
    liveness: Arc<HeartbeatState>,
    dropped: Arc<AtomicU64>,
    shutdown: CancellationToken,
    connection_lost: CancellationToken,
}

impl ReaderContext {
    async fn run(self, mut frames: FrameStream) {
        let reason = loop {
            let next = tokio::select! {
                () = self.shutdown.cancelled() => return,
                next = frames.next() => next,
            };
            match next {
                Some(Ok(frame)) => {
                    self.liveness.record_inbound();
                    if !self.enqueue(frame).await {
                        return;
                    }
                }
                Some(Err(e)) => break e.to_string(),
                None => break "connection closed by peer".to_string(),
            }
        };

        self.inbound.close();
        if self.shutdown.is_cancelled() {
            return;
        }
        tracing::warn!(reason = %reason, "Connection lost");
        self.events.emit(ClientEvent::ConnectionLost { reason });
        self.connection_lost.cancel();
    }

    /// Returns `false` once the queue is closed or the handler stops.
    async fn enqueue(&self, frame: Frame) -> bool {
        match self.policy {
            BackpressurePolicy::Block => tokio::select! {
                () = self.shutdown.cancelled() => false,
                pushed = self.inbound.push(frame) => pushed.is_ok(),
            },
            BackpressurePolicy::DropOldest => match self.inbound.push_drop_oldest(frame) {
                PushOutcome::Queued => true,
                PushOutcome::Displaced(_) => {
                    let total = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                    tracing::warn!(total, "Inbound queue full, dropped oldest frame");
                    metrics::record_inbound_dropped();
                    self.events.emit(ClientEvent::InboundDropped { total });
                    true
                }
                PushOutcome::Closed(_) => false,
            },
        }
    }
}

// =============================================================================
// Workers
// =============================================================================

struct WorkerContext {
    worker: usize,
    framing: Framing,
    correlator: Arc<RequestCorrelator>,
    dispatcher: Arc<MessageDispatcher>,
    inbound: Arc<BoundedQueue<Frame>>,
}

impl WorkerContext {
    async fn run(self) {
        while let Some(frame) = self.inbound.pop().await {
            self.process(&frame).await;
        }
        tracing::trace!(worker = self.worker, "Protocol worker exiting");
    }

    async fn process(&self, frame: &[u8]) {
        let envelope = match self.framing.decode(frame) {
            Ok(envelope) => envelope,
            Err(e) => {
                tracing::warn!(worker = self.worker, error = %e, "Dropping undecodable frame");
                return;
            }
        };

        let payload = match self.framing.extract_payload(&envelope) {
            Ok(payload) => Some(payload),
            Err(e) => {
                if let Some(id) = envelope.correlation_id()
                    && self.correlator.reject_request(id, e)
                {
                    return;
                }
                tracing::debug!(
                    payload_type = envelope.payload_type,
                    "Dispatching message without decoded payload"
                );
                None
            }
        };

        if let (Some(id), Some(payload)) = (envelope.correlation_id(), &payload)
            && self.correlator.resolve_response(id, Arc::clone(payload))
        {
            return;
        }

        if envelope.payload_type == HEARTBEAT_EVENT {
            tracing::trace!("Heartbeat received");
            return;
        }

        tracing::trace!(
            worker = self.worker,
            message = self.framing.name_of(&envelope),
            "Dispatching"
        );
        self.dispatcher
            .dispatch(Arc::new(InboundMessage { envelope, payload }))
            .await;
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use bytes::Bytes;

    use super::*;
    use crate::infrastructure::schema::messages::{
        AccountAuthReq, AccountAuthRes, ApplicationAuthReq, ApplicationAuthRes, SPOT_EVENT,
        SpotEvent,
    };
    use crate::protocol::dispatcher::{handler, sync_handler};
    use crate::testing::{Peer, channel_transport};

    fn settings() -> ProtocolSettings {
        ProtocolSettings {
            request_timeout: Duration::from_secs(2),
            ..ProtocolSettings::default()
        }
    }

    fn start_with(settings: ProtocolSettings) -> (Arc<ProtocolHandler>, Peer, EventBus) {
        let (transport, peer) = channel_transport();
        let events = EventBus::default();
        let protocol = Arc::new(ProtocolHandler::new(
            transport,
            Arc::new(MessageRegistry::standard()),
            settings,
            events.clone(),
        ));
        protocol.start().unwrap();
        (protocol, peer, events)
    }

    fn spot(symbol_id: i64, bid: u64) -> SpotEvent {
        SpotEvent {
            ctid_trader_account_id: 1,
            symbol_id,
            bid: Some(bid),
            ..SpotEvent::default()
        }
    }

    #[tokio::test]
    async fn request_resolves_with_its_response() {
        let (protocol, mut peer, _) = start_with(settings());
        let request = ApplicationAuthReq {
            client_id: "id".to_string(),
            client_secret: "secret".to_string(),
        };

        let call = {
            let protocol = Arc::clone(&protocol);
            tokio::spawn(async move { protocol.send_request(&request, None, None).await })
        };

        let (envelope, received) = peer.next_request::<ApplicationAuthReq>().await;
        assert_eq!(received.client_id, "id");
        assert!(envelope.correlation_id().is_some());
        peer.reply(&envelope, &ApplicationAuthRes {});

        let payload = call.await.unwrap().unwrap();
        assert!(payload.is::<ApplicationAuthRes>());
        assert_eq!(protocol.correlator().pending_count(), 0);
        protocol.stop().await;
    }

    #[tokio::test]
    async fn concurrent_requests_never_cross() {
        let (protocol, mut peer, _) = start_with(settings());

        let calls: Vec<_> = (1..=8)
            .map(|account| {
                let protocol = Arc::clone(&protocol);
                tokio::spawn(async move {
                    let request = AccountAuthReq {
                        ctid_trader_account_id: account,
                        access_token: "t".to_string(),
                    };
                    let payload = protocol.send_request(&request, None, None).await.unwrap();
                    (
                        account,
                        payload
                            .downcast_ref::<AccountAuthRes>()
                            .unwrap()
                            .ctid_trader_account_id,
                    )
                })
            })
            .collect();

        let mut requests = Vec::new();
        for _ in 0..8 {
            requests.push(peer.next_request::<AccountAuthReq>().await);
        }
        // Answer in reverse order.
        for (envelope, request) in requests.iter().rev() {
            peer.reply(
                envelope,
                &AccountAuthRes {
                    ctid_trader_account_id: request.ctid_trader_account_id,
                },
            );
        }

        for call in calls {
            let (asked, answered) = call.await.unwrap();
            assert_eq!(asked, answered);
        }
        protocol.stop().await;
    }

    #[tokio::test]
    async fn late_response_after_timeout_is_ignored() {
        let (protocol, mut peer, _) = start_with(settings());
        let request = ApplicationAuthReq::default();

        let err = {
            let protocol = Arc::clone(&protocol);
            let call = tokio::spawn(async move {
                protocol
                    .send_request(&request, Some(Duration::from_millis(50)), Some("Slow"))
                    .await
            });
            let (envelope, _) = peer.next_request::<ApplicationAuthReq>().await;
            let err = call.await.unwrap().unwrap_err();
            peer.reply(&envelope, &ApplicationAuthRes {});
            err
        };
        assert!(matches!(err, Error::Timeout { ref type_name, .. } if type_name == "Slow"));

        // The late reply is neither resolved nor dispatched as a crash; the
        // handler keeps serving.
        tokio::time::sleep(Duration::from_millis(20)).await;
        let call = {
            let protocol = Arc::clone(&protocol);
            tokio::spawn(async move { protocol.send_request(&ApplicationAuthReq::default(), None, None).await })
        };
        let (envelope, _) = peer.next_request::<ApplicationAuthReq>().await;
        peer.reply(&envelope, &ApplicationAuthRes {});
        assert!(call.await.unwrap().is_ok());
        protocol.stop().await;
    }

    #[tokio::test]
    async fn unsolicited_messages_reach_handlers() {
        let (protocol, peer, _) = start_with(settings());
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        protocol.dispatcher().register(
            SPOT_EVENT,
            handler(move |message| {
                let tx = tx.clone();
                async move {
                    let spot = message.payload_as::<SpotEvent>().unwrap();
                    tx.send(spot.symbol_id)?;
                    Ok(())
                }
            }),
            0,
        );

        peer.push(&spot(7, 100));
        peer.push(&spot(8, 101));
        assert_eq!(rx.recv().await, Some(7));
        assert_eq!(rx.recv().await, Some(8));
        protocol.stop().await;
    }

    #[tokio::test]
    async fn unmatched_correlation_id_is_dispatched() {
        let (protocol, peer, _) = start_with(settings());
        let seen = Arc::new(AtomicUsize::new(0));
        {
            let seen = Arc::clone(&seen);
            protocol.dispatcher().register(
                SPOT_EVENT,
                sync_handler(move |_| {
                    seen.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }),
                0,
            );
        }
        peer.push_correlated(&spot(1, 1), "not-a-pending-request");
        tokio::time::timeout(Duration::from_secs(1), async {
            while seen.load(Ordering::SeqCst) == 0 {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();
        protocol.stop().await;
    }

    #[tokio::test]
    async fn send_failure_rejects_request() {
        let (transport, _peer) = channel_transport();
        let protocol = ProtocolHandler::new(
            Arc::clone(&transport) as Arc<dyn Transport>,
            Arc::new(MessageRegistry::standard()),
            settings(),
            EventBus::default(),
        );
        protocol.start().unwrap();
        transport.close().await.unwrap();

        let err = protocol
            .send_request(&ApplicationAuthReq::default(), None, None)
            .await
            .unwrap_err();
        assert!(err.is_connection());
        assert_eq!(protocol.correlator().pending_count(), 0);
        protocol.stop().await;
    }

    #[tokio::test]
    async fn stop_cancels_pending_requests() {
        let (protocol, mut peer, _) = start_with(settings());
        let call = {
            let protocol = Arc::clone(&protocol);
            tokio::spawn(async move {
                protocol
                    .send_request(&ApplicationAuthReq::default(), Some(Duration::from_secs(30)), None)
                    .await
            })
        };
        let _ = peer.next_request::<ApplicationAuthReq>().await;
        protocol.stop().await;
        assert!(matches!(call.await.unwrap(), Err(Error::Cancelled(_))));
        assert!(!protocol.is_connected());
        protocol.stop().await;
    }

    #[tokio::test]
    async fn peer_close_signals_connection_lost() {
        let (protocol, mut peer, events) = start_with(settings());
        let mut observer = events.subscribe();
        peer.hang_up();

        tokio::time::timeout(Duration::from_secs(1), protocol.connection_lost().cancelled())
            .await
            .unwrap();
        assert!(matches!(
            observer.recv().await.unwrap(),
            ClientEvent::ConnectionLost { .. }
        ));
        protocol.stop().await;
    }

    #[tokio::test]
    async fn read_error_signals_connection_lost() {
        let (protocol, peer, _) = start_with(settings());
        peer.fail(Error::connection("reset by peer"));
        tokio::time::timeout(Duration::from_secs(1), protocol.connection_lost().cancelled())
            .await
            .unwrap();
        protocol.stop().await;
    }

    #[tokio::test]
    async fn stop_does_not_signal_connection_lost() {
        let (protocol, _peer, _) = start_with(settings());
        protocol.stop().await;
        assert!(!protocol.connection_lost().is_cancelled());
    }

    #[tokio::test]
    async fn drop_oldest_keeps_newest_frames() {
        let (protocol, peer, events) = start_with(ProtocolSettings {
            inbound_queue_size: 2,
            backpressure: BackpressurePolicy::DropOldest,
            ..settings()
        });
        let mut observer = events.subscribe();

        let gate = Arc::new(tokio::sync::Semaphore::new(0));
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        {
            let gate = Arc::clone(&gate);
            protocol.dispatcher().register(
                SPOT_EVENT,
                handler(move |message| {
                    let gate = Arc::clone(&gate);
                    let tx = tx.clone();
                    async move {
                        gate.acquire().await?.forget();
                        tx.send(message.payload_as::<SpotEvent>().unwrap().symbol_id)?;
                        Ok(())
                    }
                }),
                0,
            );
        }

        // The worker takes frame 1 and parks on the gate; 2..=5 then
        // compete for two queue slots.
        peer.push(&spot(1, 1));
        tokio::time::sleep(Duration::from_millis(20)).await;
        for symbol in 2..=5 {
            peer.push(&spot(symbol, 1));
        }
        tokio::time::timeout(Duration::from_secs(1), async {
            while protocol.inbound_dropped() < 2 {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();

        gate.add_permits(3);
        let mut received = Vec::new();
        for _ in 0..3 {
            received.push(rx.recv().await.unwrap());
        }
        assert_eq!(received, vec![1, 4, 5]);
        assert!(matches!(
            observer.recv().await.unwrap(),
            ClientEvent::InboundDropped { total: 1 }
        ));
        protocol.stop().await;
    }

    #[tokio::test]
    async fn dropping_handler_stops_its_tasks() {
        let (protocol, peer, events) = start_with(settings());
        let mut lost = events.subscribe();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        protocol.dispatcher().register(
            SPOT_EVENT,
            sync_handler(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }),
            0,
        );
        let correlator = Arc::clone(protocol.correlator());
        let (_, slot) = correlator.create_request(Duration::from_secs(30), "Pending");

        drop(protocol);
        peer.push(&spot(1, 1));
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert!(matches!(slot.await.unwrap(), Err(Error::Cancelled(_))));
        assert_eq!(correlator.pending_count(), 0);
        assert!(lost.try_recv().is_err());
    }

    #[tokio::test]
    async fn block_policy_loses_nothing() {
        let (protocol, peer, _) = start_with(ProtocolSettings {
            inbound_queue_size: 1,
            backpressure: BackpressurePolicy::Block,
            ..settings()
        });
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        protocol.dispatcher().register(
            SPOT_EVENT,
            handler(move |message| {
                let tx = tx.clone();
                async move {
                    tokio::time::sleep(Duration::from_millis(1)).await;
                    tx.send(message.payload_as::<SpotEvent>().unwrap().symbol_id)?;
                    Ok(())
                }
            }),
            0,
        );
        for symbol in 0..20 {
            peer.push(&spot(symbol, 1));
        }
        let mut received = Vec::new();
        for _ in 0..20 {
            received.push(rx.recv().await.unwrap());
        }
        assert_eq!(received, (0..20).collect::<Vec<_>>());
        assert_eq!(protocol.inbound_dropped(), 0);
        protocol.stop().await;
    }

    #[tokio::test]
    async fn garbage_frame_does_not_stop_processing() {
        let (protocol, peer, _) = start_with(settings());
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        protocol.dispatcher().register(
            SPOT_EVENT,
            sync_handler(move |_| {
                tx.send(())?;
                Ok(())
            }),
            0,
        );
        peer.push_raw(Bytes::from_static(&[0xff, 0xff, 0xff]));
        peer.push(&spot(1, 1));
        assert_eq!(rx.recv().await, Some(()));
        protocol.stop().await;
    }

    #[tokio::test]
    async fn start_twice_fails() {
        let (protocol, _peer, _) = start_with(settings());
        assert!(protocol.start().is_err());
        protocol.stop().await;
    }

    #[derive(Default)]
    struct CountingHooks {
        before: AtomicUsize,
        after_send: AtomicUsize,
        after_response: AtomicUsize,
    }

    impl InstrumentationHooks for CountingHooks {
        fn before_send(&self, _ctx: &RequestContext<'_>) {
            self.before.fetch_add(1, Ordering::SeqCst);
        }

        fn after_send(&self, _ctx: &RequestContext<'_>, bytes: usize) {
            assert!(bytes > 0);
            self.after_send.fetch_add(1, Ordering::SeqCst);
        }

        fn after_response(
            &self,
            _ctx: &RequestContext<'_>,
            _elapsed: Duration,
            outcome: &Result<Payload>,
        ) {
            assert!(outcome.is_ok());
            self.after_response.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn hooks_fire_around_each_request() {
        let (protocol, mut peer, _) = start_with(settings());
        let hooks = Arc::new(CountingHooks::default());
        protocol.set_hooks(Some(Arc::clone(&hooks) as Arc<dyn InstrumentationHooks>));

        let call = {
            let protocol = Arc::clone(&protocol);
            tokio::spawn(async move {
                protocol
                    .send_request(&ApplicationAuthReq::default(), None, None)
                    .await
            })
        };
        let (envelope, _) = peer.next_request::<ApplicationAuthReq>().await;
        peer.reply(&envelope, &ApplicationAuthRes {});
        call.await.unwrap().unwrap();

        assert_eq!(hooks.before.load(Ordering::SeqCst), 1);
        assert_eq!(hooks.after_send.load(Ordering::SeqCst), 1);
        assert_eq!(hooks.after_response.load(Ordering::SeqCst), 1);
        protocol.stop().await;
    }
}
