//! Subscriptions
//!
//! A subscription turns one kind of unsolicited broker message into a
//! bounded, reconnect-resilient [`Stream`]. Opening one registers a
//! persistent handler on the [`SessionLink`], sends the subscribe requests,
//! and registers with the stream registry so a reconnect resubscribes it.
//!
//! Matching messages go through a drop-oldest queue: a slow consumer loses
//! stale items, the engine never blocks and memory stays bounded. In
//! coalescing mode updates overwrite a per-key slot instead, and a flush
//! task moves the latest value of each changed key into the queue every
//! interval.
//!
//! Only [`Subscription::close`] or dropping the subscription ends the
//! stream; a reconnect in between does not.

use std::collections::{BTreeSet, HashMap};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use futures::Stream;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use super::queue::{BoundedQueue, PushOutcome, QueueStream};
use super::registry::{Resubscribe, StreamId};
use crate::error::{Error, Result};
use crate::infrastructure::events::ClientEvent;
use crate::infrastructure::metrics::{self, StreamKind};
use crate::infrastructure::schema::{DynMessage, error_response};
use crate::protocol::{HandlerId, InboundMessage, sync_handler};
use crate::session::SessionLink;

/// Broker error code for a subscription that already exists.
pub const ALREADY_SUBSCRIBED: &str = "ALREADY_SUBSCRIBED";

// =============================================================================
// Topic
// =============================================================================

/// What a subscription listens to and how it talks to the broker.
pub trait Topic: Send + Sync + 'static {
    /// Item produced for consumers.
    type Item: Clone + Send + 'static;

    /// Payload type of the messages this topic consumes.
    fn payload_type(&self) -> u32;

    /// Metric label.
    fn kind(&self) -> StreamKind;

    /// Human-readable name, e.g. `ticks:EURUSD`.
    fn describe(&self) -> String;

    /// Turn a matching inbound message into an item.
    fn extract(&self, message: &InboundMessage) -> Option<Self::Item>;

    /// Requests that start the flow, sent in order.
    fn subscribe_requests(&self, account_id: i64) -> Vec<Box<dyn DynMessage>>;

    /// Requests that stop the flow, sent in order.
    fn unsubscribe_requests(&self, account_id: i64) -> Vec<Box<dyn DynMessage>>;

    /// Forget accumulated state before resubscribing.
    fn reset(&self) {}

    /// Coalescing key of an item.
    fn key(&self, _item: &Self::Item) -> i64 {
        0
    }

    /// Combine the last value of a key with a newer one.
    fn merge(&self, _previous: &Self::Item, newer: Self::Item) -> Self::Item {
        newer
    }
}

// =============================================================================
// Coalescer
// =============================================================================

/// Latest value per key plus the keys changed since the last drain.
#[derive(Debug)]
pub struct Coalescer<I> {
    latest: HashMap<i64, I>,
    dirty: BTreeSet<i64>,
}

impl<I> Default for Coalescer<I> {
    fn default() -> Self {
        Self {
            latest: HashMap::new(),
            dirty: BTreeSet::new(),
        }
    }
}

impl<I: Clone> Coalescer<I> {
    /// Overwrite the slot of `key`, combining with its last value.
    pub fn update(&mut self, key: i64, item: I, merge: impl FnOnce(&I, I) -> I) {
        let next = match self.latest.get(&key) {
            Some(previous) => merge(previous, item),
            None => item,
        };
        self.latest.insert(key, next);
        self.dirty.insert(key);
    }

    /// Latest value of every key changed since the last drain, by key.
    pub fn drain(&mut self) -> Vec<I> {
        let dirty = std::mem::take(&mut self.dirty);
        dirty
            .into_iter()
            .filter_map(|key| self.latest.get(&key).cloned())
            .collect()
    }

    /// Number of keys waiting for a drain.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.dirty.len()
    }
}

// =============================================================================
// Shared State
// =============================================================================

struct Core<T: Topic> {
    id: StreamId,
    topic: T,
    link: Arc<SessionLink>,
    queue: Arc<BoundedQueue<T::Item>>,
    handler_id: Mutex<Option<HandlerId>>,
    active: AtomicBool,
    subscribed: AtomicBool,
    dropped: AtomicU64,
    coalescer: Option<Mutex<Coalescer<T::Item>>>,
    flush_cancel: CancellationToken,
}

impl<T: Topic> Core<T> {
    fn on_message(&self, message: &InboundMessage) {
        if !self.active.load(Ordering::Acquire) {
            return;
        }
        let Some(item) = self.topic.extract(message) else {
            return;
        };
        match &self.coalescer {
            Some(coalescer) => {
                let key = self.topic.key(&item);
                coalescer
                    .lock()
                    .update(key, item, |previous, newer| self.topic.merge(previous, newer));
            }
            None => self.enqueue(item),
        }
    }

    fn enqueue(&self, item: T::Item) {
        if let PushOutcome::Displaced(_) = self.queue.push_drop_oldest(item) {
            let total = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
            let stream = self.topic.describe();
            tracing::debug!(stream = %stream, total, "Stream queue full, dropped oldest item");
            metrics::record_stream_item_dropped(self.topic.kind());
            self.link
                .events()
                .emit(ClientEvent::StreamItemDropped { stream, total });
        }
    }

    fn flush(&self) {
        let Some(coalescer) = &self.coalescer else {
            return;
        };
        let items = coalescer.lock().drain();
        for item in items {
            self.enqueue(item);
        }
    }

    async fn send_all(&self, requests: Vec<Box<dyn DynMessage>>, subscribing: bool) -> Result<()> {
        for request in requests {
            let payload = self
                .link
                .request(request.as_ref(), request.message_name())
                .await?;
            if let Some((code, description)) = error_response(payload.as_ref()) {
                if subscribing && code == ALREADY_SUBSCRIBED {
                    tracing::debug!(stream = %self.topic.describe(), "Already subscribed");
                    continue;
                }
                return Err(Error::protocol(format!(
                    "{} rejected with {code}: {description}",
                    request.message_name()
                )));
            }
        }
        Ok(())
    }

    async fn subscribe(&self) -> Result<()> {
        let requests = self.topic.subscribe_requests(self.link.account_id());
        self.send_all(requests, true).await?;
        self.subscribed.store(true, Ordering::Release);
        Ok(())
    }

    /// Synchronous teardown. Returns `false` if already detached.
    fn detach(&self) -> bool {
        if !self.active.swap(false, Ordering::AcqRel) {
            return false;
        }
        self.link.streams().unregister(self.id);
        if let Some(id) = self.handler_id.lock().take() {
            self.link.unregister_handler(id);
        }
        self.flush_cancel.cancel();
        self.queue.close();
        metrics::set_active_streams(self.link.streams().len());
        true
    }

    /// Best-effort unsubscribe; failures are logged.
    async fn unsubscribe(&self) {
        if !self.subscribed.swap(false, Ordering::AcqRel) {
            return;
        }
        let requests = self.topic.unsubscribe_requests(self.link.account_id());
        match self.send_all(requests, false).await {
            Ok(()) => tracing::info!(stream = %self.topic.describe(), "Unsubscribed"),
            Err(e) => {
                tracing::debug!(stream = %self.topic.describe(), error = %e, "Unsubscribe failed");
            }
        }
    }
}

#[async_trait]
impl<T: Topic> Resubscribe for Core<T> {
    fn describe(&self) -> String {
        self.topic.describe()
    }

    async fn resubscribe(&self, _link: &SessionLink) -> Result<()> {
        if !self.active.load(Ordering::Acquire) {
            return Ok(());
        }
        self.subscribed.store(false, Ordering::Release);
        self.topic.reset();
        self.subscribe().await
    }
}

async fn flush_loop<T: Topic>(core: Weak<Core<T>>, interval: Duration, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            _ = ticker.tick() => {
                let Some(core) = core.upgrade() else { break };
                core.flush();
            }
        }
    }
}

// =============================================================================
// Subscription
// =============================================================================

/// A live stream of `T::Item`.
pub struct Subscription<T: Topic> {
    core: Arc<Core<T>>,
    items: QueueStream<T::Item>,
    closed: bool,
}

impl<T: Topic> Subscription<T> {
    /// Subscribe to `topic` over `link`.
    ///
    /// `coalesce` enables latest-value-per-key mode with the given flush
    /// interval.
    ///
    /// # Errors
    ///
    /// Returns the failure of any subscribe request; nothing stays
    /// registered in that case.
    pub async fn open(
        link: Arc<SessionLink>,
        topic: T,
        capacity: usize,
        coalesce: Option<Duration>,
    ) -> Result<Self> {
        let queue = Arc::new(BoundedQueue::new(capacity));
        let core = Arc::new(Core {
            id: StreamId::next(),
            topic,
            link: Arc::clone(&link),
            queue: Arc::clone(&queue),
            handler_id: Mutex::new(None),
            active: AtomicBool::new(true),
            subscribed: AtomicBool::new(false),
            dropped: AtomicU64::new(0),
            coalescer: coalesce.map(|_| Mutex::new(Coalescer::default())),
            flush_cancel: CancellationToken::new(),
        });

        let weak = Arc::downgrade(&core);
        let id = link.register_handler(
            core.topic.payload_type(),
            sync_handler(move |message| {
                if let Some(core) = weak.upgrade() {
                    core.on_message(message);
                }
                Ok(())
            }),
            0,
        );
        *core.handler_id.lock() = Some(id);

        if let Err(e) = core.subscribe().await {
            core.detach();
            tracing::warn!(stream = %core.topic.describe(), error = %e, "Subscribe failed");
            return Err(e);
        }

        let registered: Weak<dyn Resubscribe> = Arc::downgrade(&core) as Weak<dyn Resubscribe>;
        link.streams().register(core.id, registered);
        metrics::set_active_streams(link.streams().len());

        if let Some(interval) = coalesce {
            tokio::spawn(flush_loop(
                Arc::downgrade(&core),
                interval,
                core.flush_cancel.clone(),
            ));
        }

        tracing::info!(stream = %core.topic.describe(), capacity, coalescing = coalesce.is_some(), "Subscribed");
        Ok(Self {
            core,
            items: QueueStream::new(queue),
            closed: false,
        })
    }

    /// Stop the stream and wait for the unsubscribe requests.
    ///
    /// Items already queued are discarded.
    pub async fn close(mut self) {
        self.closed = true;
        self.core.detach();
        self.core.queue.clear();
        self.core.unsubscribe().await;
    }

    /// Stream name.
    #[must_use]
    pub fn describe(&self) -> String {
        self.core.topic.describe()
    }

    /// The topic.
    #[must_use]
    pub fn topic(&self) -> &T {
        &self.core.topic
    }

    /// Items evicted by the drop-oldest queue so far.
    #[must_use]
    pub fn dropped(&self) -> u64 {
        self.core.dropped.load(Ordering::Relaxed)
    }

    /// Items waiting to be consumed.
    #[must_use]
    pub fn buffered(&self) -> usize {
        self.core.queue.len()
    }

    /// Whether the broker subscription is currently in place.
    ///
    /// `false` during reconnect recovery; the stream stays open.
    #[must_use]
    pub fn is_subscribed(&self) -> bool {
        self.core.subscribed.load(Ordering::Acquire)
    }
}

impl<T: Topic> Stream for Subscription<T> {
    type Item = T::Item;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.items).poll_next(cx)
    }
}

impl<T: Topic> Drop for Subscription<T> {
    fn drop(&mut self) {
        if self.closed || !self.core.detach() {
            return;
        }
        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            let core = Arc::clone(&self.core);
            runtime.spawn(async move { core.unsubscribe().await });
        }
    }
}

impl<T: Topic> std::fmt::Debug for Subscription<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("stream", &self.describe())
            .field("buffered", &self.buffered())
            .field("dropped", &self.dropped())
            .field("subscribed", &self.is_subscribed())
            .finish_non_exhaustive()
    }
}
