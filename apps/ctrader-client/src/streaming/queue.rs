//! Bounded async queue.
//!
//! A fixed-capacity FIFO shared by the inbound frame pipeline and every
//! stream. Producers choose per push whether a full queue suspends them
//! ([`push`](BoundedQueue::push)) or evicts the oldest item
//! ([`push_drop_oldest`](BoundedQueue::push_drop_oldest)). The queue never
//! holds more than its capacity.

use std::collections::VecDeque;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll, ready};

use futures::future::BoxFuture;
use futures::{FutureExt, Stream};
use parking_lot::Mutex;
use tokio::sync::Notify;

struct Inner<T> {
    items: VecDeque<T>,
    closed: bool,
}

/// Rejected non-blocking push; the item is handed back.
#[derive(Debug, PartialEq, Eq)]
pub enum TryPushError<T> {
    /// The queue is at capacity.
    Full(T),
    /// The queue was closed.
    Closed(T),
}

/// Result of a drop-oldest push.
#[derive(Debug, PartialEq, Eq)]
pub enum PushOutcome<T> {
    /// Queued without eviction.
    Queued,
    /// Queued after evicting the returned oldest item.
    Displaced(T),
    /// The queue was closed; the item is handed back.
    Closed(T),
}

/// Fixed-capacity multi-producer multi-consumer FIFO.
pub struct BoundedQueue<T> {
    inner: Mutex<Inner<T>>,
    capacity: usize,
    not_empty: Notify,
    not_full: Notify,
}

impl<T> BoundedQueue<T> {
    /// Create a queue holding at most `capacity` items (at least one).
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            inner: Mutex::new(Inner {
                items: VecDeque::with_capacity(capacity.min(1024)),
                closed: false,
            }),
            capacity,
            not_empty: Notify::new(),
            not_full: Notify::new(),
        }
    }

    /// Push without waiting.
    ///
    /// # Errors
    ///
    /// Hands the item back when the queue is full or closed.
    pub fn try_push(&self, item: T) -> Result<(), TryPushError<T>> {
        {
            let mut inner = self.inner.lock();
            if inner.closed {
                return Err(TryPushError::Closed(item));
            }
            if inner.items.len() >= self.capacity {
                return Err(TryPushError::Full(item));
            }
            inner.items.push_back(item);
        }
        self.not_empty.notify_one();
        Ok(())
    }

    /// Push, waiting for a free slot while the queue is full.
    ///
    /// # Errors
    ///
    /// Hands the item back if the queue is closed before it fits.
    pub async fn push(&self, mut item: T) -> Result<(), T> {
        loop {
            let notified = self.not_full.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            match self.try_push(item) {
                Ok(()) => return Ok(()),
                Err(TryPushError::Closed(back)) => return Err(back),
                Err(TryPushError::Full(back)) => item = back,
            }
            notified.await;
        }
    }

    /// Push, evicting the oldest item when full.
    pub fn push_drop_oldest(&self, item: T) -> PushOutcome<T> {
        let displaced = {
            let mut inner = self.inner.lock();
            if inner.closed {
                return PushOutcome::Closed(item);
            }
            let displaced = if inner.items.len() >= self.capacity {
                inner.items.pop_front()
            } else {
                None
            };
            inner.items.push_back(item);
            displaced
        };
        self.not_empty.notify_one();
        displaced.map_or(PushOutcome::Queued, PushOutcome::Displaced)
    }

    /// Pop without waiting.
    pub fn try_pop(&self) -> Option<T> {
        let item = self.inner.lock().items.pop_front();
        if item.is_some() {
            self.not_full.notify_one();
        }
        item
    }

    /// Pop, waiting while the queue is empty.
    ///
    /// Returns `None` once the queue is closed and drained.
    pub async fn pop(&self) -> Option<T> {
        loop {
            let notified = self.not_empty.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut inner = self.inner.lock();
                if let Some(item) = inner.items.pop_front() {
                    drop(inner);
                    self.not_full.notify_one();
                    return Some(item);
                }
                if inner.closed {
                    return None;
                }
            }
            notified.await;
        }
    }

    /// Refuse further pushes and wake every waiter.
    ///
    /// Queued items stay available to `pop`.
    pub fn close(&self) {
        self.inner.lock().closed = true;
        self.not_empty.notify_waiters();
        self.not_full.notify_waiters();
    }

    /// Discard every queued item.
    pub fn clear(&self) {
        self.inner.lock().items.clear();
        self.not_full.notify_waiters();
    }

    /// Number of queued items.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().items.len()
    }

    /// Whether nothing is queued.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.lock().items.is_empty()
    }

    /// Maximum number of queued items.
    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    /// Whether the queue was closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }
}

impl<T> std::fmt::Debug for BoundedQueue<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("BoundedQueue")
            .field("len", &inner.items.len())
            .field("capacity", &self.capacity)
            .field("closed", &inner.closed)
            .finish()
    }
}

/// `Stream` view of a shared queue; ends when the queue is closed and drained.
pub struct QueueStream<T> {
    queue: Arc<BoundedQueue<T>>,
    pending: Option<BoxFuture<'static, Option<T>>>,
}

impl<T> QueueStream<T> {
    /// Stream items popped from `queue`.
    #[must_use]
    pub const fn new(queue: Arc<BoundedQueue<T>>) -> Self {
        Self {
            queue,
            pending: None,
        }
    }

    /// The underlying queue.
    #[must_use]
    pub const fn queue(&self) -> &Arc<BoundedQueue<T>> {
        &self.queue
    }
}

impl<T: Send + 'static> Stream for QueueStream<T> {
    type Item = T;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<T>> {
        let this = &mut *self;
        let queue = &this.queue;
        let pending = this.pending.get_or_insert_with(|| {
            let queue = Arc::clone(queue);
            async move { queue.pop().await }.boxed()
        });
        let item = ready!(pending.as_mut().poll(cx));
        this.pending = None;
        Poll::Ready(item)
    }
}

impl<T> std::fmt::Debug for QueueStream<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueStream")
            .field("queue", &self.queue)
            .finish_non_exhaustive()
    }
}
