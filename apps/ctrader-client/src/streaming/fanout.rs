//! Keyed fan-out.
//!
//! Splits one source stream into per-key streams. Each key gets its own
//! drop-oldest queue, created the first time the key is seen or asked
//! for, so one slow consumer never holds back the others.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Arc;

use futures::{Stream, StreamExt};
use parking_lot::Mutex;
use tokio::task::JoinHandle;

use super::queue::{BoundedQueue, PushOutcome, QueueStream};

struct Routes<K, T> {
    queues: HashMap<K, Arc<BoundedQueue<T>>>,
    finished: bool,
}

impl<K: Eq + Hash + Clone, T> Routes<K, T> {
    fn queue(&mut self, key: &K, capacity: usize) -> Arc<BoundedQueue<T>> {
        let finished = self.finished;
        Arc::clone(self.queues.entry(key.clone()).or_insert_with(|| {
            let queue = Arc::new(BoundedQueue::new(capacity));
            if finished {
                queue.close();
            }
            queue
        }))
    }
}

/// Per-key fan-out of a source stream.
pub struct Fanout<K, T> {
    routes: Arc<Mutex<Routes<K, T>>>,
    capacity: usize,
    pump: JoinHandle<()>,
}

impl<K, T> Fanout<K, T>
where
    K: Eq + Hash + Clone + Send + 'static,
    T: Send + 'static,
{
    /// Route every item of `source` by `key_of` into queues of `capacity`.
    ///
    /// Must be called inside a tokio runtime.
    pub fn new<S, F>(source: S, key_of: F, capacity: usize) -> Self
    where
        S: Stream<Item = T> + Send + 'static,
        F: Fn(&T) -> K + Send + 'static,
    {
        let routes = Arc::new(Mutex::new(Routes {
            queues: HashMap::new(),
            finished: false,
        }));
        let pump = tokio::spawn(pump(source, key_of, Arc::clone(&routes), capacity));
        Self {
            routes,
            capacity,
            pump,
        }
    }

    /// Stream of the items routed to `key`.
    ///
    /// Several calls for one key share one queue, so each item goes to
    /// exactly one of them.
    #[must_use]
    pub fn stream(&self, key: &K) -> QueueStream<T> {
        QueueStream::new(self.routes.lock().queue(key, self.capacity))
    }

    /// Keys seen so far.
    #[must_use]
    pub fn keys(&self) -> Vec<K> {
        self.routes.lock().queues.keys().cloned().collect()
    }

    /// Whether the source has ended.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.routes.lock().finished
    }
}

async fn pump<K, T, S, F>(source: S, key_of: F, routes: Arc<Mutex<Routes<K, T>>>, capacity: usize)
where
    K: Eq + Hash + Clone,
    S: Stream<Item = T>,
    F: Fn(&T) -> K,
{
    futures::pin_mut!(source);
    while let Some(item) = source.next().await {
        let key = key_of(&item);
        let queue = routes.lock().queue(&key, capacity);
        if let PushOutcome::Displaced(_) = queue.push_drop_oldest(item) {
            tracing::trace!("Fan-out queue full, dropped oldest item");
        }
    }

    let mut routes = routes.lock();
    routes.finished = true;
    for queue in routes.queues.values() {
        queue.close();
    }
    tracing::debug!(keys = routes.queues.len(), "Fan-out source ended");
}

impl<K, T> Drop for Fanout<K, T> {
    fn drop(&mut self) {
        self.pump.abort();
        let mut routes = self.routes.lock();
        routes.finished = true;
        for queue in routes.queues.values() {
            queue.close();
        }
    }
}

impl<K, T> std::fmt::Debug for Fanout<K, T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let routes = self.routes.lock();
        f.debug_struct("Fanout")
            .field("keys", &routes.queues.len())
            .field("capacity", &self.capacity)
            .field("finished", &routes.finished)
            .finish()
    }
}
