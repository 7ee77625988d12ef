//! Stream Registry
//!
//! Non-owning list of live subscriptions, walked after a reconnect to
//! re-send every subscribe request. Entries are weak: a stream whose
//! consumer went away is pruned instead of kept alive.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::error::{Error, Result};
use crate::session::SessionLink;

/// A subscription that can be re-established on a fresh session.
#[async_trait]
pub trait Resubscribe: Send + Sync {
    /// Human-readable stream name for logs and events.
    fn describe(&self) -> String;

    /// Re-send the subscribe request over `link`'s current session.
    async fn resubscribe(&self, link: &SessionLink) -> Result<()>;
}

/// Registry key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StreamId(u64);

impl StreamId {
    /// Allocate a process-unique id.
    #[must_use]
    pub fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

/// Weak collection of active subscriptions.
#[derive(Default)]
pub struct StreamRegistry {
    streams: Mutex<HashMap<StreamId, Weak<dyn Resubscribe>>>,
}

impl StreamRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Track `stream` under `id` without keeping it alive.
    pub fn register(&self, id: StreamId, stream: Weak<dyn Resubscribe>) {
        self.streams.lock().insert(id, stream);
    }

    /// Stop tracking `id`. Returns whether it was tracked.
    pub fn unregister(&self, id: StreamId) -> bool {
        self.streams.lock().remove(&id).is_some()
    }

    /// Number of tracked streams that are still alive.
    #[must_use]
    pub fn len(&self) -> usize {
        let mut streams = self.streams.lock();
        streams.retain(|_, stream| stream.strong_count() > 0);
        streams.len()
    }

    /// Whether no live stream is tracked.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Resubscribe every live stream.
    ///
    /// Streams run one after another; a failure is logged and collected
    /// and never stops the rest. Returns `(stream, error)` per failure.
    pub async fn resubscribe_all(&self, link: &SessionLink) -> Vec<(String, Error)> {
        let live: Vec<Arc<dyn Resubscribe>> = {
            let mut streams = self.streams.lock();
            streams.retain(|_, stream| stream.strong_count() > 0);
            streams.values().filter_map(Weak::upgrade).collect()
        };

        let mut failures = Vec::new();
        for stream in live {
            let name = stream.describe();
            match stream.resubscribe(link).await {
                Ok(()) => tracing::info!(stream = %name, "Stream resubscribed"),
                Err(e) => {
                    tracing::warn!(stream = %name, error = %e, "Stream resubscribe failed");
                    failures.push((name, e));
                }
            }
        }
        failures
    }
}

impl std::fmt::Debug for StreamRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamRegistry")
            .field("streams", &self.streams.lock().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicU32;
    use std::time::Duration;

    use super::*;
    use crate::infrastructure::events::EventBus;

    struct Probe {
        name: &'static str,
        fail: bool,
        calls: AtomicU32,
    }

    impl Probe {
        fn new(name: &'static str, fail: bool) -> Arc<Self> {
            Arc::new(Self {
                name,
                fail,
                calls: AtomicU32::new(0),
            })
        }
    }

    #[async_trait]
    impl Resubscribe for Probe {
        fn describe(&self) -> String {
            self.name.to_string()
        }

        async fn resubscribe(&self, _link: &SessionLink) -> Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                Err(Error::protocol("broker said no"))
            } else {
                Ok(())
            }
        }
    }

    fn link() -> SessionLink {
        SessionLink::new(1, Duration::from_secs(1), EventBus::default())
    }

    fn weak(probe: &Arc<Probe>) -> Weak<dyn Resubscribe> {
        let probe: Arc<dyn Resubscribe> = Arc::clone(probe) as Arc<dyn Resubscribe>;
        Arc::downgrade(&probe)
    }

    #[tokio::test]
    async fn one_failure_does_not_block_the_rest() {
        let registry = StreamRegistry::new();
        let ok_a = Probe::new("ticks:EURUSD", false);
        let broken = Probe::new("depth:GBPUSD", true);
        let ok_b = Probe::new("candles:USDJPY:M1", false);
        for probe in [&ok_a, &broken, &ok_b] {
            registry.register(StreamId::next(), weak(probe));
        }

        let failures = registry.resubscribe_all(&link()).await;

        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].0, "depth:GBPUSD");
        for probe in [&ok_a, &broken, &ok_b] {
            assert_eq!(probe.calls.load(Ordering::SeqCst), 1);
        }
    }

    #[tokio::test]
    async fn dead_streams_are_pruned_not_kept_alive() {
        let registry = StreamRegistry::new();
        let kept = Probe::new("kept", false);
        registry.register(StreamId::next(), weak(&kept));
        {
            let gone = Probe::new("gone", false);
            registry.register(StreamId::next(), weak(&gone));
        }

        assert_eq!(registry.len(), 1);
        assert!(registry.resubscribe_all(&link()).await.is_empty());
        assert_eq!(kept.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn unregister_reports_membership() {
        let registry = StreamRegistry::new();
        let probe = Probe::new("ticks", false);
        let id = StreamId::next();
        registry.register(id, weak(&probe));
        assert!(registry.unregister(id));
        assert!(!registry.unregister(id));
        assert!(registry.is_empty());
    }
}
