//! Streaming Primitives
//!
//! Bounded queues, reconnect-resilient subscriptions, the registry that
//! resubscribes them, market data topics, and keyed fan-out.

pub mod fanout;
pub mod queue;
pub mod registry;
pub mod subscription;
pub mod topics;

pub use fanout::Fanout;
pub use queue::{BoundedQueue, PushOutcome, QueueStream, TryPushError};
pub use registry::{Resubscribe, StreamId, StreamRegistry};
pub use subscription::{Coalescer, Subscription, Topic};
pub use topics::{
    CandleStream, DepthStream, DepthTopic, MultiTickStream, SpotTopic, TickStream, TrendbarTopic,
};
