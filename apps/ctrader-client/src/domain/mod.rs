//! Domain Layer
//!
//! Market data values handed to stream consumers, free of any protocol
//! machinery.
//!
//! - [`market`]: ticks, candles and bar periods
//! - [`order_book`]: incremental depth state and its snapshots

pub mod market;
pub mod order_book;

pub use market::{Candle, Tick, TrendbarPeriod};
pub use order_book::{DepthLevel, DepthSnapshot, OrderBook};
