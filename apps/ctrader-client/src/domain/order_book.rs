//! Order Book
//!
//! Incremental depth-of-market state for one symbol. The broker sends
//! quotes keyed by a quote id: new quotes add or replace an entry, deleted
//! ids remove one. Snapshots are derived on demand and never stored.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::market::price_from_wire;
use crate::infrastructure::schema::messages::DepthQuote;

/// Decimal places of a wire depth size (cents).
pub const VOLUME_SCALE: u32 = 2;

/// One price level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DepthLevel {
    /// Level price.
    pub price: Decimal,
    /// Volume at this price.
    pub volume: Decimal,
}

/// Mutable bid/ask state keyed by quote id.
#[derive(Debug, Default)]
pub struct OrderBook {
    bids: HashMap<u64, DepthLevel>,
    asks: HashMap<u64, DepthLevel>,
}

impl OrderBook {
    /// Create an empty book.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply one depth delta: additions first, then deletions.
    ///
    /// A quote both added and deleted in one delta ends up removed. A quote
    /// carrying neither side is ignored.
    pub fn apply(&mut self, added: &[DepthQuote], deleted: &[u64]) {
        for quote in added {
            let Ok(size) = i64::try_from(quote.size) else {
                continue;
            };
            let volume = Decimal::new(size, VOLUME_SCALE);
            if let Some(price) = quote.bid.and_then(price_from_wire) {
                self.asks.remove(&quote.id);
                self.bids.insert(quote.id, DepthLevel { price, volume });
            } else if let Some(price) = quote.ask.and_then(price_from_wire) {
                self.bids.remove(&quote.id);
                self.asks.insert(quote.id, DepthLevel { price, volume });
            }
        }

        for id in deleted {
            self.bids.remove(id);
            self.asks.remove(id);
        }
    }

    /// Drop every quote.
    pub fn clear(&mut self) {
        self.bids.clear();
        self.asks.clear();
    }

    /// Number of quotes on both sides.
    #[must_use]
    pub fn len(&self) -> usize {
        self.bids.len() + self.asks.len()
    }

    /// Whether both sides are empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.bids.is_empty() && self.asks.is_empty()
    }

    /// Sorted immutable view: bids descending, asks ascending.
    #[must_use]
    pub fn snapshot(&self, symbol_id: i64, symbol: &str) -> DepthSnapshot {
        let mut bids: Vec<DepthLevel> = self.bids.values().copied().collect();
        let mut asks: Vec<DepthLevel> = self.asks.values().copied().collect();
        bids.sort_by(|a, b| b.price.cmp(&a.price));
        asks.sort_by(|a, b| a.price.cmp(&b.price));

        DepthSnapshot {
            symbol_id,
            symbol: symbol.to_string(),
            bids,
            asks,
            timestamp: Utc::now(),
        }
    }
}

/// Point-in-time order book view.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DepthSnapshot {
    /// Broker symbol id.
    pub symbol_id: i64,
    /// Symbol name.
    pub symbol: String,
    /// Bid levels, best (highest) first.
    pub bids: Vec<DepthLevel>,
    /// Ask levels, best (lowest) first.
    pub asks: Vec<DepthLevel>,
    /// When the snapshot was taken.
    pub timestamp: DateTime<Utc>,
}

impl DepthSnapshot {
    /// Highest bid.
    #[must_use]
    pub fn best_bid(&self) -> Option<&DepthLevel> {
        self.bids.first()
    }

    /// Lowest ask.
    #[must_use]
    pub fn best_ask(&self) -> Option<&DepthLevel> {
        self.asks.first()
    }

    /// Best ask minus best bid.
    #[must_use]
    pub fn spread(&self) -> Option<Decimal> {
        Some(self.best_ask()?.price - self.best_bid()?.price)
    }

    /// Volume across the best `levels` bids.
    #[must_use]
    pub fn total_bid_volume(&self, levels: usize) -> Decimal {
        self.bids.iter().take(levels).map(|l| l.volume).sum()
    }

    /// Volume across the best `levels` asks.
    #[must_use]
    pub fn total_ask_volume(&self, levels: usize) -> Decimal {
        self.asks.iter().take(levels).map(|l| l.volume).sum()
    }
}
