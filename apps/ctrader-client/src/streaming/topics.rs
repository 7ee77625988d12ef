//! Market data topics: spot ticks, live trendbars and depth of market.

use std::collections::HashMap;

use parking_lot::Mutex;

use super::subscription::{Subscription, Topic};
use crate::application::ports::SymbolInfo;
use crate::domain::{Candle, DepthSnapshot, OrderBook, Tick, TrendbarPeriod};
use crate::infrastructure::metrics::StreamKind;
use crate::infrastructure::schema::DynMessage;
use crate::infrastructure::schema::messages::{
    DEPTH_EVENT, DepthEvent, SPOT_EVENT, SpotEvent, SubscribeDepthQuotesReq,
    SubscribeLiveTrendbarReq, SubscribeSpotsReq, UnsubscribeDepthQuotesReq,
    UnsubscribeLiveTrendbarReq, UnsubscribeSpotsReq,
};
use crate::protocol::InboundMessage;

/// Spot ticks for one symbol.
pub type TickStream = Subscription<SpotTopic>;
/// Spot ticks for several symbols over one subscription.
pub type MultiTickStream = Subscription<SpotTopic>;
/// Live candles for one symbol and period.
pub type CandleStream = Subscription<TrendbarTopic>;
/// Order book snapshots for one symbol.
pub type DepthStream = Subscription<DepthTopic>;

fn spots_request(account_id: i64, symbol_ids: Vec<i64>) -> Box<dyn DynMessage> {
    Box::new(SubscribeSpotsReq {
        ctid_trader_account_id: account_id,
        symbol_id: symbol_ids,
        subscribe_to_spot_timestamp: Some(true),
    })
}

// =============================================================================
// Spot Ticks
// =============================================================================

/// Spot events for a set of symbols, batched into one request.
#[derive(Debug)]
pub struct SpotTopic {
    symbols: HashMap<i64, String>,
    kind: StreamKind,
}

impl SpotTopic {
    /// Ticks for a single symbol.
    #[must_use]
    pub fn single(symbol: SymbolInfo) -> Self {
        Self {
            symbols: HashMap::from([(symbol.id, symbol.name)]),
            kind: StreamKind::Ticks,
        }
    }

    /// Ticks for several symbols.
    #[must_use]
    pub fn multi(symbols: impl IntoIterator<Item = SymbolInfo>) -> Self {
        Self {
            symbols: symbols.into_iter().map(|s| (s.id, s.name)).collect(),
            kind: StreamKind::MultiTicks,
        }
    }

    /// Subscribed symbol ids, ascending.
    #[must_use]
    pub fn symbol_ids(&self) -> Vec<i64> {
        let mut ids: Vec<i64> = self.symbols.keys().copied().collect();
        ids.sort_unstable();
        ids
    }
}

impl Topic for SpotTopic {
    type Item = Tick;

    fn payload_type(&self) -> u32 {
        SPOT_EVENT
    }

    fn kind(&self) -> StreamKind {
        self.kind
    }

    fn describe(&self) -> String {
        let mut names: Vec<&str> = self.symbols.values().map(String::as_str).collect();
        names.sort_unstable();
        format!("ticks:{}", names.join(","))
    }

    fn extract(&self, message: &InboundMessage) -> Option<Tick> {
        let spot = message.payload_as::<SpotEvent>()?;
        let name = self.symbols.get(&spot.symbol_id)?;
        if spot.bid.is_none() && spot.ask.is_none() {
            return None;
        }
        Some(Tick::from_spot(spot, name))
    }

    fn subscribe_requests(&self, account_id: i64) -> Vec<Box<dyn DynMessage>> {
        vec![spots_request(account_id, self.symbol_ids())]
    }

    fn unsubscribe_requests(&self, account_id: i64) -> Vec<Box<dyn DynMessage>> {
        vec![Box::new(UnsubscribeSpotsReq {
            ctid_trader_account_id: account_id,
            symbol_id: self.symbol_ids(),
        })]
    }

    fn key(&self, item: &Tick) -> i64 {
        item.symbol_id
    }

    fn merge(&self, previous: &Tick, newer: Tick) -> Tick {
        previous.merged_with(newer)
    }
}

// =============================================================================
// Live Trendbars
// =============================================================================

/// Live bars of one period, carried inside spot events.
///
/// Subscribes spots first since the broker only sends live bars to spot
/// subscribers; closing drops only the trendbar subscription.
#[derive(Debug)]
pub struct TrendbarTopic {
    symbol: SymbolInfo,
    period: TrendbarPeriod,
}

impl TrendbarTopic {
    /// Candles of `period` for `symbol`.
    #[must_use]
    pub const fn new(symbol: SymbolInfo, period: TrendbarPeriod) -> Self {
        Self { symbol, period }
    }

    /// Bar period.
    #[must_use]
    pub const fn period(&self) -> TrendbarPeriod {
        self.period
    }
}

impl Topic for TrendbarTopic {
    type Item = Candle;

    fn payload_type(&self) -> u32 {
        SPOT_EVENT
    }

    fn kind(&self) -> StreamKind {
        StreamKind::Candles
    }

    fn describe(&self) -> String {
        format!("candles:{}:{}", self.symbol.name, self.period)
    }

    fn extract(&self, message: &InboundMessage) -> Option<Candle> {
        let spot = message.payload_as::<SpotEvent>()?;
        if spot.symbol_id != self.symbol.id {
            return None;
        }
        Candle::from_spot(spot, &self.symbol.name, self.period)
    }

    fn subscribe_requests(&self, account_id: i64) -> Vec<Box<dyn DynMessage>> {
        vec![
            spots_request(account_id, vec![self.symbol.id]),
            Box::new(SubscribeLiveTrendbarReq {
                ctid_trader_account_id: account_id,
                period: self.period.as_i32(),
                symbol_id: self.symbol.id,
            }),
        ]
    }

    fn unsubscribe_requests(&self, account_id: i64) -> Vec<Box<dyn DynMessage>> {
        vec![Box::new(UnsubscribeLiveTrendbarReq {
            ctid_trader_account_id: account_id,
            period: self.period.as_i32(),
            symbol_id: self.symbol.id,
        })]
    }
}

// =============================================================================
// Depth of Market
// =============================================================================

/// Depth quotes for one symbol, folded into an order book.
#[derive(Debug)]
pub struct DepthTopic {
    symbol: SymbolInfo,
    book: Mutex<OrderBook>,
}

impl DepthTopic {
    /// Depth for `symbol`.
    #[must_use]
    pub fn new(symbol: SymbolInfo) -> Self {
        Self {
            symbol,
            book: Mutex::new(OrderBook::new()),
        }
    }

    /// Current snapshot without waiting for an update.
    #[must_use]
    pub fn snapshot(&self) -> DepthSnapshot {
        self.book.lock().snapshot(self.symbol.id, &self.symbol.name)
    }
}

impl Topic for DepthTopic {
    type Item = DepthSnapshot;

    fn payload_type(&self) -> u32 {
        DEPTH_EVENT
    }

    fn kind(&self) -> StreamKind {
        StreamKind::Depth
    }

    fn describe(&self) -> String {
        format!("depth:{}", self.symbol.name)
    }

    fn extract(&self, message: &InboundMessage) -> Option<DepthSnapshot> {
        let event = message.payload_as::<DepthEvent>()?;
        if i64::try_from(event.symbol_id).ok()? != self.symbol.id {
            return None;
        }
        let mut book = self.book.lock();
        book.apply(&event.new_quotes, &event.deleted_quotes);
        Some(book.snapshot(self.symbol.id, &self.symbol.name))
    }

    fn subscribe_requests(&self, account_id: i64) -> Vec<Box<dyn DynMessage>> {
        vec![Box::new(SubscribeDepthQuotesReq {
            ctid_trader_account_id: account_id,
            symbol_id: vec![self.symbol.id],
        })]
    }

    fn unsubscribe_requests(&self, account_id: i64) -> Vec<Box<dyn DynMessage>> {
        vec![Box::new(UnsubscribeDepthQuotesReq {
            ctid_trader_account_id: account_id,
            symbol_id: vec![self.symbol.id],
        })]
    }

    fn reset(&self) {
        self.book.lock().clear();
    }
}
