//! Market Data Value Objects
//!
//! Ticks and candles as handed to stream consumers. Wire prices are
//! integers in units of 1e-5; they become exact decimals here.

use chrono::{DateTime, TimeZone, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::infrastructure::schema::messages::{SpotEvent, Trendbar};

/// Decimal places of an integer wire price.
pub const PRICE_SCALE: u32 = 5;

/// Convert an integer wire price to a decimal.
#[must_use]
pub fn price_from_wire(raw: u64) -> Option<Decimal> {
    i64::try_from(raw).ok().map(|v| Decimal::new(v, PRICE_SCALE))
}

fn millis_to_utc(millis: i64) -> Option<DateTime<Utc>> {
    Utc.timestamp_millis_opt(millis).single()
}

// =============================================================================
// Tick
// =============================================================================

/// One bid/ask update for a symbol.
///
/// The broker omits a side that did not change, so either side may be
/// missing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tick {
    /// Broker symbol id.
    pub symbol_id: i64,
    /// Symbol name.
    pub symbol: String,
    /// Bid price.
    pub bid: Option<Decimal>,
    /// Ask price.
    pub ask: Option<Decimal>,
    /// Server timestamp, or receipt time when the server sent none.
    pub timestamp: DateTime<Utc>,
}

impl Tick {
    /// Build a tick from a spot event.
    #[must_use]
    pub fn from_spot(event: &SpotEvent, symbol: &str) -> Self {
        Self {
            symbol_id: event.symbol_id,
            symbol: symbol.to_string(),
            bid: event.bid.and_then(price_from_wire),
            ask: event.ask.and_then(price_from_wire),
            timestamp: event
                .timestamp
                .and_then(millis_to_utc)
                .unwrap_or_else(Utc::now),
        }
    }

    /// Midpoint of bid and ask when both are known.
    #[must_use]
    pub fn mid(&self) -> Option<Decimal> {
        Some((self.bid? + self.ask?) / Decimal::TWO)
    }

    /// Ask minus bid when both are known.
    #[must_use]
    pub fn spread(&self) -> Option<Decimal> {
        Some(self.ask? - self.bid?)
    }

    /// Overlay `newer` on this tick, keeping sides `newer` lacks.
    #[must_use]
    pub fn merged_with(&self, newer: Self) -> Self {
        Self {
            bid: newer.bid.or(self.bid),
            ask: newer.ask.or(self.ask),
            ..newer
        }
    }
}

// =============================================================================
// Trendbar Period
// =============================================================================

/// Bar period as numbered on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TrendbarPeriod {
    /// 1 minute.
    M1,
    /// 2 minutes.
    M2,
    /// 3 minutes.
    M3,
    /// 4 minutes.
    M4,
    /// 5 minutes.
    M5,
    /// 10 minutes.
    M10,
    /// 15 minutes.
    M15,
    /// 30 minutes.
    M30,
    /// 1 hour.
    H1,
    /// 4 hours.
    H4,
    /// 12 hours.
    H12,
    /// 1 day.
    D1,
    /// 1 week.
    W1,
    /// 1 month.
    MN1,
}

impl TrendbarPeriod {
    const ALL: [Self; 14] = [
        Self::M1,
        Self::M2,
        Self::M3,
        Self::M4,
        Self::M5,
        Self::M10,
        Self::M15,
        Self::M30,
        Self::H1,
        Self::H4,
        Self::H12,
        Self::D1,
        Self::W1,
        Self::MN1,
    ];

    /// Wire value.
    #[must_use]
    pub const fn as_i32(&self) -> i32 {
        match self {
            Self::M1 => 1,
            Self::M2 => 2,
            Self::M3 => 3,
            Self::M4 => 4,
            Self::M5 => 5,
            Self::M10 => 6,
            Self::M15 => 7,
            Self::M30 => 8,
            Self::H1 => 9,
            Self::H4 => 10,
            Self::H12 => 11,
            Self::D1 => 12,
            Self::W1 => 13,
            Self::MN1 => 14,
        }
    }

    /// Period from its wire value.
    #[must_use]
    pub fn from_i32(value: i32) -> Option<Self> {
        Self::ALL.into_iter().find(|p| p.as_i32() == value)
    }

    /// Get the period name.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::M1 => "M1",
            Self::M2 => "M2",
            Self::M3 => "M3",
            Self::M4 => "M4",
            Self::M5 => "M5",
            Self::M10 => "M10",
            Self::M15 => "M15",
            Self::M30 => "M30",
            Self::H1 => "H1",
            Self::H4 => "H4",
            Self::H12 => "H12",
            Self::D1 => "D1",
            Self::W1 => "W1",
            Self::MN1 => "MN1",
        }
    }

    /// Parse a period name such as `m5` or `H1`.
    #[must_use]
    pub fn parse(name: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|p| p.as_str().eq_ignore_ascii_case(name.trim()))
    }
}

impl std::fmt::Display for TrendbarPeriod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// Candle
// =============================================================================

/// OHLC bar built from a live trendbar.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Candle {
    /// Broker symbol id.
    pub symbol_id: i64,
    /// Symbol name.
    pub symbol: String,
    /// Bar period.
    pub period: TrendbarPeriod,
    /// Open price.
    pub open: Decimal,
    /// High price.
    pub high: Decimal,
    /// Low price.
    pub low: Decimal,
    /// Close price; the latest price while the bar is still forming.
    pub close: Decimal,
    /// Tick volume.
    pub volume: i64,
    /// Bar open time.
    pub timestamp: DateTime<Utc>,
}

impl Candle {
    /// Build a candle from the live trendbar of `period` in a spot event.
    ///
    /// Trendbar prices are deltas over `low`. A forming bar may omit its
    /// close delta; the spot bid stands in for it.
    #[must_use]
    pub fn from_spot(event: &SpotEvent, symbol: &str, period: TrendbarPeriod) -> Option<Self> {
        let bar = event
            .trendbar
            .iter()
            .find(|bar| bar.period == Some(period.as_i32()))?;
        Self::from_trendbar(event.symbol_id, symbol, period, bar, event.bid)
    }

    fn from_trendbar(
        symbol_id: i64,
        symbol: &str,
        period: TrendbarPeriod,
        bar: &Trendbar,
        fallback_close: Option<u64>,
    ) -> Option<Self> {
        let low = u64::try_from(bar.low?).ok()?;
        let open = low.checked_add(bar.delta_open.unwrap_or(0))?;
        let high = low.checked_add(bar.delta_high.unwrap_or(0))?;
        let close = match bar.delta_close {
            Some(delta) => low.checked_add(delta)?,
            None => fallback_close.unwrap_or(open),
        };
        let timestamp = bar
            .utc_timestamp_in_minutes
            .and_then(|minutes| millis_to_utc(i64::from(minutes) * 60_000))
            .unwrap_or_else(Utc::now);

        Some(Self {
            symbol_id,
            symbol: symbol.to_string(),
            period,
            open: price_from_wire(open)?,
            high: price_from_wire(high)?,
            low: price_from_wire(low)?,
            close: price_from_wire(close)?,
            volume: bar.volume,
            timestamp,
        })
    }
}

#[cfg(test)]
mod tests {
    use test_case::test_case;

    use super::*;

    fn px(raw: i64) -> Decimal {
        Decimal::new(raw, PRICE_SCALE)
    }

    fn spot(bid: Option<u64>, ask: Option<u64>) -> SpotEvent {
        SpotEvent {
            ctid_trader_account_id: 1,
            symbol_id: 7,
            bid,
            ask,
            timestamp: Some(1_700_000_000_000),
            ..SpotEvent::default()
        }
    }

    #[test]
    fn tick_scales_wire_prices() {
        let tick = Tick::from_spot(&spot(Some(108_512), Some(108_530)), "EURUSD");
        assert_eq!(tick.bid, Some(px(108_512)));
        assert_eq!(tick.ask, Some(px(108_530)));
        assert_eq!(tick.spread(), Some(px(18)));
        assert_eq!(tick.mid(), Some(px(108_521)));
        assert_eq!(tick.timestamp.timestamp_millis(), 1_700_000_000_000);
    }

    #[test]
    fn tick_merge_carries_missing_side() {
        let first = Tick::from_spot(&spot(Some(100_000), Some(100_010)), "EURUSD");
        let bid_only = Tick::from_spot(&spot(Some(100_002), None), "EURUSD");
        let merged = first.merged_with(bid_only);
        assert_eq!(merged.bid, Some(px(100_002)));
        assert_eq!(merged.ask, Some(px(100_010)));
    }

    #[test_case(1 => Some(TrendbarPeriod::M1))]
    #[test_case(7 => Some(TrendbarPeriod::M15))]
    #[test_case(14 => Some(TrendbarPeriod::MN1))]
    #[test_case(0 => None)]
    #[test_case(15 => None)]
    fn period_from_wire(value: i32) -> Option<TrendbarPeriod> {
        TrendbarPeriod::from_i32(value)
    }

    #[test]
    fn period_parse_is_case_insensitive() {
        assert_eq!(TrendbarPeriod::parse("h4"), Some(TrendbarPeriod::H4));
        assert_eq!(TrendbarPeriod::parse(" M30 "), Some(TrendbarPeriod::M30));
        assert_eq!(TrendbarPeriod::parse("Y1"), None);
        assert_eq!(TrendbarPeriod::D1.to_string(), "D1");
    }

    #[test]
    fn candle_from_trendbar_deltas() {
        let mut event = spot(Some(100_050), None);
        event.trendbar = vec![
            Trendbar {
                volume: 3,
                period: Some(TrendbarPeriod::M5.as_i32()),
                low: Some(200_000),
                ..Trendbar::default()
            },
            Trendbar {
                volume: 42,
                period: Some(TrendbarPeriod::M1.as_i32()),
                low: Some(100_000),
                delta_open: Some(20),
                delta_high: Some(80),
                delta_close: Some(50),
                utc_timestamp_in_minutes: Some(28_333_333),
            },
        ];

        let candle = Candle::from_spot(&event, "EURUSD", TrendbarPeriod::M1).unwrap();
        assert_eq!(candle.low, px(100_000));
        assert_eq!(candle.open, px(100_020));
        assert_eq!(candle.high, px(100_080));
        assert_eq!(candle.close, px(100_050));
        assert_eq!(candle.volume, 42);
        assert_eq!(candle.timestamp.timestamp(), 28_333_333 * 60);
    }

    #[test]
    fn forming_bar_closes_at_spot_bid() {
        let mut event = spot(Some(100_070), None);
        event.trendbar = vec![Trendbar {
            volume: 1,
            period: Some(TrendbarPeriod::M1.as_i32()),
            low: Some(100_000),
            delta_high: Some(90),
            ..Trendbar::default()
        }];
        let candle = Candle::from_spot(&event, "EURUSD", TrendbarPeriod::M1).unwrap();
        assert_eq!(candle.close, px(100_070));
    }

    #[test]
    fn candle_requires_matching_period() {
        let mut event = spot(None, None);
        event.trendbar = vec![Trendbar {
            period: Some(TrendbarPeriod::H1.as_i32()),
            low: Some(1),
            ..Trendbar::default()
        }];
        assert!(Candle::from_spot(&event, "EURUSD", TrendbarPeriod::M1).is_none());
    }

    #[test]
    fn serializes_decimals() {
        let tick = Tick::from_spot(&spot(Some(108_512), None), "EURUSD");
        let json = serde_json::to_value(&tick).unwrap();
        assert_eq!(json["symbol"], "EURUSD");
        assert!(json["ask"].is_null());
    }
}
