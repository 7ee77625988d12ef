//! Broker message subset used by the engine itself.
//!
//! Field tags follow the Open API proto2 schema. The redundant
//! `payloadType` field every message repeats at tag 1 is omitted; the
//! envelope already carries it and decoders skip it.

use super::envelope::{DynMessage, Payload, WireMessage};

macro_rules! wire_message {
    ($ty:ident, $tag:expr, $name:literal) => {
        impl WireMessage for $ty {
            const PAYLOAD_TYPE: u32 = $tag;
            const NAME: &'static str = $name;
        }
    };
}

// =============================================================================
// Payload type tags
// =============================================================================

/// Common-layer error response.
pub const ERROR_RES: u32 = 50;
/// Heartbeat, sent by both sides.
pub const HEARTBEAT_EVENT: u32 = 51;
/// Application auth request.
pub const APPLICATION_AUTH_REQ: u32 = 2100;
/// Application auth response.
pub const APPLICATION_AUTH_RES: u32 = 2101;
/// Account auth request.
pub const ACCOUNT_AUTH_REQ: u32 = 2102;
/// Account auth response.
pub const ACCOUNT_AUTH_RES: u32 = 2103;
/// Execution event (orders, deals); dispatched to domain handlers.
pub const EXECUTION_EVENT: u32 = 2126;
/// Spot subscribe request.
pub const SUBSCRIBE_SPOTS_REQ: u32 = 2127;
/// Spot subscribe response.
pub const SUBSCRIBE_SPOTS_RES: u32 = 2128;
/// Spot unsubscribe request.
pub const UNSUBSCRIBE_SPOTS_REQ: u32 = 2129;
/// Spot unsubscribe response.
pub const UNSUBSCRIBE_SPOTS_RES: u32 = 2130;
/// Spot price event.
pub const SPOT_EVENT: u32 = 2131;
/// Live trendbar subscribe request.
pub const SUBSCRIBE_LIVE_TRENDBAR_REQ: u32 = 2135;
/// Live trendbar unsubscribe request.
pub const UNSUBSCRIBE_LIVE_TRENDBAR_REQ: u32 = 2136;
/// Account-layer error response.
pub const OA_ERROR_RES: u32 = 2142;
/// Depth quotes event.
pub const DEPTH_EVENT: u32 = 2155;
/// Depth subscribe request.
pub const SUBSCRIBE_DEPTH_QUOTES_REQ: u32 = 2156;
/// Depth subscribe response.
pub const SUBSCRIBE_DEPTH_QUOTES_RES: u32 = 2157;
/// Depth unsubscribe request.
pub const UNSUBSCRIBE_DEPTH_QUOTES_REQ: u32 = 2158;
/// Depth unsubscribe response.
pub const UNSUBSCRIBE_DEPTH_QUOTES_RES: u32 = 2159;
/// Live trendbar subscribe response.
pub const SUBSCRIBE_LIVE_TRENDBAR_RES: u32 = 2165;
/// Live trendbar unsubscribe response.
pub const UNSUBSCRIBE_LIVE_TRENDBAR_RES: u32 = 2166;

// =============================================================================
// Common messages
// =============================================================================

/// `ProtoHeartbeatEvent`.
#[derive(Clone, PartialEq, Eq, prost::Message)]
pub struct HeartbeatEvent {}
wire_message!(HeartbeatEvent, HEARTBEAT_EVENT, "ProtoHeartbeatEvent");

/// `ProtoErrorRes`.
#[derive(Clone, PartialEq, Eq, prost::Message)]
pub struct ErrorRes {
    /// Error code.
    #[prost(string, required, tag = "2")]
    pub error_code: String,
    /// Human-readable description.
    #[prost(string, optional, tag = "3")]
    pub description: Option<String>,
    /// End of scheduled maintenance, epoch millis.
    #[prost(uint64, optional, tag = "4")]
    pub maintenance_end_timestamp: Option<u64>,
}
wire_message!(ErrorRes, ERROR_RES, "ProtoErrorRes");

/// `ProtoOAErrorRes`.
#[derive(Clone, PartialEq, Eq, prost::Message)]
pub struct OaErrorRes {
    /// Account the error relates to.
    #[prost(int64, optional, tag = "2")]
    pub ctid_trader_account_id: Option<i64>,
    /// Error code.
    #[prost(string, required, tag = "3")]
    pub error_code: String,
    /// Human-readable description.
    #[prost(string, optional, tag = "4")]
    pub description: Option<String>,
    /// End of scheduled maintenance, epoch millis.
    #[prost(int64, optional, tag = "5")]
    pub maintenance_end_timestamp: Option<i64>,
}
wire_message!(OaErrorRes, OA_ERROR_RES, "ProtoOAErrorRes");

/// Extract `(code, description)` when `payload` is either error response.
#[must_use]
pub fn error_response(payload: &dyn DynMessage) -> Option<(String, String)> {
    if let Some(err) = payload.downcast_ref::<OaErrorRes>() {
        return Some((
            err.error_code.clone(),
            err.description.clone().unwrap_or_default(),
        ));
    }
    payload.downcast_ref::<ErrorRes>().map(|err| {
        (
            err.error_code.clone(),
            err.description.clone().unwrap_or_default(),
        )
    })
}

/// Convert an error response payload into an engine error.
///
/// # Errors
///
/// Returns `Error::Protocol` naming the broker error code when `payload` is
/// an error response; otherwise returns the payload unchanged.
pub fn ensure_not_error(payload: Payload) -> crate::Result<Payload> {
    match error_response(payload.as_ref()) {
        Some((code, description)) => Err(crate::Error::protocol(format!(
            "broker returned {code}: {description}"
        ))),
        None => Ok(payload),
    }
}

// =============================================================================
// Authentication
// =============================================================================

/// `ProtoOAApplicationAuthReq`.
#[derive(Clone, PartialEq, Eq, prost::Message)]
pub struct ApplicationAuthReq {
    /// Application client id.
    #[prost(string, required, tag = "2")]
    pub client_id: String,
    /// Application client secret.
    #[prost(string, required, tag = "3")]
    pub client_secret: String,
}
wire_message!(
    ApplicationAuthReq,
    APPLICATION_AUTH_REQ,
    "ProtoOAApplicationAuthReq"
);

/// `ProtoOAApplicationAuthRes`.
#[derive(Clone, PartialEq, Eq, prost::Message)]
pub struct ApplicationAuthRes {}
wire_message!(
    ApplicationAuthRes,
    APPLICATION_AUTH_RES,
    "ProtoOAApplicationAuthRes"
);

/// `ProtoOAAccountAuthReq`.
#[derive(Clone, PartialEq, Eq, prost::Message)]
pub struct AccountAuthReq {
    /// Trading account id.
    #[prost(int64, required, tag = "2")]
    pub ctid_trader_account_id: i64,
    /// OAuth access token.
    #[prost(string, required, tag = "3")]
    pub access_token: String,
}
wire_message!(AccountAuthReq, ACCOUNT_AUTH_REQ, "ProtoOAAccountAuthReq");

/// `ProtoOAAccountAuthRes`.
#[derive(Clone, PartialEq, Eq, prost::Message)]
pub struct AccountAuthRes {
    /// Authorized account id.
    #[prost(int64, required, tag = "2")]
    pub ctid_trader_account_id: i64,
}
wire_message!(AccountAuthRes, ACCOUNT_AUTH_RES, "ProtoOAAccountAuthRes");

// =============================================================================
// Spots and live trendbars
// =============================================================================

/// `ProtoOASubscribeSpotsReq`.
#[derive(Clone, PartialEq, Eq, prost::Message)]
pub struct SubscribeSpotsReq {
    /// Trading account id.
    #[prost(int64, required, tag = "2")]
    pub ctid_trader_account_id: i64,
    /// Symbols to subscribe.
    #[prost(int64, repeated, packed = "false", tag = "3")]
    pub symbol_id: Vec<i64>,
    /// Ask the server to stamp every spot event.
    #[prost(bool, optional, tag = "4")]
    pub subscribe_to_spot_timestamp: Option<bool>,
}
wire_message!(
    SubscribeSpotsReq,
    SUBSCRIBE_SPOTS_REQ,
    "ProtoOASubscribeSpotsReq"
);

/// `ProtoOASubscribeSpotsRes`.
#[derive(Clone, PartialEq, Eq, prost::Message)]
pub struct SubscribeSpotsRes {
    /// Trading account id.
    #[prost(int64, required, tag = "2")]
    pub ctid_trader_account_id: i64,
}
wire_message!(
    SubscribeSpotsRes,
    SUBSCRIBE_SPOTS_RES,
    "ProtoOASubscribeSpotsRes"
);

/// `ProtoOAUnsubscribeSpotsReq`.
#[derive(Clone, PartialEq, Eq, prost::Message)]
pub struct UnsubscribeSpotsReq {
    /// Trading account id.
    #[prost(int64, required, tag = "2")]
    pub ctid_trader_account_id: i64,
    /// Symbols to unsubscribe.
    #[prost(int64, repeated, packed = "false", tag = "3")]
    pub symbol_id: Vec<i64>,
}
wire_message!(
    UnsubscribeSpotsReq,
    UNSUBSCRIBE_SPOTS_REQ,
    "ProtoOAUnsubscribeSpotsReq"
);

/// `ProtoOAUnsubscribeSpotsRes`.
#[derive(Clone, PartialEq, Eq, prost::Message)]
pub struct UnsubscribeSpotsRes {
    /// Trading account id.
    #[prost(int64, required, tag = "2")]
    pub ctid_trader_account_id: i64,
}
wire_message!(
    UnsubscribeSpotsRes,
    UNSUBSCRIBE_SPOTS_RES,
    "ProtoOAUnsubscribeSpotsRes"
);

/// `ProtoOATrendbar`, prices relative to `low` in 1e-5 units.
#[derive(Clone, PartialEq, Eq, prost::Message)]
pub struct Trendbar {
    /// Tick volume.
    #[prost(int64, required, tag = "3")]
    pub volume: i64,
    /// Bar period (`ProtoOATrendbarPeriod`).
    #[prost(int32, optional, tag = "4")]
    pub period: Option<i32>,
    /// Low price.
    #[prost(int64, optional, tag = "5")]
    pub low: Option<i64>,
    /// Open minus low.
    #[prost(uint64, optional, tag = "6")]
    pub delta_open: Option<u64>,
    /// Close minus low.
    #[prost(uint64, optional, tag = "7")]
    pub delta_close: Option<u64>,
    /// High minus low.
    #[prost(uint64, optional, tag = "8")]
    pub delta_high: Option<u64>,
    /// Bar open time in minutes since the epoch.
    #[prost(uint32, optional, tag = "9")]
    pub utc_timestamp_in_minutes: Option<u32>,
}

/// `ProtoOASpotEvent`.
#[derive(Clone, PartialEq, Eq, prost::Message)]
pub struct SpotEvent {
    /// Trading account id.
    #[prost(int64, required, tag = "2")]
    pub ctid_trader_account_id: i64,
    /// Symbol the prices belong to.
    #[prost(int64, required, tag = "3")]
    pub symbol_id: i64,
    /// Bid in 1e-5 units, present when changed.
    #[prost(uint64, optional, tag = "4")]
    pub bid: Option<u64>,
    /// Ask in 1e-5 units, present when changed.
    #[prost(uint64, optional, tag = "5")]
    pub ask: Option<u64>,
    /// Live trendbars for subscribed periods.
    #[prost(message, repeated, tag = "6")]
    pub trendbar: Vec<Trendbar>,
    /// Previous session close.
    #[prost(uint64, optional, tag = "7")]
    pub session_close: Option<u64>,
    /// Server timestamp, epoch millis.
    #[prost(int64, optional, tag = "8")]
    pub timestamp: Option<i64>,
}
wire_message!(SpotEvent, SPOT_EVENT, "ProtoOASpotEvent");

/// `ProtoOASubscribeLiveTrendbarReq`.
#[derive(Clone, PartialEq, Eq, prost::Message)]
pub struct SubscribeLiveTrendbarReq {
    /// Trading account id.
    #[prost(int64, required, tag = "2")]
    pub ctid_trader_account_id: i64,
    /// Bar period.
    #[prost(int32, required, tag = "3")]
    pub period: i32,
    /// Symbol id.
    #[prost(int64, required, tag = "4")]
    pub symbol_id: i64,
}
wire_message!(
    SubscribeLiveTrendbarReq,
    SUBSCRIBE_LIVE_TRENDBAR_REQ,
    "ProtoOASubscribeLiveTrendbarReq"
);

/// `ProtoOASubscribeLiveTrendbarRes`.
#[derive(Clone, PartialEq, Eq, prost::Message)]
pub struct SubscribeLiveTrendbarRes {
    /// Trading account id.
    #[prost(int64, required, tag = "2")]
    pub ctid_trader_account_id: i64,
}
wire_message!(
    SubscribeLiveTrendbarRes,
    SUBSCRIBE_LIVE_TRENDBAR_RES,
    "ProtoOASubscribeLiveTrendbarRes"
);

/// `ProtoOAUnsubscribeLiveTrendbarReq`.
#[derive(Clone, PartialEq, Eq, prost::Message)]
pub struct UnsubscribeLiveTrendbarReq {
    /// Trading account id.
    #[prost(int64, required, tag = "2")]
    pub ctid_trader_account_id: i64,
    /// Bar period.
    #[prost(int32, required, tag = "3")]
    pub period: i32,
    /// Symbol id.
    #[prost(int64, required, tag = "4")]
    pub symbol_id: i64,
}
wire_message!(
    UnsubscribeLiveTrendbarReq,
    UNSUBSCRIBE_LIVE_TRENDBAR_REQ,
    "ProtoOAUnsubscribeLiveTrendbarReq"
);

/// `ProtoOAUnsubscribeLiveTrendbarRes`.
#[derive(Clone, PartialEq, Eq, prost::Message)]
pub struct UnsubscribeLiveTrendbarRes {
    /// Trading account id.
    #[prost(int64, required, tag = "2")]
    pub ctid_trader_account_id: i64,
}
wire_message!(
    UnsubscribeLiveTrendbarRes,
    UNSUBSCRIBE_LIVE_TRENDBAR_RES,
    "ProtoOAUnsubscribeLiveTrendbarRes"
);

// =============================================================================
// Depth of market
// =============================================================================

/// `ProtoOADepthQuote`; exactly one of `bid`/`ask` is set.
#[derive(Clone, PartialEq, Eq, prost::Message)]
pub struct DepthQuote {
    /// Quote id, unique per symbol.
    #[prost(uint64, required, tag = "3")]
    pub id: u64,
    /// Volume in cents.
    #[prost(uint64, required, tag = "4")]
    pub size: u64,
    /// Bid price in 1e-5 units.
    #[prost(uint64, optional, tag = "5")]
    pub bid: Option<u64>,
    /// Ask price in 1e-5 units.
    #[prost(uint64, optional, tag = "6")]
    pub ask: Option<u64>,
}

/// `ProtoOADepthEvent`.
#[derive(Clone, PartialEq, Eq, prost::Message)]
pub struct DepthEvent {
    /// Trading account id.
    #[prost(int64, required, tag = "2")]
    pub ctid_trader_account_id: i64,
    /// Symbol id.
    #[prost(uint64, required, tag = "3")]
    pub symbol_id: u64,
    /// Added or replaced quotes.
    #[prost(message, repeated, tag = "4")]
    pub new_quotes: Vec<DepthQuote>,
    /// Ids of removed quotes.
    #[prost(uint64, repeated, tag = "5")]
    pub deleted_quotes: Vec<u64>,
}
wire_message!(DepthEvent, DEPTH_EVENT, "ProtoOADepthEvent");

/// `ProtoOASubscribeDepthQuotesReq`.
#[derive(Clone, PartialEq, Eq, prost::Message)]
pub struct SubscribeDepthQuotesReq {
    /// Trading account id.
    #[prost(int64, required, tag = "2")]
    pub ctid_trader_account_id: i64,
    /// Symbols to subscribe.
    #[prost(int64, repeated, packed = "false", tag = "3")]
    pub symbol_id: Vec<i64>,
}
wire_message!(
    SubscribeDepthQuotesReq,
    SUBSCRIBE_DEPTH_QUOTES_REQ,
    "ProtoOASubscribeDepthQuotesReq"
);

/// `ProtoOASubscribeDepthQuotesRes`.
#[derive(Clone, PartialEq, Eq, prost::Message)]
pub struct SubscribeDepthQuotesRes {
    /// Trading account id.
    #[prost(int64, required, tag = "2")]
    pub ctid_trader_account_id: i64,
}
wire_message!(
    SubscribeDepthQuotesRes,
    SUBSCRIBE_DEPTH_QUOTES_RES,
    "ProtoOASubscribeDepthQuotesRes"
);

/// `ProtoOAUnsubscribeDepthQuotesReq`.
#[derive(Clone, PartialEq, Eq, prost::Message)]
pub struct UnsubscribeDepthQuotesReq {
    /// Trading account id.
    #[prost(int64, required, tag = "2")]
    pub ctid_trader_account_id: i64,
    /// Symbols to unsubscribe.
    #[prost(int64, repeated, packed = "false", tag = "3")]
    pub symbol_id: Vec<i64>,
}
wire_message!(
    UnsubscribeDepthQuotesReq,
    UNSUBSCRIBE_DEPTH_QUOTES_REQ,
    "ProtoOAUnsubscribeDepthQuotesReq"
);

/// `ProtoOAUnsubscribeDepthQuotesRes`.
#[derive(Clone, PartialEq, Eq, prost::Message)]
pub struct UnsubscribeDepthQuotesRes {
    /// Trading account id.
    #[prost(int64, required, tag = "2")]
    pub ctid_trader_account_id: i64,
}
wire_message!(
    UnsubscribeDepthQuotesRes,
    UNSUBSCRIBE_DEPTH_QUOTES_RES,
    "ProtoOAUnsubscribeDepthQuotesRes"
);

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    #[test]
    fn error_response_reads_both_layers() {
        let oa: Payload = Arc::new(OaErrorRes {
            ctid_trader_account_id: Some(1),
            error_code: "INVALID_REQUEST".to_string(),
            description: Some("bad symbol".to_string()),
            maintenance_end_timestamp: None,
        });
        assert_eq!(
            error_response(oa.as_ref()),
            Some(("INVALID_REQUEST".to_string(), "bad symbol".to_string()))
        );

        let common: Payload = Arc::new(ErrorRes {
            error_code: "CH_CLIENT_AUTH_FAILURE".to_string(),
            description: None,
            maintenance_end_timestamp: None,
        });
        assert_eq!(
            error_response(common.as_ref()),
            Some(("CH_CLIENT_AUTH_FAILURE".to_string(), String::new()))
        );
    }

    #[test]
    fn ensure_not_error_passes_regular_payloads() {
        let ok: Payload = Arc::new(SubscribeSpotsRes {
            ctid_trader_account_id: 9,
        });
        assert!(ensure_not_error(ok).is_ok());

        let err: Payload = Arc::new(OaErrorRes {
            error_code: "ALREADY_SUBSCRIBED".to_string(),
            ..OaErrorRes::default()
        });
        let message = ensure_not_error(err).unwrap_err().to_string();
        assert!(message.contains("ALREADY_SUBSCRIBED"));
    }

    #[test]
    fn wire_names_and_tags() {
        assert_eq!(SpotEvent::PAYLOAD_TYPE, 2131);
        assert_eq!(SpotEvent::NAME, "ProtoOASpotEvent");
        assert_eq!(DepthEvent::PAYLOAD_TYPE, 2155);
        assert_eq!(HeartbeatEvent::PAYLOAD_TYPE, 51);
    }
}
