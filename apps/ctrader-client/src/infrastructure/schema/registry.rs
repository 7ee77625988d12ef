//! Message registry.
//!
//! An explicit table from payload type tag to decoder, built once and
//! injected into [`Framing`](crate::protocol::Framing). Tests can build a
//! registry holding only the messages they exercise.

use std::any::TypeId;
use std::collections::HashMap;
use std::sync::Arc;

use super::envelope::{DynMessage, Payload, WireMessage};
use super::messages::{
    AccountAuthReq, AccountAuthRes, ApplicationAuthReq, ApplicationAuthRes, DepthEvent, ErrorRes,
    HeartbeatEvent, OaErrorRes, SpotEvent, SubscribeDepthQuotesReq, SubscribeDepthQuotesRes,
    SubscribeLiveTrendbarReq, SubscribeLiveTrendbarRes, SubscribeSpotsReq, SubscribeSpotsRes,
    UnsubscribeDepthQuotesReq, UnsubscribeDepthQuotesRes, UnsubscribeLiveTrendbarReq,
    UnsubscribeLiveTrendbarRes, UnsubscribeSpotsReq, UnsubscribeSpotsRes,
};
use crate::error::{Error, Result};

type Decoder = fn(&[u8]) -> std::result::Result<Payload, prost::DecodeError>;

struct Entry {
    name: &'static str,
    type_id: TypeId,
    decode: Decoder,
}

fn decode_as<T: WireMessage + Send + Sync>(
    bytes: &[u8],
) -> std::result::Result<Payload, prost::DecodeError> {
    Ok(Arc::new(T::decode(bytes)?))
}

/// Payload type tag to decoder table.
#[derive(Default)]
pub struct MessageRegistry {
    by_tag: HashMap<u32, Entry>,
    by_type: HashMap<TypeId, u32>,
}

impl MessageRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding every message the engine sends or consumes.
    #[must_use]
    pub fn standard() -> Self {
        let mut registry = Self::new();
        registry
            .register::<ErrorRes>()
            .register::<HeartbeatEvent>()
            .register::<OaErrorRes>()
            .register::<ApplicationAuthReq>()
            .register::<ApplicationAuthRes>()
            .register::<AccountAuthReq>()
            .register::<AccountAuthRes>()
            .register::<SubscribeSpotsReq>()
            .register::<SubscribeSpotsRes>()
            .register::<UnsubscribeSpotsReq>()
            .register::<UnsubscribeSpotsRes>()
            .register::<SpotEvent>()
            .register::<SubscribeLiveTrendbarReq>()
            .register::<SubscribeLiveTrendbarRes>()
            .register::<UnsubscribeLiveTrendbarReq>()
            .register::<UnsubscribeLiveTrendbarRes>()
            .register::<DepthEvent>()
            .register::<SubscribeDepthQuotesReq>()
            .register::<SubscribeDepthQuotesRes>()
            .register::<UnsubscribeDepthQuotesReq>()
            .register::<UnsubscribeDepthQuotesRes>();
        registry
    }

    /// Add a message type. A later registration for the same tag wins.
    pub fn register<T: WireMessage + Send + Sync>(&mut self) -> &mut Self {
        let type_id = TypeId::of::<T>();
        if let Some(previous) = self.by_tag.insert(
            T::PAYLOAD_TYPE,
            Entry {
                name: T::NAME,
                type_id,
                decode: decode_as::<T>,
            },
        ) {
            self.by_type.remove(&previous.type_id);
        }
        self.by_type.insert(type_id, T::PAYLOAD_TYPE);
        self
    }

    /// Builder-style variant of [`register`](Self::register).
    #[must_use]
    pub fn with<T: WireMessage + Send + Sync>(mut self) -> Self {
        self.register::<T>();
        self
    }

    /// Resolve the payload type tag of an outbound message.
    ///
    /// # Errors
    ///
    /// Returns `Error::Protocol` if the message's type is not registered.
    pub fn type_tag_of(&self, message: &dyn DynMessage) -> Result<u32> {
        self.by_type
            .get(&message.as_any().type_id())
            .copied()
            .ok_or_else(|| {
                Error::protocol(format!(
                    "message type {} is not registered",
                    message.message_name()
                ))
            })
    }

    /// Decode payload bytes for `payload_type`.
    ///
    /// # Errors
    ///
    /// Returns `Error::Protocol` for an unknown tag and `Error::Decode` for
    /// malformed bytes.
    pub fn decode(&self, payload_type: u32, bytes: &[u8]) -> Result<Payload> {
        let entry = self
            .by_tag
            .get(&payload_type)
            .ok_or_else(|| Error::protocol(format!("unknown payload type {payload_type}")))?;
        (entry.decode)(bytes).map_err(|source| Error::Decode {
            payload_type,
            source,
        })
    }

    /// Schema name for a tag.
    #[must_use]
    pub fn name_of(&self, payload_type: u32) -> Option<&'static str> {
        self.by_tag.get(&payload_type).map(|entry| entry.name)
    }

    /// Whether a tag is known.
    #[must_use]
    pub fn contains(&self, payload_type: u32) -> bool {
        self.by_tag.contains_key(&payload_type)
    }

    /// Number of registered message types.
    #[must_use]
    pub fn len(&self) -> usize {
        self.by_tag.len()
    }

    /// Whether the registry is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.by_tag.is_empty()
    }
}

impl std::fmt::Debug for MessageRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut names: Vec<_> = self.by_tag.values().map(|entry| entry.name).collect();
        names.sort_unstable();
        f.debug_struct("MessageRegistry")
            .field("messages", &names)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use prost::Message as _;

    use super::*;
    use crate::infrastructure::schema::messages::{self, DepthQuote, Trendbar};
    use crate::infrastructure::transport::frame::HEADER_LEN;
    use crate::protocol::Framing;

    #[test]
    fn standard_registry_resolves_tags() {
        let registry = MessageRegistry::standard();
        let request = SubscribeSpotsReq {
            ctid_trader_account_id: 1,
            symbol_id: vec![1, 2],
            subscribe_to_spot_timestamp: Some(true),
        };
        assert_eq!(
            registry.type_tag_of(&request).unwrap(),
            messages::SUBSCRIBE_SPOTS_REQ
        );
        assert_eq!(
            registry.name_of(messages::SPOT_EVENT),
            Some("ProtoOASpotEvent")
        );
        assert!(registry.contains(messages::OA_ERROR_RES));
    }

    #[test]
    fn unknown_tag_is_protocol_error() {
        let registry = MessageRegistry::new().with::<HeartbeatEvent>();
        let err = registry.decode(9999, &[]).unwrap_err();
        assert!(matches!(err, Error::Protocol(_)));
    }

    #[test]
    fn unregistered_type_is_protocol_error() {
        let registry = MessageRegistry::new().with::<HeartbeatEvent>();
        let err = registry.type_tag_of(&SpotEvent::default()).unwrap_err();
        assert!(err.to_string().contains("ProtoOASpotEvent"));
    }

    #[test]
    fn malformed_payload_is_decode_error() {
        let registry = MessageRegistry::standard();
        // Field 2 declared as varint but truncated.
        let err = registry
            .decode(messages::ACCOUNT_AUTH_RES, &[0x10])
            .unwrap_err();
        assert!(matches!(
            err,
            Error::Decode {
                payload_type: messages::ACCOUNT_AUTH_RES,
                ..
            }
        ));
    }

    #[test]
    fn decode_downcasts_to_registered_type() {
        let registry = MessageRegistry::standard();
        let event = SpotEvent {
            ctid_trader_account_id: 5,
            symbol_id: 1,
            bid: Some(108_512),
            ask: None,
            trendbar: Vec::new(),
            session_close: None,
            timestamp: Some(1_700_000_000_000),
        };
        let payload = registry
            .decode(messages::SPOT_EVENT, &event.encode_to_vec())
            .unwrap();
        assert_eq!(payload.downcast_ref::<SpotEvent>(), Some(&event));
        assert!(payload.downcast_ref::<DepthEvent>().is_none());
    }

    /// Frame `message`, read it back through the standard registry, and
    /// return its tag.
    fn assert_round_trip<T: WireMessage + Send + Sync + PartialEq>(message: T) -> u32 {
        let framing = Framing::new(Arc::new(MessageRegistry::standard()));
        let frame = framing.encode(&message, Some("req-1")).unwrap();
        let envelope = framing.decode(&frame[HEADER_LEN..]).unwrap();
        assert_eq!(envelope.payload_type, T::PAYLOAD_TYPE, "{}", T::NAME);
        assert_eq!(envelope.correlation_id(), Some("req-1"));

        let payload = framing.extract_payload(&envelope).unwrap();
        assert_eq!(payload.message_name(), T::NAME);
        assert_eq!(payload.downcast_ref::<T>(), Some(&message), "{}", T::NAME);
        T::PAYLOAD_TYPE
    }

    #[test]
    fn every_standard_message_survives_framing() {
        let trendbar = Trendbar {
            volume: 1_250,
            period: Some(1),
            low: Some(108_400),
            delta_open: Some(12),
            delta_close: Some(30),
            delta_high: Some(55),
            utc_timestamp_in_minutes: Some(28_333_333),
        };
        let quote = DepthQuote {
            id: 77,
            size: 150_000,
            bid: Some(108_510),
            ask: None,
        };

        let tags = vec![
            assert_round_trip(ErrorRes {
                error_code: "CH_CLIENT_AUTH_FAILURE".to_string(),
                description: Some("bad secret".to_string()),
                maintenance_end_timestamp: Some(1_700_000_000_000),
            }),
            assert_round_trip(HeartbeatEvent {}),
            assert_round_trip(OaErrorRes {
                ctid_trader_account_id: Some(42),
                error_code: "INVALID_REQUEST".to_string(),
                description: Some("unknown symbol".to_string()),
                maintenance_end_timestamp: Some(1_700_000_000_000),
            }),
            assert_round_trip(ApplicationAuthReq {
                client_id: "client".to_string(),
                client_secret: "secret".to_string(),
            }),
            assert_round_trip(ApplicationAuthRes {}),
            assert_round_trip(AccountAuthReq {
                ctid_trader_account_id: 42,
                access_token: "token".to_string(),
            }),
            assert_round_trip(AccountAuthRes {
                ctid_trader_account_id: 42,
            }),
            assert_round_trip(SubscribeSpotsReq {
                ctid_trader_account_id: 42,
                symbol_id: vec![1, 2, 3],
                subscribe_to_spot_timestamp: Some(true),
            }),
            assert_round_trip(SubscribeSpotsRes {
                ctid_trader_account_id: 42,
            }),
            assert_round_trip(UnsubscribeSpotsReq {
                ctid_trader_account_id: 42,
                symbol_id: vec![3, 1],
            }),
            assert_round_trip(UnsubscribeSpotsRes {
                ctid_trader_account_id: 42,
            }),
            assert_round_trip(SpotEvent {
                ctid_trader_account_id: 42,
                symbol_id: 1,
                bid: Some(108_512),
                ask: Some(108_515),
                trendbar: vec![trendbar.clone(), trendbar],
                session_close: Some(108_100),
                timestamp: Some(1_700_000_000_123),
            }),
            assert_round_trip(SubscribeLiveTrendbarReq {
                ctid_trader_account_id: 42,
                period: 5,
                symbol_id: 1,
            }),
            assert_round_trip(SubscribeLiveTrendbarRes {
                ctid_trader_account_id: 42,
            }),
            assert_round_trip(UnsubscribeLiveTrendbarReq {
                ctid_trader_account_id: 42,
                period: 5,
                symbol_id: 1,
            }),
            assert_round_trip(UnsubscribeLiveTrendbarRes {
                ctid_trader_account_id: 42,
            }),
            assert_round_trip(DepthEvent {
                ctid_trader_account_id: 42,
                symbol_id: 1,
                new_quotes: vec![
                    quote.clone(),
                    DepthQuote {
                        id: 78,
                        bid: None,
                        ask: Some(108_520),
                        ..quote
                    },
                ],
                deleted_quotes: vec![70, 71],
            }),
            assert_round_trip(SubscribeDepthQuotesReq {
                ctid_trader_account_id: 42,
                symbol_id: vec![1, 2],
            }),
            assert_round_trip(SubscribeDepthQuotesRes {
                ctid_trader_account_id: 42,
            }),
            assert_round_trip(UnsubscribeDepthQuotesReq {
                ctid_trader_account_id: 42,
                symbol_id: vec![2],
            }),
            assert_round_trip(UnsubscribeDepthQuotesRes {
                ctid_trader_account_id: 42,
            }),
        ];

        let registry = MessageRegistry::standard();
        let covered: HashSet<u32> = tags.into_iter().collect();
        assert_eq!(covered.len(), registry.len());
        assert!(covered.iter().all(|tag| registry.contains(*tag)));
    }

    #[test]
    fn later_registration_replaces_tag() {
        let mut registry = MessageRegistry::new();
        registry.register::<ErrorRes>();
        assert_eq!(registry.len(), 1);
        registry.register::<ErrorRes>();
        assert_eq!(registry.len(), 1);
        assert!(!registry.is_empty());
    }
}
