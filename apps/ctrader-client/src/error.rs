//! Error Taxonomy
//!
//! One error type for the whole engine. Variants map onto four failure
//! classes: connection (refused, reset, closed, oversized frame), protocol
//! (malformed envelope, unknown type tag), timeout, and authentication.
//!
//! Authentication and configuration failures are terminal; everything else
//! is considered transient by the reconnect loop.

use std::time::Duration;

use crate::infrastructure::config::ConfigError;

/// Result alias used throughout the crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Engine error.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Socket refused, reset or closed, or a frame violated the size limits.
    #[error("connection error: {0}")]
    Connection(String),

    /// Underlying I/O failure on the socket.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Malformed envelope or unknown payload type.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Payload bytes did not decode as the registered message type.
    #[error("failed to decode payload type {payload_type}: {source}")]
    Decode {
        /// Payload type tag of the envelope.
        payload_type: u32,
        /// Protobuf decode failure.
        #[source]
        source: prost::DecodeError,
    },

    /// A request deadline elapsed before its response arrived.
    #[error("{type_name} timed out after {timeout:?}")]
    Timeout {
        /// Configured deadline.
        timeout: Duration,
        /// Request type name for diagnostics.
        type_name: String,
    },

    /// The request was abandoned because its session shut down.
    #[error("request cancelled: {0}")]
    Cancelled(String),

    /// Handshake failed after exhausting its attempts.
    #[error("authentication failed after {attempts} attempt(s): {message}")]
    Authentication {
        /// Last failure description.
        message: String,
        /// Broker error code of the last failure, if any.
        code: Option<String>,
        /// Number of attempts made.
        attempts: u32,
    },

    /// The reconnect loop gave up.
    #[error("reconnect gave up after {attempts} attempt(s): {last}")]
    ReconnectExhausted {
        /// Number of connect attempts made.
        attempts: u32,
        /// Error returned by the final attempt.
        last: Box<Self>,
    },

    /// A symbol name could not be resolved to a broker id.
    #[error("symbol not found: {0}")]
    SymbolNotFound(String),

    /// Invalid or missing configuration.
    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl Error {
    /// Build a connection error from any message.
    pub fn connection(message: impl Into<String>) -> Self {
        Self::Connection(message.into())
    }

    /// Build a protocol error from any message.
    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol(message.into())
    }

    /// Whether the reconnect loop may try again after this failure.
    ///
    /// Bad credentials and bad configuration never heal on their own.
    #[must_use]
    pub const fn is_retriable(&self) -> bool {
        !matches!(self, Self::Authentication { .. } | Self::Config(_))
    }

    /// Whether this error belongs to the connection class.
    #[must_use]
    pub const fn is_connection(&self) -> bool {
        matches!(self, Self::Connection(_) | Self::Io(_))
    }

    /// Whether this is a request timeout.
    #[must_use]
    pub const fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    /// Short label used for metrics and structured logs.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Connection(_) | Self::Io(_) => "connection",
            Self::Protocol(_) | Self::Decode { .. } => "protocol",
            Self::Timeout { .. } => "timeout",
            Self::Cancelled(_) => "cancelled",
            Self::Authentication { .. } => "authentication",
            Self::ReconnectExhausted { .. } => "reconnect_exhausted",
            Self::SymbolNotFound(_) => "symbol_not_found",
            Self::Config(_) => "config",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn authentication_is_not_retriable() {
        let err = Error::Authentication {
            message: "CH_CLIENT_AUTH_FAILURE".to_string(),
            code: Some("CH_CLIENT_AUTH_FAILURE".to_string()),
            attempts: 3,
        };
        assert!(!err.is_retriable());
        assert_eq!(err.kind(), "authentication");
    }

    #[test]
    fn transport_failures_are_retriable() {
        assert!(Error::connection("reset").is_retriable());
        assert!(Error::protocol("bad envelope").is_retriable());
        assert!(
            Error::Io(std::io::Error::from(std::io::ErrorKind::ConnectionRefused)).is_retriable()
        );
    }

    #[test]
    fn config_is_not_retriable() {
        let err = Error::from(ConfigError::MissingEnvVar("CTRADER_CLIENT_ID".to_string()));
        assert!(!err.is_retriable());
    }

    #[test]
    fn timeout_display_names_request() {
        let err = Error::Timeout {
            timeout: Duration::from_millis(250),
            type_name: "ProtoOASubscribeSpotsReq".to_string(),
        };
        assert!(err.is_timeout());
        assert_eq!(
            err.to_string(),
            "ProtoOASubscribeSpotsReq timed out after 250ms"
        );
    }

    #[test]
    fn io_is_connection_class() {
        let err = Error::from(std::io::Error::from(std::io::ErrorKind::BrokenPipe));
        assert!(err.is_connection());
        assert_eq!(err.kind(), "connection");
    }
}
