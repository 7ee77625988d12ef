//! Client Configuration Settings
//!
//! Configuration types for the protocol engine, loaded from `CTRADER_*`
//! environment variables. Every optional variable falls back to its default
//! when missing or unparseable.

use std::time::Duration;

/// Default Open API port (TLS).
pub const DEFAULT_PORT: u16 = 5035;

/// Default maximum inbound frame size (10 MiB).
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 10 * 1024 * 1024;

/// Broker environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HostType {
    /// Demo accounts.
    #[default]
    Demo,
    /// Live accounts (real money).
    Live,
}

impl HostType {
    /// Parse host type from string.
    #[must_use]
    pub fn from_str_case_insensitive(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "live" => Self::Live,
            _ => Self::Demo,
        }
    }

    /// Default hostname for this environment.
    #[must_use]
    pub const fn host(&self) -> &'static str {
        match self {
            Self::Demo => "demo.ctraderapi.com",
            Self::Live => "live.ctraderapi.com",
        }
    }

    /// Get the environment name.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Demo => "demo",
            Self::Live => "live",
        }
    }
}

/// Which transport carries the framed envelopes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TransportKind {
    /// Raw stream socket, optionally wrapped in TLS.
    #[default]
    Tcp,
    /// Binary WebSocket tunnel.
    WebSocket,
}

impl TransportKind {
    /// Parse transport kind from string.
    #[must_use]
    pub fn from_str_case_insensitive(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "websocket" | "ws" => Self::WebSocket,
            _ => Self::Tcp,
        }
    }

    /// Get the transport name.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Tcp => "tcp",
            Self::WebSocket => "websocket",
        }
    }
}

/// What the reader does when the inbound queue is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BackpressurePolicy {
    /// Suspend the reader until a worker frees a slot.
    Block,
    /// Evict the oldest queued frame to admit the newest.
    #[default]
    DropOldest,
}

impl BackpressurePolicy {
    /// Parse policy from string.
    #[must_use]
    pub fn from_str_case_insensitive(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "block" => Self::Block,
            _ => Self::DropOldest,
        }
    }

    /// Get the policy name.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Block => "block",
            Self::DropOldest => "drop_oldest",
        }
    }
}

/// Open API application and account credentials.
#[derive(Clone, Default)]
pub struct Credentials {
    client_id: String,
    client_secret: String,
    access_token: String,
    account_id: i64,
}

impl Credentials {
    /// Create new credentials.
    #[must_use]
    pub const fn new(
        client_id: String,
        client_secret: String,
        access_token: String,
        account_id: i64,
    ) -> Self {
        Self {
            client_id,
            client_secret,
            access_token,
            account_id,
        }
    }

    /// Application client id.
    #[must_use]
    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// Application client secret.
    #[must_use]
    pub fn client_secret(&self) -> &str {
        &self.client_secret
    }

    /// Account access token.
    #[must_use]
    pub fn access_token(&self) -> &str {
        &self.access_token
    }

    /// Trading account id (`ctidTraderAccountId`).
    #[must_use]
    pub const fn account_id(&self) -> i64 {
        self.account_id
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("client_id", &"[REDACTED]")
            .field("client_secret", &"[REDACTED]")
            .field("access_token", &"[REDACTED]")
            .field("account_id", &self.account_id)
            .finish()
    }
}

/// Settings for one protocol handler.
#[derive(Debug, Clone)]
pub struct ProtocolSettings {
    /// Largest accepted inbound frame in bytes.
    pub max_message_size: usize,
    /// Capacity of the inbound frame queue.
    pub inbound_queue_size: usize,
    /// Number of workers draining the inbound queue.
    pub workers: usize,
    /// Reader behavior on a full inbound queue.
    pub backpressure: BackpressurePolicy,
    /// Default deadline for `send_request`.
    pub request_timeout: Duration,
}

impl Default for ProtocolSettings {
    fn default() -> Self {
        Self {
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            inbound_queue_size: 1000,
            workers: 1,
            backpressure: BackpressurePolicy::DropOldest,
            request_timeout: Duration::from_secs(30),
        }
    }
}

/// Reconnection settings.
#[derive(Debug, Clone)]
pub struct ReconnectSettings {
    /// Whether a lost connection is re-established automatically.
    pub enabled: bool,
    /// Maximum connect attempts per outage (0 = unlimited).
    pub max_attempts: u32,
    /// Delay before the second attempt.
    pub base_delay: Duration,
    /// Upper bound on any single delay.
    pub max_delay: Duration,
    /// Growth factor between consecutive delays.
    pub multiplier: f64,
    /// Symmetric jitter as a fraction of the delay (0.0 disables jitter).
    pub jitter_factor: f64,
}

impl Default for ReconnectSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            max_attempts: 10,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(300),
            multiplier: 2.0,
            jitter_factor: 0.1,
        }
    }
}

/// Streaming subscription settings.
#[derive(Debug, Clone)]
pub struct StreamSettings {
    /// Queue capacity of tick, candle and multi-tick streams.
    pub queue_size: usize,
    /// Queue capacity of depth streams.
    pub depth_queue_size: usize,
    /// Flush period of coalescing multi-tick streams.
    pub flush_interval: Duration,
}

impl Default for StreamSettings {
    fn default() -> Self {
        Self {
            queue_size: 100,
            depth_queue_size: 100,
            flush_interval: Duration::from_millis(50),
        }
    }
}

/// Complete client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Application and account credentials.
    pub credentials: Credentials,
    /// Demo or live environment.
    pub host_type: HostType,
    /// Explicit hostname overriding the environment default.
    pub host: Option<String>,
    /// Server port.
    pub port: u16,
    /// Wrap the connection in TLS.
    pub use_tls: bool,
    /// Transport implementation.
    pub transport: TransportKind,
    /// Deadline for establishing the socket.
    pub connection_timeout: Duration,
    /// Deadline for each handshake request.
    pub auth_timeout: Duration,
    /// Handshake attempts before giving up.
    pub auth_max_attempts: u32,
    /// Period between outbound heartbeats.
    pub heartbeat_interval: Duration,
    /// Inbound silence after which the connection is considered dead.
    pub heartbeat_timeout: Duration,
    /// Protocol handler settings.
    pub protocol: ProtocolSettings,
    /// Reconnection settings.
    pub reconnect: ReconnectSettings,
    /// Streaming settings.
    pub streams: StreamSettings,
    /// Capacity of the lifecycle event channel.
    pub event_capacity: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            credentials: Credentials::default(),
            host_type: HostType::Demo,
            host: None,
            port: DEFAULT_PORT,
            use_tls: true,
            transport: TransportKind::Tcp,
            connection_timeout: Duration::from_secs(30),
            auth_timeout: Duration::from_secs(60),
            auth_max_attempts: 3,
            heartbeat_interval: Duration::from_secs(10),
            heartbeat_timeout: Duration::from_secs(45),
            protocol: ProtocolSettings::default(),
            reconnect: ReconnectSettings::default(),
            streams: StreamSettings::default(),
            event_capacity: 1024,
        }
    }
}

impl ClientConfig {
    /// Create configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns an error if required environment variables are missing,
    /// empty, or if the account id is not an integer.
    pub fn from_env() -> Result<Self, ConfigError> {
        let client_id = required_env("CTRADER_CLIENT_ID")?;
        let client_secret = required_env("CTRADER_CLIENT_SECRET")?;
        let access_token = required_env("CTRADER_ACCESS_TOKEN")?;
        let account_raw = required_env("CTRADER_ACCOUNT_ID")?;
        let account_id = account_raw
            .parse::<i64>()
            .map_err(|_| ConfigError::InvalidValue {
                key: "CTRADER_ACCOUNT_ID".to_string(),
                value: account_raw.clone(),
            })?;

        let defaults = Self::default();

        let host_type = std::env::var("CTRADER_HOST_TYPE")
            .map(|s| HostType::from_str_case_insensitive(&s))
            .unwrap_or_default();

        let host = std::env::var("CTRADER_HOST").ok().filter(|h| !h.is_empty());

        let transport = std::env::var("CTRADER_TRANSPORT")
            .map(|s| TransportKind::from_str_case_insensitive(&s))
            .unwrap_or_default();

        let protocol = ProtocolSettings {
            max_message_size: parse_env_usize(
                "CTRADER_MAX_MESSAGE_SIZE",
                defaults.protocol.max_message_size,
            ),
            inbound_queue_size: parse_env_usize(
                "CTRADER_INBOUND_QUEUE_SIZE",
                defaults.protocol.inbound_queue_size,
            ),
            workers: parse_env_usize("CTRADER_WORKERS", defaults.protocol.workers),
            backpressure: std::env::var("CTRADER_BACKPRESSURE")
                .map(|s| BackpressurePolicy::from_str_case_insensitive(&s))
                .unwrap_or(defaults.protocol.backpressure),
            request_timeout: parse_env_duration_secs(
                "CTRADER_REQUEST_TIMEOUT_SECS",
                defaults.protocol.request_timeout,
            ),
        };

        let reconnect = ReconnectSettings {
            enabled: parse_env_bool("CTRADER_RECONNECT_ENABLED", defaults.reconnect.enabled),
            max_attempts: parse_env_u32(
                "CTRADER_RECONNECT_MAX_ATTEMPTS",
                defaults.reconnect.max_attempts,
            ),
            base_delay: parse_env_duration_millis(
                "CTRADER_RECONNECT_BASE_DELAY_MS",
                defaults.reconnect.base_delay,
            ),
            max_delay: parse_env_duration_secs(
                "CTRADER_RECONNECT_MAX_DELAY_SECS",
                defaults.reconnect.max_delay,
            ),
            multiplier: parse_env_f64(
                "CTRADER_RECONNECT_MULTIPLIER",
                defaults.reconnect.multiplier,
            ),
            jitter_factor: parse_env_f64(
                "CTRADER_RECONNECT_JITTER",
                defaults.reconnect.jitter_factor,
            ),
        };

        let streams = StreamSettings {
            queue_size: parse_env_usize("CTRADER_STREAM_QUEUE_SIZE", defaults.streams.queue_size),
            depth_queue_size: parse_env_usize(
                "CTRADER_DEPTH_QUEUE_SIZE",
                defaults.streams.depth_queue_size,
            ),
            flush_interval: parse_env_duration_millis(
                "CTRADER_STREAM_FLUSH_INTERVAL_MS",
                defaults.streams.flush_interval,
            ),
        };

        let config = Self {
            credentials: Credentials::new(client_id, client_secret, access_token, account_id),
            host_type,
            host,
            port: parse_env_u16("CTRADER_PORT", defaults.port),
            use_tls: parse_env_bool("CTRADER_USE_TLS", defaults.use_tls),
            transport,
            connection_timeout: parse_env_duration_secs(
                "CTRADER_CONNECTION_TIMEOUT_SECS",
                defaults.connection_timeout,
            ),
            auth_timeout: parse_env_duration_secs(
                "CTRADER_AUTH_TIMEOUT_SECS",
                defaults.auth_timeout,
            ),
            auth_max_attempts: parse_env_u32(
                "CTRADER_AUTH_MAX_ATTEMPTS",
                defaults.auth_max_attempts,
            ),
            heartbeat_interval: parse_env_duration_secs(
                "CTRADER_HEARTBEAT_INTERVAL_SECS",
                defaults.heartbeat_interval,
            ),
            heartbeat_timeout: parse_env_duration_secs(
                "CTRADER_HEARTBEAT_TIMEOUT_SECS",
                defaults.heartbeat_timeout,
            ),
            protocol,
            reconnect,
            streams,
            event_capacity: parse_env_usize("CTRADER_EVENT_CAPACITY", defaults.event_capacity),
        };

        config.validate()?;
        Ok(config)
    }

    /// Hostname to connect to.
    #[must_use]
    pub fn endpoint_host(&self) -> &str {
        self.host.as_deref().unwrap_or_else(|| self.host_type.host())
    }

    /// Check that the configuration can drive a session.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::Invalid` listing every offending field.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut problems = Vec::new();

        if self.credentials.client_id().is_empty() {
            problems.push("client_id is empty");
        }
        if self.credentials.client_secret().is_empty() {
            problems.push("client_secret is empty");
        }
        if self.credentials.access_token().is_empty() {
            problems.push("access_token is empty");
        }
        if self.credentials.account_id() <= 0 {
            problems.push("account_id must be positive");
        }
        if self.port == 0 {
            problems.push("port must be non-zero");
        }
        if self.protocol.max_message_size == 0 {
            problems.push("max_message_size must be non-zero");
        }
        if self.protocol.inbound_queue_size == 0 {
            problems.push("inbound_queue_size must be non-zero");
        }
        if self.protocol.workers == 0 {
            problems.push("workers must be non-zero");
        }
        if self.streams.queue_size == 0 || self.streams.depth_queue_size == 0 {
            problems.push("stream queue sizes must be non-zero");
        }
        if self.reconnect.multiplier < 1.0 {
            problems.push("reconnect multiplier must be at least 1.0");
        }
        if !(0.0..=1.0).contains(&self.reconnect.jitter_factor) {
            problems.push("reconnect jitter must be within 0.0..=1.0");
        }
        if self.auth_max_attempts == 0 {
            problems.push("auth_max_attempts must be non-zero");
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Invalid(problems.join(", ")))
        }
    }
}

/// Configuration error.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Required environment variable is missing.
    #[error("missing required environment variable: {0}")]
    MissingEnvVar(String),
    /// Environment variable has empty value.
    #[error("environment variable {0} cannot be empty")]
    EmptyValue(String),
    /// Environment variable could not be parsed.
    #[error("environment variable {key} has invalid value {value:?}")]
    InvalidValue {
        /// Variable name.
        key: String,
        /// Raw value.
        value: String,
    },
    /// Configuration failed validation.
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

fn required_env(key: &str) -> Result<String, ConfigError> {
    let value = std::env::var(key).map_err(|_| ConfigError::MissingEnvVar(key.to_string()))?;
    if value.is_empty() {
        return Err(ConfigError::EmptyValue(key.to_string()));
    }
    Ok(value)
}

fn parse_env_u16(key: &str, default: u16) -> u16 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn parse_env_u32(key: &str, default: u32) -> u32 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn parse_env_usize(key: &str, default: usize) -> usize {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn parse_env_f64(key: &str, default: f64) -> f64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn parse_env_bool(key: &str, default: bool) -> bool {
    std::env::var(key)
        .ok()
        .and_then(|v| match v.to_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Some(true),
            "0" | "false" | "no" | "off" => Some(false),
            _ => None,
        })
        .unwrap_or(default)
}

fn parse_env_duration_secs(key: &str, default: Duration) -> Duration {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .map_or(default, Duration::from_secs)
}

fn parse_env_duration_millis(key: &str, default: Duration) -> Duration {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .map_or(default, Duration::from_millis)
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    fn valid_config() -> ClientConfig {
        ClientConfig {
            credentials: Credentials::new(
                "client".to_string(),
                "secret".to_string(),
                "token".to_string(),
                42,
            ),
            ..ClientConfig::default()
        }
    }

    #[test_case("live", HostType::Live ; "lowercase live")]
    #[test_case("LIVE", HostType::Live ; "uppercase live")]
    #[test_case("demo", HostType::Demo ; "demo")]
    #[test_case("unknown", HostType::Demo ; "unknown falls back to demo")]
    fn host_type_parsing(input: &str, expected: HostType) {
        assert_eq!(HostType::from_str_case_insensitive(input), expected);
    }

    #[test_case("websocket", TransportKind::WebSocket ; "websocket")]
    #[test_case("WS", TransportKind::WebSocket ; "ws shorthand")]
    #[test_case("tcp", TransportKind::Tcp ; "tcp")]
    #[test_case("", TransportKind::Tcp ; "empty falls back to tcp")]
    fn transport_kind_parsing(input: &str, expected: TransportKind) {
        assert_eq!(TransportKind::from_str_case_insensitive(input), expected);
    }

    #[test]
    fn backpressure_parsing() {
        assert_eq!(
            BackpressurePolicy::from_str_case_insensitive("BLOCK"),
            BackpressurePolicy::Block
        );
        assert_eq!(
            BackpressurePolicy::from_str_case_insensitive("drop_oldest"),
            BackpressurePolicy::DropOldest
        );
    }

    #[test]
    fn host_type_endpoints() {
        assert_eq!(HostType::Demo.host(), "demo.ctraderapi.com");
        assert_eq!(HostType::Live.host(), "live.ctraderapi.com");
    }

    #[test]
    fn endpoint_host_prefers_override() {
        let mut config = valid_config();
        assert_eq!(config.endpoint_host(), "demo.ctraderapi.com");
        config.host = Some("127.0.0.1".to_string());
        assert_eq!(config.endpoint_host(), "127.0.0.1");
    }

    #[test]
    fn default_settings() {
        let config = ClientConfig::default();
        assert_eq!(config.port, 5035);
        assert!(config.use_tls);
        assert_eq!(config.protocol.max_message_size, 10 * 1024 * 1024);
        assert_eq!(config.protocol.inbound_queue_size, 1000);
        assert_eq!(config.protocol.workers, 1);
        assert_eq!(config.protocol.request_timeout, Duration::from_secs(30));
        assert_eq!(config.reconnect.max_attempts, 10);
        assert_eq!(config.reconnect.max_delay, Duration::from_secs(300));
        assert_eq!(config.streams.queue_size, 100);
    }

    #[test]
    fn validate_accepts_complete_config() {
        assert!(valid_config().validate().is_ok());
    }

    #[test]
    fn validate_lists_every_problem() {
        let mut config = ClientConfig::default();
        config.protocol.workers = 0;
        let err = config.validate().unwrap_err();
        let message = err.to_string();
        assert!(message.contains("client_id is empty"));
        assert!(message.contains("access_token is empty"));
        assert!(message.contains("account_id must be positive"));
        assert!(message.contains("workers must be non-zero"));
    }

    #[test]
    fn credentials_debug_redacts_secrets() {
        let credentials = Credentials::new(
            "my-client".to_string(),
            "my-secret".to_string(),
            "my-token".to_string(),
            7,
        );
        let debug = format!("{credentials:?}");
        assert!(debug.contains("[REDACTED]"));
        assert!(!debug.contains("my-secret"));
        assert!(!debug.contains("my-token"));
        assert!(debug.contains('7'));
    }
}
