//! cTrader Client Binary
//!
//! Connects to the Open API and logs live ticks until interrupted.
//!
//! # Usage
//!
//! ```bash
//! cargo run --bin ctrader-client
//! ```
//!
//! # Environment Variables
//!
//! ## Required
//! - `CTRADER_CLIENT_ID`: Open API application client id
//! - `CTRADER_CLIENT_SECRET`: Open API application secret
//! - `CTRADER_ACCESS_TOKEN`: Account access token
//! - `CTRADER_ACCOUNT_ID`: Trading account id
//!
//! ## Optional
//! - `CTRADER_HOST_TYPE`: demo | live (default: demo)
//! - `CTRADER_SYMBOLS`: Comma separated `NAME=ID` pairs to stream (default: EURUSD=1)
//! - `CTRADER_COALESCE`: Coalesce ticks per symbol (default: true)
//! - `OTEL_ENABLED`: Enable OpenTelemetry (default: true)
//! - `RUST_LOG`: Log level (default: info)

use std::sync::Arc;
use std::time::Duration;

use ctrader_client::infrastructure::telemetry;
use ctrader_client::{Client, ClientConfig, ClientEvent, StaticSymbols, init_metrics};
use futures::StreamExt;
use tokio::signal;
use tokio_util::sync::CancellationToken;

/// Graceful shutdown timeout.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

/// Streamed when `CTRADER_SYMBOLS` is unset.
const DEFAULT_SYMBOLS: &str = "EURUSD=1";

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| "failed to install rustls crypto provider")?;

    load_dotenv();

    let _telemetry_guard = telemetry::init();
    tracing::info!("Starting cTrader client");

    let _metrics_handle = init_metrics();

    let config = ClientConfig::from_env()?;
    log_config(&config);

    let symbols = parse_symbols(
        &std::env::var("CTRADER_SYMBOLS").unwrap_or_else(|_| DEFAULT_SYMBOLS.to_string()),
    )?;
    let names: Vec<String> = symbols.iter().map(|(name, _)| name.clone()).collect();
    let coalesce = std::env::var("CTRADER_COALESCE").map_or(true, |v| v != "false");
    let catalog: StaticSymbols = symbols.iter().map(|(name, id)| (name.as_str(), *id)).collect();

    let client = Client::new(config, Arc::new(catalog));
    let shutdown_token = CancellationToken::new();

    tokio::spawn(log_events(client.clone(), shutdown_token.clone()));

    client.connect().await?;

    let refs: Vec<&str> = names.iter().map(String::as_str).collect();
    let mut ticks = client.stream_ticks_multi(&refs, coalesce).await?;

    let consumer_token = shutdown_token.clone();
    let consumer = tokio::spawn(async move {
        loop {
            tokio::select! {
                () = consumer_token.cancelled() => break,
                tick = ticks.next() => match tick {
                    Some(tick) => tracing::info!(
                        symbol = %tick.symbol,
                        bid = ?tick.bid,
                        ask = ?tick.ask,
                        spread = ?tick.spread(),
                        "Tick"
                    ),
                    None => break,
                },
            }
        }
        ticks.close().await;
    });

    tracing::info!(symbols = ?names, coalesce, "cTrader client ready");

    await_shutdown(shutdown_token).await;

    if tokio::time::timeout(SHUTDOWN_TIMEOUT, consumer).await.is_err() {
        tracing::warn!("Tick consumer did not stop in time");
    }
    client.disconnect().await;

    tracing::info!("cTrader client stopped");
    Ok(())
}

/// Log lifecycle events until shutdown.
async fn log_events(client: Client, shutdown_token: CancellationToken) {
    let mut events = client.events();
    loop {
        let event = tokio::select! {
            () = shutdown_token.cancelled() => break,
            event = events.next() => event,
        };
        match event {
            Some(Ok(event)) => match &event {
                ClientEvent::ConnectionLost { reason } => {
                    tracing::warn!(reason = %reason, "Connection lost");
                }
                ClientEvent::ReconnectFatal { error } => {
                    tracing::error!(error = %error, "Reconnect abandoned");
                }
                ClientEvent::StreamDropped { stream, reason } => {
                    tracing::error!(stream = %stream, reason = %reason, "Stream dropped");
                }
                other => tracing::debug!(event = other.name(), ?other, "Client event"),
            },
            Some(Err(e)) => tracing::warn!(error = %e, "Event observer lagged"),
            None => break,
        }
    }
}

/// Parse `NAME=ID` pairs.
fn parse_symbols(raw: &str) -> Result<Vec<(String, i64)>, String> {
    raw.split(',')
        .map(str::trim)
        .filter(|pair| !pair.is_empty())
        .map(|pair| {
            let (name, id) = pair
                .split_once('=')
                .ok_or_else(|| format!("expected NAME=ID, got {pair:?}"))?;
            let id = id
                .trim()
                .parse::<i64>()
                .map_err(|_| format!("invalid symbol id in {pair:?}"))?;
            Ok((name.trim().to_uppercase(), id))
        })
        .collect()
}

/// Load .env file from current or ancestor directories.
fn load_dotenv() {
    if dotenvy::dotenv().is_ok() {
        return;
    }

    if let Ok(cwd) = std::env::current_dir() {
        let mut dir = cwd.as_path();
        while let Some(parent) = dir.parent() {
            let env_path = parent.join(".env");
            if env_path.exists() {
                let _ = dotenvy::from_path(&env_path);
                return;
            }
            dir = parent;
        }
    }
}

/// Log the parsed configuration.
fn log_config(config: &ClientConfig) {
    tracing::info!(
        host_type = config.host_type.as_str(),
        host = config.endpoint_host(),
        port = config.port,
        transport = config.transport.as_str(),
        tls = config.use_tls,
        reconnect = config.reconnect.enabled,
        "Configuration loaded"
    );
    tracing::debug!(
        workers = config.protocol.workers,
        inbound_queue_size = config.protocol.inbound_queue_size,
        backpressure = config.protocol.backpressure.as_str(),
        "Protocol settings"
    );
}

/// Wait for shutdown signal (SIGTERM or SIGINT).
#[allow(clippy::expect_used)]
async fn await_shutdown(shutdown_token: CancellationToken) {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("signal handler installation is critical for graceful shutdown");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("SIGTERM handler installation is critical for graceful shutdown")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating shutdown");
        }
        () = terminate => {
            tracing::info!("Received SIGTERM, initiating shutdown");
        }
    }

    shutdown_token.cancel();

    tracing::info!(
        timeout_secs = SHUTDOWN_TIMEOUT.as_secs(),
        "Graceful shutdown started"
    );
}
