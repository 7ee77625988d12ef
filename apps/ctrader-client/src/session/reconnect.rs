//! Reconnection Policy
//!
//! Exponential backoff with jitter, and a manager that wraps an arbitrary
//! connect callback with it. The first attempt runs immediately; each
//! failure waits `base_delay * multiplier^n` (capped) before the next one.

use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;

use rand::Rng;

use crate::error::{Error, Result};
use crate::infrastructure::config::ReconnectSettings;
use crate::infrastructure::events::{ClientEvent, EventBus};
use crate::infrastructure::metrics;

/// Configuration for reconnection behavior.
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    /// Delay before the second attempt.
    pub initial_delay: Duration,
    /// Maximum delay between reconnection attempts.
    pub max_delay: Duration,
    /// Multiplier for exponential backoff (e.g., 2.0 doubles delay each attempt).
    pub multiplier: f64,
    /// Jitter factor as a fraction (e.g., 0.1 = ±10% randomization).
    pub jitter_factor: f64,
    /// Maximum number of connect attempts (0 = unlimited).
    pub max_attempts: u32,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(300),
            multiplier: 2.0,
            jitter_factor: 0.1,
            max_attempts: 10,
        }
    }
}

impl ReconnectConfig {
    /// Create configuration from `ReconnectSettings`.
    #[must_use]
    pub const fn from_settings(settings: &ReconnectSettings) -> Self {
        Self {
            initial_delay: settings.base_delay,
            max_delay: settings.max_delay,
            multiplier: settings.multiplier,
            jitter_factor: settings.jitter_factor,
            max_attempts: settings.max_attempts,
        }
    }
}

/// Backoff schedule: exponential growth, capped, with symmetric jitter.
#[derive(Debug)]
pub struct ReconnectPolicy {
    config: ReconnectConfig,
    current_delay: Duration,
    attempt_count: u32,
}

impl ReconnectPolicy {
    /// Create a new reconnection policy.
    #[must_use]
    pub const fn new(config: ReconnectConfig) -> Self {
        let initial_delay = config.initial_delay;
        Self {
            config,
            current_delay: initial_delay,
            attempt_count: 0,
        }
    }

    /// Delay before the next retry, or `None` once `max_attempts` retries
    /// were handed out.
    #[must_use]
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.config.max_attempts > 0 && self.attempt_count >= self.config.max_attempts {
            return None;
        }
        self.attempt_count += 1;

        let delay = self.apply_jitter(self.current_delay.min(self.config.max_delay));

        #[allow(clippy::cast_precision_loss)]
        let scaled = (self.current_delay.as_millis() as f64 * self.config.multiplier).round();
        let next_millis = if scaled.is_finite() && scaled > 0.0 {
            #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
            {
                scaled as u128
            }
        } else {
            0
        };
        let capped = next_millis.min(self.config.max_delay.as_millis());
        self.current_delay = Duration::from_millis(u64::try_from(capped).unwrap_or(u64::MAX));

        Some(delay)
    }

    /// Reset the policy after a successful connection.
    pub const fn reset(&mut self) {
        self.current_delay = self.config.initial_delay;
        self.attempt_count = 0;
    }

    /// Delays handed out so far.
    #[must_use]
    pub const fn attempt_count(&self) -> u32 {
        self.attempt_count
    }

    fn apply_jitter(&self, duration: Duration) -> Duration {
        if self.config.jitter_factor <= 0.0 {
            return duration;
        }

        #[allow(clippy::cast_precision_loss)]
        let base_millis = duration.as_millis() as f64;
        let jitter_range = base_millis * self.config.jitter_factor;
        let jitter: f64 = rand::rng().random_range(-jitter_range..=jitter_range);
        let adjusted_millis = (base_millis + jitter).max(0.0);

        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let adjusted_u64 = adjusted_millis as u64;
        Duration::from_millis(adjusted_u64)
    }
}

// =============================================================================
// Reconnect Manager
// =============================================================================

/// Runs a connect callback until it succeeds, gives up, or hits an error
/// the caller's predicate refuses to retry.
#[derive(Debug)]
pub struct ReconnectManager {
    config: ReconnectConfig,
    events: EventBus,
    reconnecting: AtomicBool,
    last_attempts: AtomicU32,
}

impl ReconnectManager {
    /// Create a manager publishing attempts on `events`.
    #[must_use]
    pub const fn new(config: ReconnectConfig, events: EventBus) -> Self {
        Self {
            config,
            events,
            reconnecting: AtomicBool::new(false),
            last_attempts: AtomicU32::new(0),
        }
    }

    /// Call `connect_fn` until it succeeds.
    ///
    /// A failure for which `should_retry` returns `false` is returned as is.
    /// Each attempt emits `reconnect.attempt` with the delay waited before
    /// it.
    ///
    /// # Errors
    ///
    /// Returns the non-retriable error, or `Error::ReconnectExhausted`
    /// wrapping the last failure once `max_attempts` calls have failed.
    pub async fn connect_with_retry<T, F, Fut, P>(&self, mut connect_fn: F, should_retry: P) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
        P: Fn(&Error) -> bool,
    {
        self.reconnecting.store(true, Ordering::Release);
        let _reconnecting = ReconnectingGuard(&self.reconnecting);
        self.run(&mut connect_fn, &should_retry).await
    }

    async fn run<T, F, Fut, P>(&self, connect_fn: &mut F, should_retry: &P) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
        P: Fn(&Error) -> bool,
    {
        let mut policy = ReconnectPolicy::new(ReconnectConfig {
            max_attempts: 0,
            ..self.config.clone()
        });
        let mut attempt: u32 = 0;
        let mut delay = Duration::ZERO;

        loop {
            attempt += 1;
            self.last_attempts.store(attempt, Ordering::Release);
            self.events.emit(ClientEvent::ReconnectAttempt { attempt, delay });
            tracing::info!(attempt, delay_ms = delay.as_millis(), "Connect attempt");

            match connect_fn().await {
                Ok(value) => {
                    metrics::record_reconnect(true);
                    return Ok(value);
                }
                Err(e) if !should_retry(&e) => {
                    metrics::record_reconnect(false);
                    tracing::error!(attempt, error = %e, "Connect failed with non-retriable error");
                    return Err(e);
                }
                Err(e) => {
                    metrics::record_reconnect(false);
                    if self.config.max_attempts > 0 && attempt >= self.config.max_attempts {
                        tracing::error!(attempt, error = %e, "Reconnect attempts exhausted");
                        return Err(Error::ReconnectExhausted {
                            attempts: attempt,
                            last: Box::new(e),
                        });
                    }
                    delay = policy.next_delay().unwrap_or(self.config.max_delay);
                    tracing::warn!(
                        attempt,
                        error = %e,
                        next_delay_ms = delay.as_millis(),
                        "Connect attempt failed"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    /// Whether a retry loop is running.
    #[must_use]
    pub fn is_reconnecting(&self) -> bool {
        self.reconnecting.load(Ordering::Acquire)
    }

    /// Attempts made by the most recent retry loop.
    #[must_use]
    pub fn attempts(&self) -> u32 {
        self.last_attempts.load(Ordering::Acquire)
    }

    /// The configuration in use.
    #[must_use]
    pub const fn config(&self) -> &ReconnectConfig {
        &self.config
    }
}

/// Clears the reconnecting flag however the retry loop ends, including
/// when its future is dropped.
struct ReconnectingGuard<'a>(&'a AtomicBool);

impl Drop for ReconnectingGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}
