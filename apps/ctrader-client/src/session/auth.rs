//! Open API Authentication
//!
//! Every session authenticates twice before it can do anything useful.
//!
//! # Authentication Flow
//!
//! 1. Application: send `ProtoOAApplicationAuthReq` with the client id and
//!    secret, receive `ProtoOAApplicationAuthRes`.
//! 2. Account: send `ProtoOAAccountAuthReq` with the account id and access
//!    token, receive `ProtoOAAccountAuthRes`.
//!
//! A failure in either phase restarts the whole sequence after an
//! exponential delay (`2^attempt` backoff units). An application-phase
//! error saying the application is already authorized counts as success,
//! so re-authenticating an open session is idempotent.
//!
//! `Authenticated` and `Failed` are terminal until [`Authenticator::reset`].

use std::time::Duration;

use parking_lot::Mutex;

use crate::error::{Error, Result};
use crate::infrastructure::config::Credentials;
use crate::infrastructure::schema::error_response;
use crate::infrastructure::schema::messages::{AccountAuthReq, ApplicationAuthReq};
use crate::protocol::ProtocolHandler;

/// Broker error code for an application that is already authorized.
pub const ALREADY_LOGGED_IN: &str = "ALREADY_LOGGED_IN";

/// Default backoff unit between handshake attempts.
pub const DEFAULT_BACKOFF_UNIT: Duration = Duration::from_secs(1);

// =============================================================================
// Authentication State
// =============================================================================

/// Handshake phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AuthPhase {
    /// Not authenticated.
    #[default]
    Disconnected,
    /// Application credentials in flight.
    ApplicationAuth,
    /// Account token in flight.
    AccountAuth,
    /// Both phases succeeded.
    Authenticated,
    /// Attempts exhausted.
    Failed,
}

impl AuthPhase {
    /// Whether the phase only changes through `reset`.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Authenticated | Self::Failed)
    }

    /// Get the phase name.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::ApplicationAuth => "application_auth",
            Self::AccountAuth => "account_auth",
            Self::Authenticated => "authenticated",
            Self::Failed => "failed",
        }
    }
}

/// Snapshot of the handshake state.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AuthState {
    /// Current phase.
    pub phase: AuthPhase,
    /// Failed attempts in the current run.
    pub attempts: u32,
    /// Description of the last failure.
    pub last_error: Option<String>,
    /// Broker error code of the last failure.
    pub last_code: Option<String>,
}

struct StepFailure {
    message: String,
    code: Option<String>,
}

impl StepFailure {
    fn request(phase: &str, error: &Error) -> Self {
        Self {
            message: format!("{phase} authentication failed: {error}"),
            code: None,
        }
    }
}

/// What an error response means for the application phase.
fn classify_application_error(code: &str, description: &str) -> bool {
    code == ALREADY_LOGGED_IN || description.to_lowercase().contains("already authorized")
}

// =============================================================================
// Authenticator
// =============================================================================

/// Two-phase handshake state machine.
pub struct Authenticator {
    credentials: Credentials,
    auth_timeout: Duration,
    backoff_unit: Duration,
    state: Mutex<AuthState>,
}

impl Authenticator {
    /// Create an authenticator for `credentials`.
    #[must_use]
    pub fn new(credentials: Credentials, auth_timeout: Duration) -> Self {
        Self {
            credentials,
            auth_timeout,
            backoff_unit: DEFAULT_BACKOFF_UNIT,
            state: Mutex::new(AuthState::default()),
        }
    }

    /// Override the backoff unit.
    #[must_use]
    pub const fn with_backoff_unit(mut self, unit: Duration) -> Self {
        self.backoff_unit = unit;
        self
    }

    /// Run both phases, retrying the full sequence up to `max_attempts`.
    ///
    /// Returns immediately when already in a terminal state.
    ///
    /// # Errors
    ///
    /// Returns `Error::Authentication` carrying the attempt count and the
    /// last broker error code once attempts are exhausted.
    pub async fn authenticate(&self, protocol: &ProtocolHandler, max_attempts: u32) -> Result<()> {
        {
            let mut state = self.state.lock();
            match state.phase {
                AuthPhase::Authenticated => return Ok(()),
                AuthPhase::Failed => return Err(failure_error(&state)),
                _ => {}
            }
            *state = AuthState {
                phase: AuthPhase::ApplicationAuth,
                ..AuthState::default()
            };
        }
        let max_attempts = max_attempts.max(1);

        loop {
            self.set_phase(AuthPhase::ApplicationAuth);
            tracing::info!(
                attempt = self.attempts() + 1,
                max_attempts,
                "Authenticating application"
            );

            let outcome = match self.application_auth(protocol).await {
                Ok(()) => {
                    self.set_phase(AuthPhase::AccountAuth);
                    tracing::info!(
                        account_id = self.credentials.account_id(),
                        "Authenticating account"
                    );
                    self.account_auth(protocol).await
                }
                Err(failure) => Err(failure),
            };

            let attempts = match outcome {
                Ok(()) => {
                    let mut state = self.state.lock();
                    state.phase = AuthPhase::Authenticated;
                    state.attempts = 0;
                    drop(state);
                    tracing::info!(account_id = self.credentials.account_id(), "Authenticated");
                    return Ok(());
                }
                Err(failure) => {
                    let mut state = self.state.lock();
                    state.attempts += 1;
                    tracing::warn!(
                        attempt = state.attempts,
                        code = failure.code.as_deref(),
                        error = %failure.message,
                        "Authentication attempt failed"
                    );
                    state.last_error = Some(failure.message);
                    state.last_code = failure.code;
                    state.attempts
                }
            };

            if attempts >= max_attempts {
                break;
            }
            let delay = self
                .backoff_unit
                .saturating_mul(2u32.saturating_pow(attempts));
            tracing::info!(delay_ms = delay.as_millis(), "Retrying authentication");
            tokio::time::sleep(delay).await;
        }

        let mut state = self.state.lock();
        state.phase = AuthPhase::Failed;
        let error = failure_error(&state);
        drop(state);
        tracing::error!(error = %error, "Authentication failed");
        Err(error)
    }

    async fn application_auth(&self, protocol: &ProtocolHandler) -> std::result::Result<(), StepFailure> {
        let request = ApplicationAuthReq {
            client_id: self.credentials.client_id().to_string(),
            client_secret: self.credentials.client_secret().to_string(),
        };
        let response = protocol
            .send_request(&request, Some(self.auth_timeout), Some("ApplicationAuth"))
            .await
            .map_err(|e| StepFailure::request("application", &e))?;

        match error_response(response.as_ref()) {
            Some((code, description)) if classify_application_error(&code, &description) => {
                tracing::info!("Application already authorized, continuing");
                Ok(())
            }
            Some((code, description)) => Err(StepFailure {
                message: if description.is_empty() {
                    code.clone()
                } else {
                    description
                },
                code: Some(code),
            }),
            None => Ok(()),
        }
    }

    async fn account_auth(&self, protocol: &ProtocolHandler) -> std::result::Result<(), StepFailure> {
        let request = AccountAuthReq {
            ctid_trader_account_id: self.credentials.account_id(),
            access_token: self.credentials.access_token().to_string(),
        };
        let response = protocol
            .send_request(&request, Some(self.auth_timeout), Some("AccountAuth"))
            .await
            .map_err(|e| StepFailure::request("account", &e))?;

        match error_response(response.as_ref()) {
            Some((code, description)) => Err(StepFailure {
                message: if description.is_empty() {
                    code.clone()
                } else {
                    description
                },
                code: Some(code),
            }),
            None => Ok(()),
        }
    }

    fn set_phase(&self, phase: AuthPhase) {
        self.state.lock().phase = phase;
    }

    /// Current phase.
    #[must_use]
    pub fn phase(&self) -> AuthPhase {
        self.state.lock().phase
    }

    /// Failed attempts in the current run.
    #[must_use]
    pub fn attempts(&self) -> u32 {
        self.state.lock().attempts
    }

    /// Snapshot of the full state.
    #[must_use]
    pub fn state(&self) -> AuthState {
        self.state.lock().clone()
    }

    /// Whether both phases succeeded.
    #[must_use]
    pub fn is_authenticated(&self) -> bool {
        self.phase() == AuthPhase::Authenticated
    }

    /// Return to `Disconnected`, clearing attempts and errors.
    pub fn reset(&self) {
        *self.state.lock() = AuthState::default();
    }
}

fn failure_error(state: &AuthState) -> Error {
    Error::Authentication {
        message: state
            .last_error
            .clone()
            .unwrap_or_else(|| "unknown error".to_string()),
        code: state.last_code.clone(),
        attempts: state.attempts,
    }
}

impl std::fmt::Debug for Authenticator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("Authenticator")
            .field("credentials", &self.credentials)
            .field("phase", &state.phase)
            .field("attempts", &state.attempts)
            .finish_non_exhaustive()
    }
}
