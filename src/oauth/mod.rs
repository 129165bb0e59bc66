//! OAuth 2.0 authorization code flow with PKCE for the Notion API.
//!
//! The negotiator has two externally visible stages:
//! 1. [`OAuthNegotiator::begin`] builds the authorization URL and a fresh
//!    handshake (`state`, `code_verifier`) for the caller to keep
//! 2. [`OAuthNegotiator::complete`] parses the callback, checks `state` before
//!    any network call, exchanges the code and validates the returned token
//!
//! The negotiator persists nothing. The caller owns the handshake and must
//! discard it after a terminal outcome ([`OAuthError::is_transient`] is false),
//! so a replayed callback cannot be exchanged twice. [`HandshakeStore`] is the
//! single-use parking spot the HTTP layer uses for that.

mod exchange;
pub mod handshake;
mod pkce;
mod provider;

pub use handshake::{run_handshake_cleanup, HandshakeStore};
pub use pkce::{code_challenge, generate_code_verifier, generate_state, OAuthHandshakeState};
pub use provider::{
    OAuthProviderConfig, NOTION_AUTHORIZATION_URL, NOTION_TOKEN_URL, REQUIRED_SCOPES,
};

use chrono::{DateTime, Utc};
use exchange::Grant;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;

/// Shortest access token accepted as plausible
const MIN_TOKEN_LENGTH: usize = 10;

/// Values some providers and proxies put in place of a real token
const SENTINEL_TOKENS: [&str; 4] = ["null", "undefined", "invalid", "expired"];

/// OAuth flow failures.
///
/// Everything except [`OAuthError::Timeout`] and [`OAuthError::Transport`] is
/// terminal: the handshake that produced it must not be retried.
#[derive(Debug, Error)]
pub enum OAuthError {
    #[error("OAuth provider error: {0}")]
    Provider(String),

    #[error("missing code")]
    MissingCode,

    #[error("missing state")]
    MissingState,

    #[error("malformed callback: {0}")]
    MalformedCallback(String),

    #[error("state mismatch")]
    StateMismatch,

    #[error("timeout")]
    Timeout,

    #[error("token request failed: {0}")]
    Transport(String),

    #[error("token endpoint returned {status}: {body}")]
    Http { status: u16, body: String },

    #[error("invalid token response: {0}")]
    InvalidResponse(String),

    #[error("missing field: {0}")]
    MissingField(&'static str),

    #[error("invalid access token")]
    InvalidToken,

    #[error("insufficient scope: missing {}", .0.join(", "))]
    InsufficientScope(Vec<String>),
}

impl OAuthError {
    /// True for network failures worth retrying with the same handshake.
    pub fn is_transient(&self) -> bool {
        matches!(self, OAuthError::Timeout | OAuthError::Transport(_))
    }
}

/// Validated result of a code-for-token exchange or a refresh.
#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenData {
    pub access_token: String,
    pub token_type: String,
    pub workspace_id: String,
    #[serde(default)]
    pub workspace_name: Option<String>,
    #[serde(default)]
    pub workspace_icon: Option<String>,
    #[serde(default)]
    pub bot_id: Option<String>,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub expires_in: Option<i64>,
    /// Absolute expiry computed from `expires_in` at exchange time
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
    /// Space-separated granted scopes
    #[serde(default)]
    pub scope: Option<String>,
    #[serde(default)]
    pub owner: Option<Value>,
}

impl TokenData {
    /// True once `expires_at` has passed. Tokens without an expiry never expire.
    pub fn is_expired(&self) -> bool {
        self.expires_at
            .map(|expires_at| Utc::now() > expires_at)
            .unwrap_or(false)
    }

    pub fn granted_scopes(&self) -> Vec<&str> {
        self.scope
            .as_deref()
            .map(|scope| scope.split_whitespace().collect())
            .unwrap_or_default()
    }
}

impl fmt::Debug for TokenData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenData")
            .field("token_type", &self.token_type)
            .field("workspace_id", &self.workspace_id)
            .field("workspace_name", &self.workspace_name)
            .field("has_refresh_token", &self.refresh_token.is_some())
            .field("expires_at", &self.expires_at)
            .field("scope", &self.scope)
            .finish_non_exhaustive()
    }
}

/// Result of [`OAuthNegotiator::begin`]
#[derive(Debug, Clone)]
pub struct AuthorizationRequest {
    pub authorization_url: String,
    pub handshake: OAuthHandshakeState,
}

/// Raw callback query parameters
#[derive(Deserialize, Default)]
struct CallbackQuery {
    code: Option<String>,
    state: Option<String>,
    error: Option<String>,
    error_description: Option<String>,
}

/// Callback parameters once the provider error and presence checks pass
#[derive(Debug, Clone, PartialEq)]
pub struct AuthorizationCallback {
    pub code: String,
    pub state: String,
}

/// Parse an OAuth callback.
///
/// Accepts a bare query string (`code=..&state=..`) or a full `scheme://` callback URL.
/// A provider `error` is surfaced first (preferring `error_description`), then
/// missing `code`, then missing `state`.
pub fn parse_callback(callback: &str) -> Result<AuthorizationCallback, OAuthError> {
    // A bare query may itself contain '?', so only a URL has a prefix to strip
    let query = match callback.split_once('?') {
        Some((_, query)) if has_url_scheme(callback) => {
            query.split_once('#').map(|(query, _)| query).unwrap_or(query)
        }
        _ => callback,
    };

    let params: CallbackQuery = serde_urlencoded::from_str(query)
        .map_err(|e| OAuthError::MalformedCallback(e.to_string()))?;

    if let Some(error) = params.error {
        let message = params
            .error_description
            .filter(|d| !d.is_empty())
            .unwrap_or(error);
        return Err(OAuthError::Provider(message));
    }

    let code = params
        .code
        .filter(|c| !c.is_empty())
        .ok_or(OAuthError::MissingCode)?;
    let state = params
        .state
        .filter(|s| !s.is_empty())
        .ok_or(OAuthError::MissingState)?;

    Ok(AuthorizationCallback { code, state })
}

fn has_url_scheme(input: &str) -> bool {
    input
        .split_once("://")
        .map(|(scheme, _)| {
            !scheme.is_empty()
                && scheme
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '-' | '.'))
        })
        .unwrap_or(false)
}

/// Check token shape: long enough and not a sentinel value.
pub fn validate_token(token: &str) -> bool {
    let token = token.trim();
    if token.len() < MIN_TOKEN_LENGTH {
        return false;
    }

    let lowered = token.to_ascii_lowercase();
    !SENTINEL_TOKENS.contains(&lowered.as_str())
}

/// Check that `granted` (space-separated) covers every required scope.
///
/// A response without a `scope` field grants nothing.
pub fn validate_scopes(granted: Option<&str>, required: &[String]) -> Result<(), OAuthError> {
    let granted: Vec<&str> = granted
        .map(|scope| scope.split_whitespace().collect())
        .unwrap_or_default();

    let missing: Vec<String> = required
        .iter()
        .filter(|scope| !granted.contains(&scope.as_str()))
        .cloned()
        .collect();

    if missing.is_empty() {
        Ok(())
    } else {
        Err(OAuthError::InsufficientScope(missing))
    }
}

/// Drives the authorization code + PKCE flow against one provider.
pub struct OAuthNegotiator {
    config: OAuthProviderConfig,
    client: reqwest::Client,
    timeout: Duration,
}

impl OAuthNegotiator {
    pub fn new(config: OAuthProviderConfig) -> Self {
        Self {
            config,
            client: reqwest::Client::new(),
            timeout: Duration::from_secs(DEFAULT_REQUEST_TIMEOUT_SECS),
        }
    }

    /// Bound every token endpoint call by `timeout`.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn config(&self) -> &OAuthProviderConfig {
        &self.config
    }

    /// Start a flow: fresh state and verifier, S256 challenge embedded in the URL.
    pub fn begin(&self) -> AuthorizationRequest {
        let handshake = OAuthHandshakeState::generate();
        let authorization_url = self
            .config
            .build_auth_url(&handshake.state, &handshake.code_challenge);

        debug!(client_id = %self.config.client_id, "Built OAuth authorization URL");

        AuthorizationRequest {
            authorization_url,
            handshake,
        }
    }

    /// Finish a flow from the provider callback.
    ///
    /// # Arguments
    /// * `callback` - Callback query string or full URL, forwarded verbatim
    /// * `expected_state` - `state` from the handshake returned by `begin()`
    /// * `code_verifier` - Verifier from the same handshake
    ///
    /// # Security
    /// - `state` is compared in constant time before any network call (CSRF)
    /// - The token must look real and carry every required scope
    pub async fn complete(
        &self,
        callback: &str,
        expected_state: &str,
        code_verifier: &str,
    ) -> Result<TokenData, OAuthError> {
        let callback = parse_callback(callback)?;

        if !pkce::states_match(&callback.state, expected_state) {
            warn!("OAuth callback state mismatch (possible CSRF)");
            return Err(OAuthError::StateMismatch);
        }

        let token = exchange::request_token(
            &self.client,
            &self.config,
            Grant::AuthorizationCode {
                code: &callback.code,
                code_verifier,
            },
            self.timeout,
        )
        .await?;

        if !validate_token(&token.access_token) {
            warn!(workspace_id = %token.workspace_id, "Provider returned an unusable access token");
            return Err(OAuthError::InvalidToken);
        }
        validate_scopes(token.scope.as_deref(), &self.config.scopes)?;

        info!(
            workspace_id = %token.workspace_id,
            has_refresh_token = token.refresh_token.is_some(),
            "OAuth code exchange complete"
        );

        Ok(token)
    }

    /// Exchange a refresh token for a new access token.
    ///
    /// When the provider does not rotate the refresh token, the one presented
    /// is carried over into the result.
    pub async fn refresh(&self, refresh_token: &str) -> Result<TokenData, OAuthError> {
        let mut token = exchange::request_token(
            &self.client,
            &self.config,
            Grant::RefreshToken { refresh_token },
            self.timeout,
        )
        .await?;

        if token.refresh_token.is_none() {
            token.refresh_token = Some(refresh_token.to_string());
        }

        info!(workspace_id = %token.workspace_id, "OAuth token refreshed");

        Ok(token)
    }
}

impl fmt::Debug for OAuthNegotiator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OAuthNegotiator")
            .field("config", &self.config)
            .field("timeout", &self.timeout)
            .finish()
    }
}
