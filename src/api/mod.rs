//! HTTP API over the session core.
//!
//! Every session-scoped route reads the session id from the `X-Session-ID`
//! header. Unknown or expired ids are reported as 404 and are never re-created
//! implicitly; clients start over with `POST /api/session`.

mod oauth;
mod session;
mod session_header;

pub use session_header::{extract_session_id, SessionHeaderError, SESSION_HEADER};

use crate::cipher::CryptoError;
use crate::oauth::{HandshakeStore, OAuthError, OAuthNegotiator};
use crate::session::{SessionError, SessionStats, SessionStore};
use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use serde::Serialize;
use std::sync::Arc;
use tracing::error;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub sessions: Arc<SessionStore>,
    /// None when no OAuth client is configured
    pub oauth: Option<Arc<OAuthNegotiator>>,
    pub handshakes: HandshakeStore,
}

/// Error response
#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

/// Application error types
#[derive(Debug)]
pub enum AppError {
    BadRequest(String),
    Unauthorized(String),
    NotFound(String),
    ServerError(String),
    BadGateway(String),
    GatewayTimeout(String),
    ServiceUnavailable(String),
}

impl AppError {
    fn session_not_found() -> Self {
        AppError::NotFound("Session not found or expired".to_string())
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error_message) = match self {
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            AppError::Unauthorized(msg) => (StatusCode::UNAUTHORIZED, msg),
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            AppError::ServerError(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
            AppError::BadGateway(msg) => (StatusCode::BAD_GATEWAY, msg),
            AppError::GatewayTimeout(msg) => (StatusCode::GATEWAY_TIMEOUT, msg),
            AppError::ServiceUnavailable(msg) => (StatusCode::SERVICE_UNAVAILABLE, msg),
        };

        let body = Json(ErrorResponse {
            error: error_message,
        });

        (status, body).into_response()
    }
}

impl From<SessionHeaderError> for AppError {
    fn from(e: SessionHeaderError) -> Self {
        AppError::Unauthorized(e.to_string())
    }
}

impl From<CryptoError> for AppError {
    fn from(e: CryptoError) -> Self {
        error!(error = %e, "Encryption failure while handling request");
        AppError::ServerError("Encryption failure".to_string())
    }
}

impl From<SessionError> for AppError {
    fn from(e: SessionError) -> Self {
        match e {
            SessionError::NotFound => AppError::session_not_found(),
            SessionError::ProtectedField(_) | SessionError::InvalidPatch(_) => {
                AppError::BadRequest(e.to_string())
            }
            SessionError::Crypto(e) => e.into(),
        }
    }
}

impl From<OAuthError> for AppError {
    fn from(e: OAuthError) -> Self {
        match e {
            OAuthError::Timeout => AppError::GatewayTimeout(e.to_string()),
            OAuthError::Transport(_) => AppError::BadGateway(e.to_string()),
            OAuthError::MissingCode | OAuthError::MissingState | OAuthError::MalformedCallback(_) => {
                AppError::BadRequest(e.to_string())
            }
            // Everything else means the user has to authorize again
            _ => AppError::Unauthorized(e.to_string()),
        }
    }
}

/// Create the API router
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/api/health", get(health))
        .route(
            "/api/session",
            post(session::create_session).delete(session::delete_session),
        )
        .route("/api/keys", post(session::store_keys))
        .route("/api/keys/status", get(session::key_status))
        .route("/api/oauth/start", get(oauth::oauth_start))
        .route("/api/oauth/callback", get(oauth::oauth_callback))
        .with_state(Arc::new(state))
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    key_valid: bool,
    oauth_enabled: bool,
    sessions: SessionStats,
}

/// GET /api/health
async fn health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    let key_valid = state.sessions.validate_key();

    Json(HealthResponse {
        status: if key_valid { "ok" } else { "degraded" },
        key_valid,
        oauth_enabled: state.oauth.is_some(),
        sessions: state.sessions.stats(),
    })
}
