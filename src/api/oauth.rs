//! Notion OAuth routes.
//!
//! 1. Client calls `GET /api/oauth/start` with its session header and sends the
//!    user to the returned URL
//! 2. The provider redirects back to the client, which forwards the callback
//!    query verbatim to `GET /api/oauth/callback` with the same session header
//! 3. The pending handshake is consumed, the code exchanged and the token data
//!    stored in the session

use super::{extract_session_id, AppError, AppState};
use crate::oauth::OAuthNegotiator;
use crate::session::short_id;
use axum::{
    extract::{RawQuery, State},
    http::HeaderMap,
    response::Json,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, warn};

#[derive(Serialize, Deserialize)]
pub struct OAuthStartResponse {
    pub authorization_url: String,
}

#[derive(Serialize, Deserialize)]
pub struct OAuthConnectedResponse {
    pub workspace_id: String,
    pub workspace_name: Option<String>,
}

fn negotiator(state: &AppState) -> Result<&OAuthNegotiator, AppError> {
    state.oauth.as_deref().ok_or_else(|| {
        AppError::ServiceUnavailable(
            "OAuth not configured. Set NOTION_CLIENT_ID, NOTION_CLIENT_SECRET and NOTION_REDIRECT_URI."
                .to_string(),
        )
    })
}

/// GET /api/oauth/start
///
/// # Security
/// - Fresh `state` and PKCE verifier per call, parked under the session id
/// - A later start for the same session replaces the earlier handshake
pub(super) async fn oauth_start(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<OAuthStartResponse>, AppError> {
    let session_id = extract_session_id(&headers)?;
    let negotiator = negotiator(&state)?;

    if state.sessions.get(&session_id).is_none() {
        return Err(AppError::session_not_found());
    }

    let request = negotiator.begin();
    state.handshakes.put(&session_id, request.handshake);

    info!(session_id = short_id(&session_id), "OAuth authorization started");

    Ok(Json(OAuthStartResponse {
        authorization_url: request.authorization_url,
    }))
}

/// GET /api/oauth/callback
///
/// # Security
/// - The handshake is single-use: it is taken before the exchange and only put
///   back after a transient (network) failure, never over a newer one
/// - The session must be live and the state must match before any call to
///   the token endpoint
pub(super) async fn oauth_callback(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    RawQuery(query): RawQuery,
) -> Result<Json<OAuthConnectedResponse>, AppError> {
    let session_id = extract_session_id(&headers)?;
    let negotiator = negotiator(&state)?;
    let query = query.unwrap_or_default();

    debug!(session_id = short_id(&session_id), "OAuth callback received");

    // The provider code is single-use, so don't spend it on a dead session
    if state.sessions.get(&session_id).is_none() {
        return Err(AppError::session_not_found());
    }

    let handshake = state.handshakes.take(&session_id).ok_or_else(|| {
        warn!(
            session_id = short_id(&session_id),
            "OAuth callback without a pending authorization (expired or replayed)"
        );
        AppError::BadRequest("No pending authorization for this session".to_string())
    })?;

    let token = match negotiator
        .complete(&query, &handshake.state, &handshake.code_verifier)
        .await
    {
        Ok(token) => token,
        Err(e) if e.is_transient() => {
            if state.handshakes.restore(&session_id, handshake) {
                warn!(session_id = short_id(&session_id), error = %e, "OAuth exchange failed, retry allowed");
            } else {
                warn!(session_id = short_id(&session_id), error = %e, "OAuth exchange failed, newer authorization pending");
            }
            return Err(e.into());
        }
        Err(e) => {
            warn!(session_id = short_id(&session_id), error = %e, "OAuth authorization rejected");
            return Err(e.into());
        }
    };

    if !state.sessions.store_oauth_data(&session_id, &token)? {
        return Err(AppError::session_not_found());
    }

    info!(
        session_id = short_id(&session_id),
        workspace_id = %token.workspace_id,
        "Notion workspace connected"
    );

    Ok(Json(OAuthConnectedResponse {
        workspace_id: token.workspace_id,
        workspace_name: token.workspace_name,
    }))
}
