use super::{extract_session_id, AppError, AppState};
use crate::cipher::random_token;
use crate::credentials::Provider;
use crate::session::short_id;
use axum::{
    extract::State,
    http::{HeaderMap, StatusCode},
    response::Json,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::Arc;
use tracing::{debug, info};

/// Shortest API key accepted by `POST /api/keys`
const MIN_KEY_LENGTH: usize = 10;

#[derive(Deserialize)]
pub struct CreateSessionRequest {
    /// Defaults to a fresh anonymous id
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub user_data: Map<String, Value>,
}

#[derive(Serialize, Deserialize)]
pub struct CreateSessionResponse {
    pub session_id: String,
    pub user_id: String,
    pub expires_at: DateTime<Utc>,
}

#[derive(Deserialize)]
pub struct StoreKeysRequest {
    pub openrouter_key: String,
    pub notion_token: String,
    #[serde(default)]
    pub ai_model: Option<String>,
}

#[derive(Serialize, Deserialize)]
pub struct KeyStatusResponse {
    pub session_valid: bool,
    pub openrouter_configured: bool,
    pub notion_configured: bool,
    pub oauth_connected: bool,
    pub ai_model: Option<String>,
}

/// POST /api/session - Start a session
pub(super) async fn create_session(
    State(state): State<Arc<AppState>>,
    Json(request): Json<CreateSessionRequest>,
) -> Result<(StatusCode, Json<CreateSessionResponse>), AppError> {
    let user_id = request
        .user_id
        .filter(|id| !id.trim().is_empty())
        .unwrap_or_else(|| format!("anon_{}", random_token(9)));

    let session_id = state.sessions.create(&user_id, request.user_data)?;
    let session = state
        .sessions
        .get(&session_id)
        .ok_or_else(|| AppError::ServerError("Session vanished after creation".to_string()))?;

    Ok((
        StatusCode::CREATED,
        Json(CreateSessionResponse {
            session_id,
            user_id,
            expires_at: session.expires_at,
        }),
    ))
}

/// DELETE /api/session - End the session named by the header
pub(super) async fn delete_session(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<StatusCode, AppError> {
    let session_id = extract_session_id(&headers)?;

    if !state.sessions.delete(&session_id) {
        return Err(AppError::session_not_found());
    }
    state.handshakes.take(&session_id);

    Ok(StatusCode::NO_CONTENT)
}

/// POST /api/keys - Store the OpenRouter and Notion keys for this session
pub(super) async fn store_keys(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(request): Json<StoreKeysRequest>,
) -> Result<Json<KeyStatusResponse>, AppError> {
    let session_id = extract_session_id(&headers)?;

    let openrouter_key = validated_key("openrouter_key", &request.openrouter_key)?;
    let notion_token = validated_key("notion_token", &request.notion_token)?;

    let keys = [
        (Provider::OpenRouter, openrouter_key),
        (Provider::Notion, notion_token),
    ];
    if !state.sessions.store_api_keys(&session_id, keys)? {
        return Err(AppError::session_not_found());
    }

    if let Some(model) = request.ai_model.filter(|m| !m.trim().is_empty()) {
        state
            .sessions
            .store_preference(&session_id, "ai_model", Value::String(model))?;
    }

    info!(session_id = short_id(&session_id), "API keys configured");

    Ok(Json(key_status_for(&state, &session_id)))
}

/// GET /api/keys/status - Which credentials this session holds (never the values)
pub(super) async fn key_status(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<KeyStatusResponse>, AppError> {
    let session_id = extract_session_id(&headers)?;
    debug!(session_id = short_id(&session_id), "Key status requested");

    Ok(Json(key_status_for(&state, &session_id)))
}

fn key_status_for(state: &AppState, session_id: &str) -> KeyStatusResponse {
    let sessions = &state.sessions;
    if sessions.get(session_id).is_none() {
        return KeyStatusResponse {
            session_valid: false,
            openrouter_configured: false,
            notion_configured: false,
            oauth_connected: false,
            ai_model: None,
        };
    }

    KeyStatusResponse {
        session_valid: true,
        openrouter_configured: sessions.get_api_key(session_id, Provider::OpenRouter).is_some(),
        notion_configured: sessions.get_api_key(session_id, Provider::Notion).is_some(),
        oauth_connected: sessions
            .get_oauth_data(session_id)
            .map(|token| !token.is_expired())
            .unwrap_or(false),
        ai_model: sessions
            .get_preference(session_id, "ai_model")
            .and_then(|value| value.as_str().map(str::to_string)),
    }
}

fn validated_key<'a>(field: &str, value: &'a str) -> Result<&'a str, AppError> {
    let value = value.trim();
    if value.len() < MIN_KEY_LENGTH {
        return Err(AppError::BadRequest(format!(
            "{} must be at least {} characters",
            field, MIN_KEY_LENGTH
        )));
    }
    Ok(value)
}
