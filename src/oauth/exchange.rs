//! OAuth token endpoint requests.
//!
//! Handles exchanging authorization codes (with the PKCE verifier) and refresh
//! tokens for access tokens. Client credentials travel via HTTP Basic auth.

use super::{OAuthError, OAuthProviderConfig, TokenData};
use chrono::{Duration, Utc};
use serde::Deserialize;
use serde_json::Value;

/// Longest provider error body echoed back in `OAuthError::Http`
const MAX_ERROR_BODY_CHARS: usize = 512;

/// Grant presented to the token endpoint
pub(crate) enum Grant<'a> {
    AuthorizationCode {
        code: &'a str,
        code_verifier: &'a str,
    },
    RefreshToken {
        refresh_token: &'a str,
    },
}

impl Grant<'_> {
    fn grant_type(&self) -> &'static str {
        match self {
            Grant::AuthorizationCode { .. } => "authorization_code",
            Grant::RefreshToken { .. } => "refresh_token",
        }
    }
}

/// Token endpoint response. Every field is optional here so a missing one can
/// be reported by name rather than as a generic parse failure.
#[derive(Deserialize, Debug, Default)]
struct TokenResponse {
    #[serde(default)]
    access_token: Option<String>,
    #[serde(default)]
    token_type: Option<String>,
    #[serde(default)]
    workspace_id: Option<String>,
    #[serde(default)]
    workspace_name: Option<String>,
    #[serde(default)]
    workspace_icon: Option<String>,
    #[serde(default)]
    bot_id: Option<String>,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    expires_in: Option<i64>,
    #[serde(default)]
    scope: Option<String>,
    #[serde(default)]
    owner: Option<Value>,
}

impl TokenResponse {
    fn into_token_data(self) -> Result<TokenData, OAuthError> {
        let access_token = required(self.access_token, "access_token")?;
        let token_type = required(self.token_type, "token_type")?;
        let workspace_id = required(self.workspace_id, "workspace_id")?;

        // Calculate expiration time
        let expires_at = self.expires_in.and_then(|seconds| {
            Duration::try_seconds(seconds).and_then(|ttl| Utc::now().checked_add_signed(ttl))
        });

        Ok(TokenData {
            access_token,
            token_type,
            workspace_id,
            workspace_name: self.workspace_name,
            workspace_icon: self.workspace_icon,
            bot_id: self.bot_id,
            refresh_token: self.refresh_token,
            expires_in: self.expires_in,
            expires_at,
            scope: self.scope,
            owner: self.owner,
        })
    }
}

fn required(value: Option<String>, name: &'static str) -> Result<String, OAuthError> {
    value
        .filter(|v| !v.is_empty())
        .ok_or(OAuthError::MissingField(name))
}

fn transport_error(e: reqwest::Error) -> OAuthError {
    if e.is_timeout() {
        OAuthError::Timeout
    } else {
        OAuthError::Transport(e.to_string())
    }
}

/// POST a grant to the token endpoint and parse the response.
///
/// # Returns
/// * `Ok(TokenData)` - Response carried `access_token`, `token_type` and `workspace_id`
/// * `Err(OAuthError::Timeout)` - No complete response within `timeout`
/// * `Err(OAuthError::Http)` - Non-2xx status
/// * `Err(OAuthError::InvalidResponse)` - Body was not the expected JSON
/// * `Err(OAuthError::MissingField)` - A required field was absent
pub(crate) async fn request_token(
    client: &reqwest::Client,
    config: &OAuthProviderConfig,
    grant: Grant<'_>,
    timeout: std::time::Duration,
) -> Result<TokenData, OAuthError> {
    let mut form: Vec<(&str, &str)> = vec![("grant_type", grant.grant_type())];
    match &grant {
        Grant::AuthorizationCode {
            code,
            code_verifier,
        } => {
            form.push(("code", *code));
            form.push(("redirect_uri", config.redirect_uri.as_str()));
            form.push(("code_verifier", *code_verifier));
        }
        Grant::RefreshToken { refresh_token } => {
            form.push(("refresh_token", *refresh_token));
        }
    }

    tracing::debug!(
        token_url = %config.token_url,
        grant_type = grant.grant_type(),
        "Requesting token"
    );

    let exchange = async {
        let response = client
            .post(&config.token_url)
            .basic_auth(&config.client_id, Some(&config.client_secret))
            .header("Accept", "application/json")
            .form(&form)
            .send()
            .await
            .map_err(transport_error)?;

        let status = response.status();
        let body = response.text().await.map_err(transport_error)?;
        Ok::<_, OAuthError>((status, body))
    };

    let (status, body) = tokio::time::timeout(timeout, exchange)
        .await
        .map_err(|_| OAuthError::Timeout)??;

    if !status.is_success() {
        return Err(OAuthError::Http {
            status: status.as_u16(),
            body: body.chars().take(MAX_ERROR_BODY_CHARS).collect(),
        });
    }

    let token_response: TokenResponse = serde_json::from_str(&body)
        .map_err(|e| OAuthError::InvalidResponse(e.to_string()))?;

    tracing::debug!(
        has_refresh_token = token_response.refresh_token.is_some(),
        expires_in = ?token_response.expires_in,
        "Token response received"
    );

    token_response.into_token_data()
}
