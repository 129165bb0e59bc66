use anyhow::{Context, Result};
use serde::Deserialize;
use std::fmt;
use std::path::Path;

use crate::oauth::{
    OAuthProviderConfig, DEFAULT_REQUEST_TIMEOUT_SECS, NOTION_AUTHORIZATION_URL, NOTION_TOKEN_URL,
    REQUIRED_SCOPES,
};

// Re-export existing config types
pub use crate::session::SessionConfig;

/// Complete service configuration
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub oauth: OAuthSettings,
}

/// HTTP server configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
}

fn default_bind_addr() -> String {
    "127.0.0.1:8000".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
        }
    }
}

/// Notion OAuth client settings. The OAuth routes stay disabled until
/// `client_id`, `client_secret` and `redirect_uri` are all set.
#[derive(Clone, Deserialize)]
pub struct OAuthSettings {
    #[serde(default)]
    pub client_id: Option<String>,
    #[serde(default)]
    pub client_secret: Option<String>,
    #[serde(default)]
    pub redirect_uri: Option<String>,
    #[serde(default = "default_authorization_url")]
    pub authorization_url: String,
    #[serde(default = "default_token_url")]
    pub token_url: String,
    /// Upper bound on each token endpoint call
    #[serde(default = "default_request_timeout")]
    pub request_timeout_seconds: u64,
    /// How long a started authorization may wait for its callback
    #[serde(default = "default_handshake_ttl")]
    pub handshake_ttl_seconds: i64,
}

fn default_authorization_url() -> String {
    NOTION_AUTHORIZATION_URL.to_string()
}

fn default_token_url() -> String {
    NOTION_TOKEN_URL.to_string()
}

fn default_request_timeout() -> u64 {
    DEFAULT_REQUEST_TIMEOUT_SECS
}

fn default_handshake_ttl() -> i64 {
    600
}

impl Default for OAuthSettings {
    fn default() -> Self {
        Self {
            client_id: None,
            client_secret: None,
            redirect_uri: None,
            authorization_url: default_authorization_url(),
            token_url: default_token_url(),
            request_timeout_seconds: default_request_timeout(),
            handshake_ttl_seconds: default_handshake_ttl(),
        }
    }
}

impl OAuthSettings {
    /// Provider config, or None while the client is not fully configured.
    pub fn provider_config(&self) -> Option<OAuthProviderConfig> {
        let present = |value: &Option<String>| value.clone().filter(|v| !v.trim().is_empty());

        Some(OAuthProviderConfig {
            authorization_url: self.authorization_url.clone(),
            token_url: self.token_url.clone(),
            scopes: REQUIRED_SCOPES.iter().map(|s| s.to_string()).collect(),
            client_id: present(&self.client_id)?,
            client_secret: present(&self.client_secret)?,
            redirect_uri: present(&self.redirect_uri)?,
        })
    }
}

impl fmt::Debug for OAuthSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OAuthSettings")
            .field("client_id", &self.client_id)
            .field("client_secret_set", &self.client_secret.is_some())
            .field("redirect_uri", &self.redirect_uri)
            .field("authorization_url", &self.authorization_url)
            .field("token_url", &self.token_url)
            .field("request_timeout_seconds", &self.request_timeout_seconds)
            .field("handshake_ttl_seconds", &self.handshake_ttl_seconds)
            .finish()
    }
}

impl AppConfig {
    /// Apply overrides from the process environment.
    pub fn apply_env_overrides(&mut self) {
        self.apply_env_overrides_from(|name| std::env::var(name).ok());
    }

    /// Apply overrides using `lookup` to read variables.
    pub fn apply_env_overrides_from(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(v) = lookup("TEMPLATE_MAKER_BIND_ADDR") {
            self.server.bind_addr = v;
        }
        if let Some(n) = parse_var(&lookup, "TEMPLATE_MAKER_SESSION_TTL_HOURS") {
            self.session.ttl_hours = n;
        }
        if let Some(n) = parse_var(&lookup, "TEMPLATE_MAKER_MAX_SESSIONS_PER_USER") {
            self.session.max_sessions_per_user = n;
        }
        if let Some(n) = parse_var(&lookup, "TEMPLATE_MAKER_SWEEP_INTERVAL_SECONDS") {
            self.session.sweep_interval_seconds = n;
        }
        if let Some(v) = lookup("TEMPLATE_MAKER_ENCRYPTION_KEY") {
            self.session.encryption_key = Some(v);
        }
        if let Some(v) = lookup("NOTION_CLIENT_ID") {
            self.oauth.client_id = Some(v);
        }
        if let Some(v) = lookup("NOTION_CLIENT_SECRET") {
            self.oauth.client_secret = Some(v);
        }
        if let Some(v) = lookup("NOTION_REDIRECT_URI") {
            self.oauth.redirect_uri = Some(v);
        }
        if let Some(n) = parse_var(&lookup, "TEMPLATE_MAKER_OAUTH_TIMEOUT_SECONDS") {
            self.oauth.request_timeout_seconds = n;
        }
    }
}

fn parse_var<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &str,
) -> Option<T> {
    let raw = lookup(name)?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            tracing::warn!(variable = name, value = %raw, "Ignoring unparsable environment override");
            None
        }
    }
}

/// Load configuration from TOML file
pub fn load_config(path: impl AsRef<Path>) -> Result<AppConfig> {
    let path = path.as_ref();
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file {}", path.display()))?;
    let config: AppConfig = toml::from_str(&contents)
        .with_context(|| format!("Failed to parse config file {}", path.display()))?;
    Ok(config)
}
