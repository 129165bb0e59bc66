//! Notion OAuth endpoint configuration.

use std::fmt;

pub const NOTION_AUTHORIZATION_URL: &str = "https://api.notion.com/v1/oauth/authorize";
pub const NOTION_TOKEN_URL: &str = "https://api.notion.com/v1/oauth/token";

/// Scopes every granted token must carry (read/write for pages and databases)
pub const REQUIRED_SCOPES: [&str; 4] = [
    "pages:read",
    "pages:write",
    "databases:read",
    "databases:write",
];

/// OAuth provider configuration
#[derive(Clone)]
pub struct OAuthProviderConfig {
    /// OAuth authorization endpoint URL
    pub authorization_url: String,

    /// OAuth token exchange endpoint URL
    pub token_url: String,

    /// Required OAuth scopes
    pub scopes: Vec<String>,

    pub client_id: String,

    /// Sent only via HTTP Basic auth to the token endpoint
    pub client_secret: String,

    /// Redirect URI registered with the provider
    pub redirect_uri: String,
}

impl OAuthProviderConfig {
    /// Notion endpoints with the fixed page/database scope set.
    pub fn notion(
        client_id: impl Into<String>,
        client_secret: impl Into<String>,
        redirect_uri: impl Into<String>,
    ) -> Self {
        Self {
            authorization_url: NOTION_AUTHORIZATION_URL.to_string(),
            token_url: NOTION_TOKEN_URL.to_string(),
            scopes: REQUIRED_SCOPES.iter().map(|s| s.to_string()).collect(),
            client_id: client_id.into(),
            client_secret: client_secret.into(),
            redirect_uri: redirect_uri.into(),
        }
    }

    /// Build authorization URL with state and S256 code challenge
    pub fn build_auth_url(&self, state: &str, code_challenge: &str) -> String {
        let scopes = self.scopes.join(" ");
        format!(
            "{}?client_id={}&redirect_uri={}&response_type=code&owner=user&scope={}&state={}&code_challenge={}&code_challenge_method=S256",
            self.authorization_url,
            urlencoding::encode(&self.client_id),
            urlencoding::encode(&self.redirect_uri),
            urlencoding::encode(&scopes),
            urlencoding::encode(state),
            urlencoding::encode(code_challenge)
        )
    }
}

impl fmt::Debug for OAuthProviderConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OAuthProviderConfig")
            .field("authorization_url", &self.authorization_url)
            .field("token_url", &self.token_url)
            .field("scopes", &self.scopes)
            .field("client_id", &self.client_id)
            .field("redirect_uri", &self.redirect_uri)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> OAuthProviderConfig {
        OAuthProviderConfig::notion(
            "test_client_id",
            "test_secret",
            "http://localhost:8000/callback",
        )
    }

    #[test]
    fn test_notion_defaults() {
        let config = test_config();
        assert_eq!(config.authorization_url, NOTION_AUTHORIZATION_URL);
        assert_eq!(config.token_url, NOTION_TOKEN_URL);
        assert_eq!(config.scopes.len(), 4);
        assert!(config.scopes.contains(&"databases:write".to_string()));
    }

    #[test]
    fn test_build_auth_url() {
        let url = test_config().build_auth_url("random_state", "challenge_value");

        assert!(url.starts_with(NOTION_AUTHORIZATION_URL));
        assert!(url.contains("client_id=test_client_id"));
        assert!(url.contains("redirect_uri=http%3A%2F%2Flocalhost%3A8000%2Fcallback"));
        // URL encoding converts spaces to %20 and colons to %3A
        assert!(url.contains("scope=pages%3Aread%20pages%3Awrite%20databases%3Aread%20databases%3Awrite"));
        assert!(url.contains("state=random_state"));
        assert!(url.contains("code_challenge=challenge_value"));
        assert!(url.contains("code_challenge_method=S256"));
        assert!(url.contains("response_type=code"));
        assert!(!url.contains("test_secret"));
    }

    #[test]
    fn test_debug_omits_secret() {
        let rendered = format!("{:?}", test_config());
        assert!(rendered.contains("test_client_id"));
        assert!(!rendered.contains("test_secret"));
    }
}
