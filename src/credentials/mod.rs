//! Field-level encryption of per-session secrets.
//!
//! Every API key and OAuth token is sealed on its own, so a single credential
//! can be removed or re-keyed without touching the others. The containers here
//! live inside the session payload, which the session layer encrypts again as a
//! whole.
//!
//! # Usage
//!
//! ```
//! use template_maker::cipher::CipherProvider;
//! use template_maker::credentials::{CredentialMap, Provider};
//!
//! # fn main() -> Result<(), template_maker::cipher::CryptoError> {
//! let cipher = CipherProvider::generate();
//! let mut credentials = CredentialMap::default();
//!
//! credentials.store(&cipher, Provider::OpenRouter, "sk-or-v1-example")?;
//! assert_eq!(
//!     credentials.get(&cipher, &Provider::OpenRouter).as_deref(),
//!     Some("sk-or-v1-example")
//! );
//!
//! credentials.remove(&Provider::OpenRouter);
//! assert!(credentials.get(&cipher, &Provider::OpenRouter).is_none());
//! # Ok(())
//! # }
//! ```

use crate::cipher::{CipherProvider, CryptoError};
use crate::oauth::TokenData;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;

/// Key of a stored credential.
///
/// Names are case-insensitive: `"Notion"` and `"notion"` address the same slot.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Provider {
    OpenRouter,
    Notion,
    Other(String),
}

impl Provider {
    pub fn as_str(&self) -> &str {
        match self {
            Provider::OpenRouter => "openrouter",
            Provider::Notion => "notion",
            Provider::Other(name) => name,
        }
    }
}

impl From<&str> for Provider {
    fn from(name: &str) -> Self {
        let name = name.trim().to_ascii_lowercase();
        match name.as_str() {
            "openrouter" => Provider::OpenRouter,
            "notion" => Provider::Notion,
            _ => Provider::Other(name),
        }
    }
}

impl From<String> for Provider {
    fn from(name: String) -> Self {
        Provider::from(name.as_str())
    }
}

impl From<Provider> for String {
    fn from(provider: Provider) -> Self {
        provider.as_str().to_string()
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One sealed secret and when it was stored.
#[derive(Clone, Serialize, Deserialize)]
pub struct EncryptedSecret {
    #[serde(with = "crate::cipher::base64_bytes")]
    ciphertext: Vec<u8>,
    pub stored_at: DateTime<Utc>,
}

impl EncryptedSecret {
    pub fn seal(cipher: &CipherProvider, secret: &str) -> Result<Self, CryptoError> {
        Ok(Self {
            ciphertext: cipher.encrypt_str(secret)?,
            stored_at: Utc::now(),
        })
    }

    pub fn open(&self, cipher: &CipherProvider) -> Result<String, CryptoError> {
        cipher.decrypt_to_string(&self.ciphertext)
    }

    /// Re-encrypt under `new`, keeping `stored_at`.
    pub fn reseal(&self, old: &CipherProvider, new: &CipherProvider) -> Result<Self, CryptoError> {
        let secret = self.open(old)?;
        Ok(Self {
            ciphertext: new.encrypt_str(&secret)?,
            stored_at: self.stored_at,
        })
    }
}

impl fmt::Debug for EncryptedSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EncryptedSecret")
            .field("len", &self.ciphertext.len())
            .field("stored_at", &self.stored_at)
            .finish()
    }
}

/// Provider name to sealed secret, one entry per provider.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CredentialMap(BTreeMap<Provider, EncryptedSecret>);

impl CredentialMap {
    /// Seal `secret` and upsert it under `provider`.
    pub fn store(
        &mut self,
        cipher: &CipherProvider,
        provider: Provider,
        secret: &str,
    ) -> Result<(), CryptoError> {
        let sealed = EncryptedSecret::seal(cipher, secret)?;
        self.0.insert(provider, sealed);
        Ok(())
    }

    /// Decrypt the secret for `provider`.
    ///
    /// A secret that no longer decrypts is reported as absent.
    pub fn get(&self, cipher: &CipherProvider, provider: &Provider) -> Option<String> {
        let sealed = self.0.get(provider)?;
        match sealed.open(cipher) {
            Ok(secret) => Some(secret),
            Err(e) => {
                tracing::warn!(provider = %provider, error = %e, "Stored credential is unreadable");
                None
            }
        }
    }

    pub fn remove(&mut self, provider: &Provider) -> bool {
        self.0.remove(provider).is_some()
    }

    pub fn contains(&self, provider: &Provider) -> bool {
        self.0.contains_key(provider)
    }

    pub fn providers(&self) -> impl Iterator<Item = &Provider> {
        self.0.keys()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Re-encrypt every entry under `new`. Fails on the first unreadable entry.
    pub fn reseal(&self, old: &CipherProvider, new: &CipherProvider) -> Result<Self, CryptoError> {
        self.0
            .iter()
            .map(|(provider, sealed)| Ok((provider.clone(), sealed.reseal(old, new)?)))
            .collect::<Result<BTreeMap<_, _>, CryptoError>>()
            .map(CredentialMap)
    }
}

/// OAuth token data with `access_token` and `refresh_token` sealed.
///
/// The remaining fields are metadata and stay in clear here.
#[derive(Clone, Serialize, Deserialize)]
pub struct EncryptedOAuthBundle {
    #[serde(with = "crate::cipher::base64_bytes")]
    access_token: Vec<u8>,
    #[serde(default, with = "crate::cipher::base64_bytes::option")]
    refresh_token: Option<Vec<u8>>,
    pub token_type: String,
    pub workspace_id: String,
    #[serde(default)]
    pub workspace_name: Option<String>,
    #[serde(default)]
    pub workspace_icon: Option<String>,
    #[serde(default)]
    pub bot_id: Option<String>,
    #[serde(default)]
    pub expires_in: Option<i64>,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub scope: Option<String>,
    #[serde(default)]
    pub owner: Option<Value>,
    pub stored_at: DateTime<Utc>,
}

impl EncryptedOAuthBundle {
    pub fn seal(cipher: &CipherProvider, token: &TokenData) -> Result<Self, CryptoError> {
        let refresh_token = token
            .refresh_token
            .as_deref()
            .map(|refresh| cipher.encrypt_str(refresh))
            .transpose()?;

        Ok(Self {
            access_token: cipher.encrypt_str(&token.access_token)?,
            refresh_token,
            token_type: token.token_type.clone(),
            workspace_id: token.workspace_id.clone(),
            workspace_name: token.workspace_name.clone(),
            workspace_icon: token.workspace_icon.clone(),
            bot_id: token.bot_id.clone(),
            expires_in: token.expires_in,
            expires_at: token.expires_at,
            scope: token.scope.clone(),
            owner: token.owner.clone(),
            stored_at: Utc::now(),
        })
    }

    pub fn open(&self, cipher: &CipherProvider) -> Result<TokenData, CryptoError> {
        let refresh_token = self
            .refresh_token
            .as_deref()
            .map(|sealed| cipher.decrypt_to_string(sealed))
            .transpose()?;

        Ok(TokenData {
            access_token: cipher.decrypt_to_string(&self.access_token)?,
            token_type: self.token_type.clone(),
            workspace_id: self.workspace_id.clone(),
            workspace_name: self.workspace_name.clone(),
            workspace_icon: self.workspace_icon.clone(),
            bot_id: self.bot_id.clone(),
            refresh_token,
            expires_in: self.expires_in,
            expires_at: self.expires_at,
            scope: self.scope.clone(),
            owner: self.owner.clone(),
        })
    }

    /// Re-encrypt both tokens under `new`, keeping metadata and `stored_at`.
    pub fn reseal(&self, old: &CipherProvider, new: &CipherProvider) -> Result<Self, CryptoError> {
        let access_token = new.encrypt_str(&old.decrypt_to_string(&self.access_token)?)?;
        let refresh_token = self
            .refresh_token
            .as_deref()
            .map(|sealed| new.encrypt_str(&old.decrypt_to_string(sealed)?))
            .transpose()?;

        Ok(Self {
            access_token,
            refresh_token,
            ..self.clone()
        })
    }
}

impl fmt::Debug for EncryptedOAuthBundle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EncryptedOAuthBundle")
            .field("token_type", &self.token_type)
            .field("workspace_id", &self.workspace_id)
            .field("has_refresh_token", &self.refresh_token.is_some())
            .field("expires_at", &self.expires_at)
            .field("stored_at", &self.stored_at)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cipher::{CipherKey, KEY_SIZE};

    fn cipher(seed: u8) -> CipherProvider {
        CipherProvider::new(CipherKey::from_bytes([seed; KEY_SIZE]))
    }

    fn sample_token() -> TokenData {
        TokenData {
            access_token: "secret_access_token_123".to_string(),
            token_type: "bearer".to_string(),
            workspace_id: "ws-1".to_string(),
            workspace_name: Some("Acme".to_string()),
            workspace_icon: None,
            bot_id: Some("bot-1".to_string()),
            refresh_token: Some("refresh_token_456".to_string()),
            expires_in: Some(3600),
            expires_at: Some(Utc::now() + chrono::Duration::hours(1)),
            scope: Some("pages:read".to_string()),
            owner: None,
        }
    }

    #[test]
    fn test_provider_names() {
        assert_eq!(Provider::from("openrouter"), Provider::OpenRouter);
        assert_eq!(Provider::from(" Notion "), Provider::Notion);
        assert_eq!(
            Provider::from("Anthropic"),
            Provider::Other("anthropic".to_string())
        );
        assert_eq!(Provider::Other("x".into()).to_string(), "x");
    }

    #[test]
    fn test_store_and_get() {
        let cipher = cipher(1);
        let mut credentials = CredentialMap::default();

        credentials
            .store(&cipher, Provider::OpenRouter, "sk-or-v1-XYZ")
            .unwrap();

        assert_eq!(
            credentials.get(&cipher, &Provider::OpenRouter).as_deref(),
            Some("sk-or-v1-XYZ")
        );
        assert!(credentials.get(&cipher, &Provider::Notion).is_none());
        assert_eq!(credentials.len(), 1);
    }

    #[test]
    fn test_store_overwrites() {
        let cipher = cipher(1);
        let mut credentials = CredentialMap::default();

        credentials.store(&cipher, Provider::Notion, "first-token").unwrap();
        credentials.store(&cipher, Provider::Notion, "second-token").unwrap();

        assert_eq!(credentials.len(), 1);
        assert_eq!(
            credentials.get(&cipher, &Provider::Notion).as_deref(),
            Some("second-token")
        );
    }

    #[test]
    fn test_secret_is_not_stored_in_clear() {
        let cipher = cipher(1);
        let mut credentials = CredentialMap::default();
        credentials.store(&cipher, Provider::Notion, "plain-secret").unwrap();

        let json = serde_json::to_string(&credentials).unwrap();
        assert!(json.contains("\"notion\""));
        assert!(!json.contains("plain-secret"));
    }

    #[test]
    fn test_unreadable_secret_reads_as_absent() {
        let mut credentials = CredentialMap::default();
        credentials.store(&cipher(1), Provider::Notion, "token").unwrap();

        assert!(credentials.get(&cipher(2), &Provider::Notion).is_none());
    }

    #[test]
    fn test_remove() {
        let cipher = cipher(1);
        let mut credentials = CredentialMap::default();
        credentials.store(&cipher, Provider::Notion, "token").unwrap();

        assert!(credentials.remove(&Provider::Notion));
        assert!(!credentials.remove(&Provider::Notion));
        assert!(credentials.is_empty());
    }

    #[test]
    fn test_serde_roundtrip_keeps_secrets_readable() {
        let cipher = cipher(1);
        let mut credentials = CredentialMap::default();
        credentials.store(&cipher, Provider::OpenRouter, "sk-or").unwrap();
        credentials
            .store(&cipher, Provider::from("custom"), "custom-key")
            .unwrap();

        let json = serde_json::to_string(&credentials).unwrap();
        let restored: CredentialMap = serde_json::from_str(&json).unwrap();

        assert_eq!(
            restored.get(&cipher, &Provider::from("custom")).as_deref(),
            Some("custom-key")
        );
        assert_eq!(restored.providers().count(), 2);
    }

    #[test]
    fn test_reseal_moves_secrets_to_new_key() {
        let old = cipher(1);
        let new = cipher(2);
        let mut credentials = CredentialMap::default();
        credentials.store(&old, Provider::Notion, "token-value").unwrap();

        let resealed = credentials.reseal(&old, &new).unwrap();

        assert_eq!(
            resealed.get(&new, &Provider::Notion).as_deref(),
            Some("token-value")
        );
        assert!(resealed.get(&old, &Provider::Notion).is_none());
    }

    #[test]
    fn test_reseal_fails_on_unreadable_entry() {
        let mut credentials = CredentialMap::default();
        credentials.store(&cipher(9), Provider::Notion, "token").unwrap();

        assert_eq!(
            credentials.reseal(&cipher(1), &cipher(2)).unwrap_err(),
            CryptoError::Decrypt
        );
    }

    #[test]
    fn test_oauth_bundle_roundtrip() {
        let cipher = cipher(1);
        let token = sample_token();

        let bundle = EncryptedOAuthBundle::seal(&cipher, &token).unwrap();
        assert_eq!(bundle.workspace_id, "ws-1");

        let json = serde_json::to_string(&bundle).unwrap();
        assert!(!json.contains("secret_access_token_123"));
        assert!(!json.contains("refresh_token_456"));
        assert!(json.contains("ws-1"));

        assert_eq!(bundle.open(&cipher).unwrap(), token);
    }

    #[test]
    fn test_oauth_bundle_reseal() {
        let old = cipher(1);
        let new = cipher(2);
        let token = sample_token();
        let bundle = EncryptedOAuthBundle::seal(&old, &token).unwrap();

        let resealed = bundle.reseal(&old, &new).unwrap();

        assert_eq!(resealed.open(&new).unwrap(), token);
        assert!(resealed.open(&old).is_err());
        assert_eq!(resealed.stored_at, bundle.stored_at);
    }
}
