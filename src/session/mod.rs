//! In-memory session registry with two layers of encryption.
//!
//! API keys and OAuth tokens are sealed individually (see [`crate::credentials`]).
//! The whole session payload (user data, credentials, OAuth bundle and
//! preferences) is then sealed again into a single blob, which is the only form
//! in which it is held between requests.
//!
//! # Locking
//!
//! ```text
//! cipher: RwLock<CipherProvider>      read by every operation, written by rotation
//!   └─ sessions: DashMap<id, Arc<Mutex<SessionRecord>>>
//!        └─ per-session Mutex          serialises read-decrypt-modify-seal-write
//! ```
//!
//! Locks are always taken in that order. A session mutex is never held while
//! removing from the map, and the map is never iterated while a session mutex is
//! held.

mod registry;
mod rotation;

pub use registry::run_session_sweeper;

use crate::cipher::{CipherKey, CipherProvider, CryptoError};
use crate::credentials::{CredentialMap, EncryptedOAuthBundle};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use thiserror::Error;


pub const DEFAULT_TTL_HOURS: i64 = 24;
pub const MAX_SESSIONS_PER_USER: usize = 5;
pub const DEFAULT_SWEEP_INTERVAL_SECS: u64 = 300;

/// Entropy behind each session id (43 URL-safe characters)
const SESSION_ID_BYTES: usize = 32;

/// Record fields that `update` must not touch
const PROTECTED_FIELDS: [&str; 7] = [
    "session_id",
    "user_id",
    "created_at",
    "expires_at",
    "credentials",
    "oauth",
    "encrypted_blob",
];

/// Session registry configuration
#[derive(Clone, Deserialize)]
pub struct SessionConfig {
    /// Lifetime of a new session
    #[serde(default = "default_ttl_hours")]
    pub ttl_hours: i64,

    /// Live sessions allowed per user before the oldest is evicted
    #[serde(default = "default_max_sessions_per_user")]
    pub max_sessions_per_user: usize,

    /// Expired-session sweep period (0 disables the sweeper)
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_seconds: u64,

    /// Base64 32-byte key. When absent a fresh key is derived at start-up.
    #[serde(default)]
    pub encryption_key: Option<String>,
}

fn default_ttl_hours() -> i64 {
    DEFAULT_TTL_HOURS
}

fn default_max_sessions_per_user() -> usize {
    MAX_SESSIONS_PER_USER
}

fn default_sweep_interval() -> u64 {
    DEFAULT_SWEEP_INTERVAL_SECS
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            ttl_hours: default_ttl_hours(),
            max_sessions_per_user: default_max_sessions_per_user(),
            sweep_interval_seconds: default_sweep_interval(),
            encryption_key: None,
        }
    }
}

impl fmt::Debug for SessionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionConfig")
            .field("ttl_hours", &self.ttl_hours)
            .field("max_sessions_per_user", &self.max_sessions_per_user)
            .field("sweep_interval_seconds", &self.sweep_interval_seconds)
            .field("encryption_key_set", &self.encryption_key.is_some())
            .finish()
    }
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("session not found")]
    NotFound,

    #[error("field '{0}' cannot be changed through update")]
    ProtectedField(String),

    #[error("invalid update: {0}")]
    InvalidPatch(String),

    #[error(transparent)]
    Crypto(#[from] CryptoError),
}

/// Key rotation failures. The previous key stays active after any of these.
#[derive(Debug, Error)]
pub enum RotationError {
    #[error("session {session_id} does not decrypt under the current key")]
    Undecryptable { session_id: String },

    #[error(transparent)]
    Crypto(#[from] CryptoError),
}

/// Everything sealed into a session's record-level blob
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub(crate) struct SessionPayload {
    #[serde(default)]
    pub user_data: Map<String, Value>,
    #[serde(default)]
    pub credentials: CredentialMap,
    #[serde(default)]
    pub oauth: Option<EncryptedOAuthBundle>,
    #[serde(default)]
    pub preferences: Map<String, Value>,
}

impl SessionPayload {
    fn seal(&self, cipher: &CipherProvider) -> Result<Vec<u8>, CryptoError> {
        let json = serde_json::to_vec(self).map_err(|e| CryptoError::Encoding(e.to_string()))?;
        cipher.encrypt(&json)
    }

    fn open(cipher: &CipherProvider, blob: &[u8]) -> Result<Self, CryptoError> {
        let json = cipher.decrypt(blob)?;
        serde_json::from_slice(&json).map_err(|e| CryptoError::Encoding(e.to_string()))
    }

    /// Move the field-level secrets from `old` to `new`.
    fn reseal(self, old: &CipherProvider, new: &CipherProvider) -> Result<Self, CryptoError> {
        Ok(Self {
            credentials: self.credentials.reseal(old, new)?,
            oauth: self
                .oauth
                .as_ref()
                .map(|bundle| bundle.reseal(old, new))
                .transpose()?,
            ..self
        })
    }
}

/// A live session as held in the registry.
///
/// Only routing metadata is kept in clear. The payload exists in plaintext only
/// for the duration of a single operation.
pub(crate) struct SessionRecord {
    pub session_id: String,
    pub user_id: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub encrypted_blob: Vec<u8>,
}

impl SessionRecord {
    fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    fn open(&self, cipher: &CipherProvider) -> Result<SessionPayload, CryptoError> {
        SessionPayload::open(cipher, &self.encrypted_blob)
    }
}

/// Decrypted read-only view of a session. Carries no secrets.
#[derive(Debug, Clone, Serialize)]
pub struct SessionView {
    pub session_id: String,
    pub user_id: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub user_data: Map<String, Value>,
    pub preferences: Map<String, Value>,
    /// Providers with a stored credential
    pub providers: Vec<String>,
    pub oauth_workspace_id: Option<String>,
    pub oauth_workspace_name: Option<String>,
}

impl SessionView {
    fn new(record: &SessionRecord, payload: SessionPayload) -> Self {
        let (oauth_workspace_id, oauth_workspace_name) = match payload.oauth {
            Some(bundle) => (Some(bundle.workspace_id), bundle.workspace_name),
            None => (None, None),
        };

        Self {
            session_id: record.session_id.clone(),
            user_id: record.user_id.clone(),
            created_at: record.created_at,
            expires_at: record.expires_at,
            providers: payload
                .credentials
                .providers()
                .map(|provider| provider.to_string())
                .collect(),
            user_data: payload.user_data,
            preferences: payload.preferences,
            oauth_workspace_id,
            oauth_workspace_name,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SessionStats {
    pub total: usize,
    pub active: usize,
    pub expired: usize,
}

/// One entry of [`SessionStore::user_sessions`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionSummary {
    pub session_id: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct EncryptionInfo {
    pub key_valid: bool,
    pub total_sessions: usize,
    pub encrypted_sessions: usize,
    pub key_rotation_available: bool,
}

type SessionEntry = Arc<Mutex<SessionRecord>>;

/// Session registry. Create one per process (or per test) and share it by `Arc`.
pub struct SessionStore {
    cipher: RwLock<CipherProvider>,
    sessions: DashMap<String, SessionEntry>,
    /// Serialises `create` so the per-user cap holds under concurrent logins
    admission: Mutex<()>,
    config: SessionConfig,
}

impl SessionStore {
    /// Build a store from config, importing `encryption_key` or deriving a fresh key.
    pub fn new(config: SessionConfig) -> Result<Self, CryptoError> {
        let key = match config.encryption_key.as_deref() {
            Some(encoded) => CipherKey::from_base64(encoded)?,
            None => CipherKey::derive(),
        };
        Ok(Self::with_key(config, key))
    }

    pub fn with_key(config: SessionConfig, key: CipherKey) -> Self {
        Self {
            cipher: RwLock::new(CipherProvider::new(key)),
            sessions: DashMap::new(),
            admission: Mutex::new(()),
            config,
        }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    fn read_cipher(&self) -> RwLockReadGuard<'_, CipherProvider> {
        self.cipher.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_cipher(&self) -> RwLockWriteGuard<'_, CipherProvider> {
        self.cipher.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn entry(&self, session_id: &str) -> Option<SessionEntry> {
        self.sessions
            .get(session_id)
            .map(|entry| Arc::clone(entry.value()))
    }

    /// Clone out every entry so no map guard is held while records are locked.
    fn snapshot(&self) -> Vec<(String, SessionEntry)> {
        self.sessions
            .iter()
            .map(|entry| (entry.key().clone(), Arc::clone(entry.value())))
            .collect()
    }
}

fn lock_record(entry: &Mutex<SessionRecord>) -> MutexGuard<'_, SessionRecord> {
    entry.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Leading characters of a session id, enough to correlate log lines.
pub(crate) fn short_id(session_id: &str) -> &str {
    session_id.get(..8).unwrap_or(session_id)
}

fn is_scalar(value: &Value) -> bool {
    !matches!(value, Value::Array(_) | Value::Object(_))
}
