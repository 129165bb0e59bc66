//! Session lifecycle and per-session credential operations.

use super::{
    is_scalar, lock_record, short_id, EncryptionInfo, SessionEntry, SessionError, SessionPayload,
    SessionRecord, SessionStats, SessionStore, SessionSummary, SessionView, PROTECTED_FIELDS,
    SESSION_ID_BYTES,
};
use crate::cipher::{random_token, CipherProvider, CryptoError};
use crate::credentials::{EncryptedOAuthBundle, Provider};
use crate::oauth::TokenData;
use chrono::{DateTime, Duration, Utc};
use serde_json::{Map, Value};
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, info, warn};

impl SessionStore {
    /// Create a session for `user_id` and return its id.
    ///
    /// Expired sessions are purged first. If the user already holds the maximum
    /// number of live sessions, the oldest ones (smallest `created_at`) are
    /// evicted to make room.
    pub fn create(&self, user_id: &str, user_data: Map<String, Value>) -> Result<String, CryptoError> {
        let cipher = self.read_cipher();
        let _admission = self.admission.lock().unwrap_or_else(PoisonError::into_inner);

        let now = Utc::now();
        self.purge_expired(now);
        self.enforce_user_cap(user_id);

        let payload = SessionPayload {
            user_data,
            ..SessionPayload::default()
        };
        let encrypted_blob = payload.seal(&cipher)?;

        let session_id = random_token(SESSION_ID_BYTES);
        let expires_at = expiry_after(now, self.config.ttl_hours).unwrap_or(now);
        let record = SessionRecord {
            session_id: session_id.clone(),
            user_id: user_id.to_string(),
            created_at: now,
            expires_at: clamp_expiry(now, expires_at),
            encrypted_blob,
        };
        self.sessions
            .insert(session_id.clone(), Arc::new(Mutex::new(record)));

        info!(
            session_id = short_id(&session_id),
            user_id = %user_id,
            "Session created"
        );

        Ok(session_id)
    }

    /// Look up a live session.
    ///
    /// An expired session is deleted and reported as missing. So is one whose
    /// blob no longer decrypts.
    pub fn get(&self, session_id: &str) -> Option<SessionView> {
        let cipher = self.read_cipher();
        self.with_live_record(&cipher, session_id, |record, payload| {
            SessionView::new(record, payload)
        })
    }

    /// Merge `patch` into the session.
    ///
    /// A `preferences` object is merged into the preferences (scalar values
    /// only) and a `user_data` object into the user data. Any other key is
    /// stored as user data. Identity, expiry and secret fields are rejected;
    /// they have dedicated operations.
    ///
    /// Returns `Ok(false)` when the session does not exist.
    pub fn update(&self, session_id: &str, patch: Map<String, Value>) -> Result<bool, SessionError> {
        if let Some(field) = patch.keys().find(|key| PROTECTED_FIELDS.contains(&key.as_str())) {
            return Err(SessionError::ProtectedField(field.clone()));
        }
        for (key, value) in &patch {
            match (key.as_str(), value) {
                ("preferences", Value::Object(preferences)) => {
                    if let Some((name, _)) = preferences.iter().find(|(_, v)| !is_scalar(v)) {
                        return Err(SessionError::InvalidPatch(format!(
                            "preference '{}' must be a scalar",
                            name
                        )));
                    }
                }
                ("preferences", _) | ("user_data", _) if !value.is_object() => {
                    return Err(SessionError::InvalidPatch(format!(
                        "'{}' must be an object",
                        key
                    )));
                }
                _ => {}
            }
        }

        let updated = self.mutate(session_id, |_, payload| {
            for (key, value) in patch {
                match value {
                    Value::Object(preferences) if key == "preferences" => {
                        payload.preferences.extend(preferences)
                    }
                    Value::Object(user_data) if key == "user_data" => {
                        payload.user_data.extend(user_data)
                    }
                    value => {
                        payload.user_data.insert(key, value);
                    }
                }
            }
            Ok::<_, SessionError>(())
        })?;

        Ok(updated.is_some())
    }

    pub fn delete(&self, session_id: &str) -> bool {
        let removed = self.sessions.remove(session_id).is_some();
        if removed {
            info!(session_id = short_id(session_id), "Session deleted");
        }
        removed
    }

    /// Set `expires_at` to `hours` from now. Negative values expire the session.
    ///
    /// `expires_at` never moves to or before `created_at`.
    pub fn extend(&self, session_id: &str, hours: i64) -> bool {
        let cipher = self.read_cipher();
        self.with_live_record(&cipher, session_id, |record, _| {
            let now = Utc::now();
            let Some(expires_at) = expiry_after(now, hours) else {
                warn!(session_id = short_id(session_id), hours, "Session extension out of range");
                return false;
            };
            record.expires_at = clamp_expiry(record.created_at, expires_at);
            debug!(
                session_id = short_id(session_id),
                expires_at = %record.expires_at,
                "Session expiry updated"
            );
            true
        })
        .unwrap_or(false)
    }

    /// Encrypt and store `secret` for `provider`, replacing any previous one.
    ///
    /// Returns `Ok(false)` when the session does not exist. Encryption failures
    /// are propagated.
    pub fn store_api_key(
        &self,
        session_id: &str,
        provider: impl Into<Provider>,
        secret: &str,
    ) -> Result<bool, CryptoError> {
        let provider = provider.into();
        let stored = self.mutate(session_id, |cipher, payload| {
            payload.credentials.store(cipher, provider.clone(), secret)
        })?;

        if stored.is_some() {
            debug!(session_id = short_id(session_id), provider = %provider, "API key stored");
        }
        Ok(stored.is_some())
    }

    /// Store several credentials in one write: either all land or none do.
    ///
    /// Returns `Ok(false)` when the session does not exist.
    pub fn store_api_keys<'a, P>(
        &self,
        session_id: &str,
        keys: impl IntoIterator<Item = (P, &'a str)>,
    ) -> Result<bool, CryptoError>
    where
        P: Into<Provider>,
    {
        let keys: Vec<(Provider, &str)> = keys
            .into_iter()
            .map(|(provider, secret)| (provider.into(), secret))
            .collect();
        let stored = self.mutate(session_id, |cipher, payload| {
            for (provider, secret) in &keys {
                payload.credentials.store(cipher, provider.clone(), secret)?;
            }
            Ok::<_, CryptoError>(())
        })?;

        if stored.is_some() {
            debug!(session_id = short_id(session_id), count = keys.len(), "API keys stored");
        }
        Ok(stored.is_some())
    }

    /// Decrypted credential for `provider`.
    ///
    /// None when the session or credential is missing, the session expired, or
    /// the credential no longer decrypts.
    pub fn get_api_key(&self, session_id: &str, provider: impl Into<Provider>) -> Option<String> {
        let provider = provider.into();
        let cipher = self.read_cipher();
        self.with_live_record(&cipher, session_id, |_, payload| {
            payload.credentials.get(&cipher, &provider)
        })
        .flatten()
    }

    /// Returns true if a credential was removed.
    pub fn remove_api_key(
        &self,
        session_id: &str,
        provider: impl Into<Provider>,
    ) -> Result<bool, CryptoError> {
        let provider = provider.into();
        let removed = self.mutate(session_id, |_, payload| {
            Ok::<_, CryptoError>(payload.credentials.remove(&provider))
        })?;
        Ok(removed.unwrap_or(false))
    }

    /// Store OAuth token data with `access_token` and `refresh_token` sealed.
    pub fn store_oauth_data(&self, session_id: &str, token: &TokenData) -> Result<bool, CryptoError> {
        let stored = self.mutate(session_id, |cipher, payload| {
            payload.oauth = Some(EncryptedOAuthBundle::seal(cipher, token)?);
            Ok::<_, CryptoError>(())
        })?;

        if stored.is_some() {
            info!(
                session_id = short_id(session_id),
                workspace_id = %token.workspace_id,
                "OAuth data stored"
            );
        }
        Ok(stored.is_some())
    }

    pub fn get_oauth_data(&self, session_id: &str) -> Option<TokenData> {
        let cipher = self.read_cipher();
        self.with_live_record(&cipher, session_id, |_, payload| {
            let bundle = payload.oauth?;
            match bundle.open(&cipher) {
                Ok(token) => Some(token),
                Err(e) => {
                    warn!(session_id = short_id(session_id), error = %e, "Stored OAuth data is unreadable");
                    None
                }
            }
        })
        .flatten()
    }

    /// Returns true if OAuth data was removed.
    pub fn remove_oauth_data(&self, session_id: &str) -> Result<bool, CryptoError> {
        let removed = self.mutate(session_id, |_, payload| {
            Ok::<_, CryptoError>(payload.oauth.take().is_some())
        })?;
        Ok(removed.unwrap_or(false))
    }

    /// Store a scalar preference such as the chosen AI model.
    pub fn store_preference(
        &self,
        session_id: &str,
        key: &str,
        value: Value,
    ) -> Result<bool, SessionError> {
        if !is_scalar(&value) {
            return Err(SessionError::InvalidPatch(format!(
                "preference '{}' must be a scalar",
                key
            )));
        }

        let stored = self.mutate(session_id, |_, payload| {
            payload.preferences.insert(key.to_string(), value);
            Ok::<_, SessionError>(())
        })?;
        Ok(stored.is_some())
    }

    pub fn get_preference(&self, session_id: &str, key: &str) -> Option<Value> {
        let cipher = self.read_cipher();
        self.with_live_record(&cipher, session_id, |_, mut payload| {
            payload.preferences.remove(key)
        })
        .flatten()
    }

    /// Counts by expiry. Read-only: nothing is evicted.
    pub fn stats(&self) -> SessionStats {
        let now = Utc::now();
        let total = self.sessions.len();
        let expired = self
            .snapshot()
            .iter()
            .filter(|(_, entry)| lock_record(entry).is_expired(now))
            .count();

        SessionStats {
            total,
            active: total.saturating_sub(expired),
            expired,
        }
    }

    /// Live sessions of `user_id`, oldest first. Read-only.
    pub fn user_sessions(&self, user_id: &str) -> Vec<SessionSummary> {
        let now = Utc::now();
        let mut sessions: Vec<SessionSummary> = self
            .snapshot()
            .iter()
            .filter_map(|(_, entry)| {
                let record = lock_record(entry);
                (record.user_id == user_id && !record.is_expired(now)).then(|| SessionSummary {
                    session_id: record.session_id.clone(),
                    created_at: record.created_at,
                    expires_at: record.expires_at,
                })
            })
            .collect();
        sessions.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        sessions
    }

    pub fn validate_key(&self) -> bool {
        self.read_cipher().validate()
    }

    pub fn encryption_info(&self) -> EncryptionInfo {
        let key_valid = self.validate_key();
        let entries = self.snapshot();
        let encrypted_sessions = entries
            .iter()
            .filter(|(_, entry)| !lock_record(entry).encrypted_blob.is_empty())
            .count();

        EncryptionInfo {
            key_valid,
            total_sessions: entries.len(),
            encrypted_sessions,
            key_rotation_available: true,
        }
    }

    /// Delete every expired session. Returns how many were removed.
    pub fn sweep_expired(&self) -> usize {
        let removed = self.purge_expired(Utc::now());
        if removed > 0 {
            info!(removed, "Expired sessions swept");
        }
        removed
    }

    /// Run `f` against a live, decryptable session under its lock.
    ///
    /// Expired or undecryptable sessions are removed and yield None.
    fn with_live_record<T>(
        &self,
        cipher: &CipherProvider,
        session_id: &str,
        f: impl FnOnce(&mut SessionRecord, SessionPayload) -> T,
    ) -> Option<T> {
        let entry = self.entry(session_id)?;
        let mut record = lock_record(&entry);

        if record.is_expired(Utc::now()) {
            drop(record);
            self.discard(session_id, &entry, "expired");
            return None;
        }

        let payload = match record.open(cipher) {
            Ok(payload) => payload,
            Err(e) => {
                drop(record);
                warn!(session_id = short_id(session_id), error = %e, "Session blob unreadable");
                self.discard(session_id, &entry, "corrupted");
                return None;
            }
        };

        Some(f(&mut record, payload))
    }

    /// Apply `f` to the decrypted payload, then reseal and commit it.
    ///
    /// Nothing is written unless `f` and the reseal both succeed.
    fn mutate<T, E>(
        &self,
        session_id: &str,
        f: impl FnOnce(&CipherProvider, &mut SessionPayload) -> Result<T, E>,
    ) -> Result<Option<T>, E>
    where
        E: From<CryptoError>,
    {
        let cipher = self.read_cipher();
        self.with_live_record(&cipher, session_id, |record, mut payload| {
            let value = f(&cipher, &mut payload)?;
            record.encrypted_blob = payload.seal(&cipher)?;
            Ok::<T, E>(value)
        })
        .transpose()
    }

    /// Remove `entry` unless it has already been replaced or removed.
    fn discard(&self, session_id: &str, entry: &SessionEntry, reason: &str) {
        if self
            .sessions
            .remove_if(session_id, |_, current| Arc::ptr_eq(current, entry))
            .is_some()
        {
            debug!(session_id = short_id(session_id), reason, "Session discarded");
        }
    }

    fn purge_expired(&self, now: DateTime<Utc>) -> usize {
        let expired: Vec<String> = self
            .snapshot()
            .into_iter()
            .filter(|(_, entry)| lock_record(entry).is_expired(now))
            .map(|(session_id, _)| session_id)
            .collect();

        expired
            .iter()
            .filter(|session_id| {
                self.sessions
                    .remove_if(session_id.as_str(), |_, entry| lock_record(entry).is_expired(now))
                    .is_some()
            })
            .count()
    }

    /// Evict the user's oldest sessions until one more fits under the cap.
    fn enforce_user_cap(&self, user_id: &str) {
        let max = self.config.max_sessions_per_user.max(1);
        let mut owned: Vec<(DateTime<Utc>, String)> = self
            .snapshot()
            .iter()
            .filter_map(|(session_id, entry)| {
                let record = lock_record(entry);
                (record.user_id == user_id).then(|| (record.created_at, session_id.clone()))
            })
            .collect();

        if owned.len() < max {
            return;
        }

        owned.sort();
        let excess = owned.len() + 1 - max;
        for (_, session_id) in owned.into_iter().take(excess) {
            self.sessions.remove(&session_id);
            info!(
                session_id = short_id(&session_id),
                user_id = %user_id,
                "Evicted oldest session (per-user limit)"
            );
        }
    }
}

fn expiry_after(now: DateTime<Utc>, hours: i64) -> Option<DateTime<Utc>> {
    Duration::try_hours(hours).and_then(|ttl| now.checked_add_signed(ttl))
}

fn clamp_expiry(created_at: DateTime<Utc>, expires_at: DateTime<Utc>) -> DateTime<Utc> {
    let floor = created_at + Duration::nanoseconds(1);
    expires_at.max(floor)
}

/// Periodically sweep expired sessions. Lookups already self-clean, so this only
/// bounds memory held by sessions nobody asks for again.
pub async fn run_session_sweeper(store: Arc<SessionStore>, interval_seconds: u64) {
    let mut interval = tokio::time::interval(tokio::time::Duration::from_secs(interval_seconds));

    loop {
        interval.tick().await;
        let removed = store.sweep_expired();
        debug!(removed, remaining = store.sessions.len(), "Session sweep complete");
    }
}
