//! Pending OAuth handshakes for the HTTP layer.
//!
//! The negotiator itself stores nothing. Request handlers park the handshake
//! produced by `begin()` here, keyed by session id, and take it back exactly
//! once when the callback arrives. A second callback for the same session finds
//! nothing to consume, which is how replayed callbacks are rejected.

use super::OAuthHandshakeState;
use chrono::{Duration, Utc};
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Single-use handshake store with expiration
#[derive(Clone)]
pub struct HandshakeStore {
    pending: Arc<Mutex<HashMap<String, OAuthHandshakeState>>>,
    expiry_duration: Duration,
}

impl HandshakeStore {
    /// Create a new handshake store
    ///
    /// # Arguments
    /// * `expiry_seconds` - How long a handshake remains valid (default: 600 = 10 minutes)
    pub fn new(expiry_seconds: i64) -> Self {
        Self {
            pending: Arc::new(Mutex::new(HashMap::new())),
            expiry_duration: Duration::seconds(expiry_seconds),
        }
    }

    /// Park a handshake for `session_id`, replacing any earlier one.
    pub fn put(&self, session_id: &str, handshake: OAuthHandshakeState) {
        self.lock().insert(session_id.to_string(), handshake);
    }

    /// Put a taken handshake back unless a newer one was parked meanwhile.
    ///
    /// Returns false when the slot was already occupied and `handshake` was dropped.
    pub fn restore(&self, session_id: &str, handshake: OAuthHandshakeState) -> bool {
        match self.lock().entry(session_id.to_string()) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                slot.insert(handshake);
                true
            }
        }
    }

    /// Remove and return the handshake for `session_id`.
    ///
    /// Returns None if there is none or it has expired. Either way the entry is
    /// gone afterwards (single-use).
    pub fn take(&self, session_id: &str) -> Option<OAuthHandshakeState> {
        let handshake = self.lock().remove(session_id)?;

        if Utc::now() - handshake.created_at > self.expiry_duration {
            return None;
        }

        Some(handshake)
    }

    /// Clean up expired handshakes (should be called periodically)
    pub fn cleanup_expired(&self) {
        let now = Utc::now();
        let expiry = self.expiry_duration;
        self.lock()
            .retain(|_, handshake| now - handshake.created_at <= expiry);
    }

    /// Number of parked handshakes
    pub fn count(&self) -> usize {
        self.lock().len()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, OAuthHandshakeState>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Background task to periodically clean up expired handshakes
pub async fn run_handshake_cleanup(store: HandshakeStore, interval_seconds: u64) {
    let mut interval = tokio::time::interval(tokio::time::Duration::from_secs(interval_seconds));

    loop {
        interval.tick().await;
        store.cleanup_expired();
        tracing::debug!(
            remaining = store.count(),
            "OAuth handshake cleanup complete"
        );
    }
}
