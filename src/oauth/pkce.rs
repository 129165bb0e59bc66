//! PKCE (RFC 7636) and CSRF state generation.

use crate::cipher::random_token;
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use std::fmt;
use subtle::ConstantTimeEq;

/// Random bytes behind the `state` parameter (256 bits)
const STATE_BYTES: usize = 32;

/// Random bytes behind the code verifier; encodes to 86 chars, inside the 43..=128 range
const VERIFIER_BYTES: usize = 64;

pub fn generate_state() -> String {
    random_token(STATE_BYTES)
}

pub fn generate_code_verifier() -> String {
    random_token(VERIFIER_BYTES)
}

/// `base64url(sha256(code_verifier))` without padding (S256 method).
pub fn code_challenge(code_verifier: &str) -> String {
    URL_SAFE_NO_PAD.encode(Sha256::digest(code_verifier.as_bytes()))
}

/// Compares two state values in constant time.
pub fn states_match(received: &str, expected: &str) -> bool {
    received.as_bytes().ct_eq(expected.as_bytes()).into()
}

/// Handshake material produced by `begin()` and held by the caller until the
/// callback arrives. Must be consumed at most once.
#[derive(Clone)]
pub struct OAuthHandshakeState {
    pub state: String,
    pub code_verifier: String,
    pub code_challenge: String,
    pub created_at: DateTime<Utc>,
}

impl OAuthHandshakeState {
    pub fn generate() -> Self {
        let code_verifier = generate_code_verifier();
        Self {
            state: generate_state(),
            code_challenge: code_challenge(&code_verifier),
            code_verifier,
            created_at: Utc::now(),
        }
    }
}

impl fmt::Debug for OAuthHandshakeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OAuthHandshakeState")
            .field("code_challenge", &self.code_challenge)
            .field("created_at", &self.created_at)
            .finish_non_exhaustive()
    }
}
