//! Re-encryption of every live session under a new key.
//!
//! Rotation holds the cipher write lock for its whole duration, which keeps all
//! other session operations out. Every record is decrypted and resealed into a
//! staging area first; records are only overwritten, and the key only swapped,
//! once every session has been staged. Any failure leaves the store untouched
//! under the old key.

use super::{lock_record, short_id, RotationError, SessionStore};
use crate::cipher::{CipherKey, CipherProvider};
use chrono::Utc;
use tracing::{error, info};

impl SessionStore {
    /// Derive a fresh key and move every session onto it.
    pub fn rotate(&self) -> Result<(), RotationError> {
        // PBKDF2 runs before any lock is taken
        let key = CipherKey::derive();
        self.rotate_to(key)
    }

    /// Move every session onto `key`.
    pub fn rotate_to(&self, key: CipherKey) -> Result<(), RotationError> {
        let next = CipherProvider::new(key);
        let mut cipher = self.write_cipher();

        let entries = self.snapshot();
        let mut records: Vec<_> = entries
            .iter()
            .map(|(session_id, entry)| (session_id, lock_record(entry)))
            .collect();

        let now = Utc::now();
        let mut staged = Vec::with_capacity(records.len());
        for (index, (session_id, record)) in records.iter().enumerate() {
            // Expired sessions are unreachable and get no new blob
            if record.is_expired(now) {
                continue;
            }

            let payload = record.open(&cipher).map_err(|e| {
                error!(
                    session_id = short_id(session_id),
                    error = %e,
                    "Key rotation aborted: session does not decrypt"
                );
                RotationError::Undecryptable {
                    session_id: session_id.to_string(),
                }
            })?;

            let payload = payload.reseal(&cipher, &next)?;
            staged.push((index, payload.seal(&next)?));
        }

        let rotated = staged.len();
        for (index, blob) in staged {
            records[index].1.encrypted_blob = blob;
        }
        *cipher = next;

        info!(sessions = rotated, "Encryption key rotated");
        Ok(())
    }
}
