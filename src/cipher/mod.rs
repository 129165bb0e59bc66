//! AES-256-GCM encryption for session payloads and stored secrets.
//!
//! Every message is sealed with a fresh random 96-bit nonce. The sealed form is
//! a single byte string laid out as `nonce || ciphertext || tag`, so callers can
//! store it as one opaque value.
//!
//! Keys are either imported (base64, 32 bytes) or derived with PBKDF2-HMAC-SHA256
//! over random input material and a random salt, so two providers never share a
//! key unless one was explicitly imported.

use aes_gcm::{
    aead::{Aead, AeadCore, KeyInit},
    Aes256Gcm, Key, Nonce,
};
use base64::{
    engine::general_purpose::{STANDARD as BASE64, URL_SAFE_NO_PAD},
    Engine,
};
use rand::{rngs::OsRng, RngCore};
use sha2::Sha256;
use std::fmt;
use thiserror::Error;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Size of the encryption key in bytes (256 bits)
pub const KEY_SIZE: usize = 32;

/// PBKDF2 rounds used when deriving a fresh key
pub const PBKDF2_ITERATIONS: u32 = 100_000;

/// Size of the nonce in bytes (96 bits, standard for GCM)
const NONCE_SIZE: usize = 12;

/// Size of the GCM authentication tag in bytes
const TAG_SIZE: usize = 16;

const SALT_SIZE: usize = 16;

/// Canned payload used by [`CipherProvider::validate`]
const PROBE_PAYLOAD: &[u8] = br#"{"test":"data"}"#;

/// Encryption and decryption failures.
///
/// A decryption error always means "data unreadable": wrong key, tampered bytes
/// or malformed input. It never yields a different plaintext.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CryptoError {
    #[error("invalid encryption key: {0}")]
    InvalidKey(String),

    #[error("encryption failed")]
    Encrypt,

    #[error("decryption failed (wrong key or corrupted data)")]
    Decrypt,

    #[error("ciphertext too short: {0} bytes")]
    Truncated(usize),

    #[error("decrypted data is not valid UTF-8")]
    InvalidUtf8,

    #[error("payload encoding failed: {0}")]
    Encoding(String),
}

/// A 256-bit symmetric key. Key material is wiped on drop.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct CipherKey {
    bytes: [u8; KEY_SIZE],
}

impl CipherKey {
    /// Derives a fresh key with PBKDF2-HMAC-SHA256 over random input material.
    pub fn derive() -> Self {
        let mut material = [0u8; KEY_SIZE];
        let mut salt = [0u8; SALT_SIZE];
        OsRng.fill_bytes(&mut material);
        OsRng.fill_bytes(&mut salt);

        let mut bytes = [0u8; KEY_SIZE];
        pbkdf2::pbkdf2_hmac::<Sha256>(&material, &salt, PBKDF2_ITERATIONS, &mut bytes);
        material.zeroize();

        Self { bytes }
    }

    pub fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        Self { bytes }
    }

    /// Imports a base64-encoded key.
    ///
    /// # Returns
    /// * `Ok(CipherKey)` - Decoded 32-byte key
    /// * `Err(CryptoError::InvalidKey)` - If the key is invalid base64 or the wrong length
    pub fn from_base64(key_base64: &str) -> Result<Self, CryptoError> {
        let mut decoded = BASE64
            .decode(key_base64.trim())
            .map_err(|e| CryptoError::InvalidKey(format!("not valid base64: {}", e)))?;

        if decoded.len() != KEY_SIZE {
            let len = decoded.len();
            decoded.zeroize();
            return Err(CryptoError::InvalidKey(format!(
                "key must be {} bytes (256 bits), got {} bytes",
                KEY_SIZE, len
            )));
        }

        let mut bytes = [0u8; KEY_SIZE];
        bytes.copy_from_slice(&decoded);
        decoded.zeroize();
        Ok(Self { bytes })
    }

    /// Exports the key as base64 (suitable for `TEMPLATE_MAKER_ENCRYPTION_KEY`).
    pub fn to_base64(&self) -> String {
        BASE64.encode(self.bytes)
    }
}

impl fmt::Debug for CipherKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("CipherKey(<redacted>)")
    }
}

/// Holds the active key and seals/opens opaque byte payloads with it.
#[derive(Clone)]
pub struct CipherProvider {
    key: CipherKey,
    cipher: Aes256Gcm,
}

impl CipherProvider {
    /// Derives a fresh key. See [`CipherKey::derive`].
    pub fn generate_key() -> CipherKey {
        CipherKey::derive()
    }

    /// Creates a provider with a freshly derived key.
    pub fn generate() -> Self {
        Self::new(Self::generate_key())
    }

    pub fn new(key: CipherKey) -> Self {
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key.bytes));
        Self { key, cipher }
    }

    /// Creates a provider from a base64-encoded key, failing closed on a bad key.
    pub fn from_base64(key_base64: &str) -> Result<Self, CryptoError> {
        CipherKey::from_base64(key_base64).map(Self::new)
    }

    pub fn key(&self) -> &CipherKey {
        &self.key
    }

    /// Encrypts `plaintext` under a random nonce.
    ///
    /// # Returns
    /// * `Ok(Vec<u8>)` - `nonce || ciphertext || tag`
    /// * `Err(CryptoError::Encrypt)` - If the AEAD refuses the input
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);

        let ciphertext = self
            .cipher
            .encrypt(&nonce, plaintext)
            .map_err(|_| CryptoError::Encrypt)?;

        let mut sealed = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
        sealed.extend_from_slice(&nonce);
        sealed.extend_from_slice(&ciphertext);
        Ok(sealed)
    }

    /// Decrypts a value produced by [`CipherProvider::encrypt`].
    ///
    /// Fails on tampering, a different key, or input too short to hold a nonce
    /// and tag.
    pub fn decrypt(&self, sealed: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if sealed.len() < NONCE_SIZE + TAG_SIZE {
            return Err(CryptoError::Truncated(sealed.len()));
        }

        let (nonce, ciphertext) = sealed.split_at(NONCE_SIZE);
        self.cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| CryptoError::Decrypt)
    }

    pub fn encrypt_str(&self, plaintext: &str) -> Result<Vec<u8>, CryptoError> {
        self.encrypt(plaintext.as_bytes())
    }

    pub fn decrypt_to_string(&self, sealed: &[u8]) -> Result<String, CryptoError> {
        let plaintext = self.decrypt(sealed)?;
        String::from_utf8(plaintext).map_err(|_| CryptoError::InvalidUtf8)
    }

    /// Round-trips a canned payload. Used for health checks; never errors.
    pub fn validate(&self) -> bool {
        self.encrypt(PROBE_PAYLOAD)
            .and_then(|sealed| self.decrypt(&sealed))
            .map(|plaintext| plaintext == PROBE_PAYLOAD)
            .unwrap_or(false)
    }
}

impl fmt::Debug for CipherProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CipherProvider").finish_non_exhaustive()
    }
}

/// Generates a URL-safe random token from `num_bytes` bytes of OS entropy.
pub fn random_token(num_bytes: usize) -> String {
    let mut bytes = vec![0u8; num_bytes];
    OsRng.fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(&bytes)
}

/// Serde adapter storing ciphertext bytes as base64 strings.
pub(crate) mod base64_bytes {
    use super::BASE64;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&BASE64.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        BASE64.decode(encoded).map_err(serde::de::Error::custom)
    }

    pub mod option {
        use super::BASE64;
        use base64::Engine;
        use serde::{Deserialize, Deserializer, Serializer};

        pub fn serialize<S: Serializer>(
            bytes: &Option<Vec<u8>>,
            serializer: S,
        ) -> Result<S::Ok, S::Error> {
            match bytes {
                Some(bytes) => serializer.serialize_some(&BASE64.encode(bytes)),
                None => serializer.serialize_none(),
            }
        }

        pub fn deserialize<'de, D: Deserializer<'de>>(
            deserializer: D,
        ) -> Result<Option<Vec<u8>>, D::Error> {
            Option::<String>::deserialize(deserializer)?
                .map(|encoded| BASE64.decode(encoded).map_err(serde::de::Error::custom))
                .transpose()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_provider() -> CipherProvider {
        CipherProvider::new(CipherKey::from_bytes([7u8; KEY_SIZE]))
    }

    #[test]
    fn test_key_import() {
        // Valid 32-byte key (base64-encoded)
        let valid_key = BASE64.encode([0u8; 32]);
        assert!(CipherKey::from_base64(&valid_key).is_ok());

        // Too short
        let short_key = BASE64.encode([0u8; 16]);
        assert!(matches!(
            CipherKey::from_base64(&short_key),
            Err(CryptoError::InvalidKey(_))
        ));

        // Too long
        let long_key = BASE64.encode([0u8; 64]);
        assert!(CipherKey::from_base64(&long_key).is_err());

        // Invalid base64
        assert!(CipherKey::from_base64("not-valid-base64!@#$").is_err());
    }

    #[test]
    fn test_key_export_round_trip() {
        let key = CipherKey::from_bytes([42u8; KEY_SIZE]);
        let exported = key.to_base64();

        let imported = CipherProvider::from_base64(&exported).unwrap();
        let sealed = CipherProvider::new(key).encrypt(b"payload").unwrap();
        assert_eq!(imported.decrypt(&sealed).unwrap(), b"payload");
    }

    #[test]
    fn test_derived_keys_are_distinct() {
        let a = CipherProvider::generate();
        let b = CipherProvider::generate();

        assert_ne!(a.key().to_base64(), b.key().to_base64());

        let sealed = a.encrypt(b"secret").unwrap();
        assert!(b.decrypt(&sealed).is_err());
    }

    #[test]
    fn test_encrypt_decrypt_roundtrip() {
        let provider = test_provider();

        for plaintext in ["", "x", "my-secret-access-token-12345", "ünïcødé ✓"] {
            let sealed = provider.encrypt_str(plaintext).unwrap();
            assert_ne!(sealed, plaintext.as_bytes());
            assert_eq!(provider.decrypt_to_string(&sealed).unwrap(), plaintext);
        }
    }

    #[test]
    fn test_different_nonces() {
        let provider = test_provider();

        let sealed1 = provider.encrypt(b"same-plaintext").unwrap();
        let sealed2 = provider.encrypt(b"same-plaintext").unwrap();

        // Nonce prefixes differ, so do the ciphertexts
        assert_ne!(sealed1[..NONCE_SIZE], sealed2[..NONCE_SIZE]);
        assert_ne!(sealed1, sealed2);
    }

    #[test]
    fn test_wrong_key_fails() {
        let key1 = CipherProvider::new(CipherKey::from_bytes([0u8; 32]));
        let key2 = CipherProvider::new(CipherKey::from_bytes([1u8; 32]));

        let sealed = key1.encrypt(b"secret").unwrap();
        assert_eq!(key2.decrypt(&sealed), Err(CryptoError::Decrypt));
    }

    #[test]
    fn test_every_bit_flip_is_detected() {
        let provider = test_provider();
        let sealed = provider.encrypt(b"sk-or-v1-XYZ").unwrap();

        for index in 0..sealed.len() {
            for bit in 0..8 {
                let mut tampered = sealed.clone();
                tampered[index] ^= 1 << bit;
                assert_eq!(
                    provider.decrypt(&tampered),
                    Err(CryptoError::Decrypt),
                    "flip of byte {} bit {} was not detected",
                    index,
                    bit
                );
            }
        }
    }

    #[test]
    fn test_truncated_input_fails() {
        let provider = test_provider();
        let sealed = provider.encrypt(b"secret").unwrap();

        assert_eq!(provider.decrypt(&[]), Err(CryptoError::Truncated(0)));
        assert!(provider.decrypt(&sealed[..NONCE_SIZE + TAG_SIZE - 1]).is_err());
        assert!(provider.decrypt(&sealed[..sealed.len() - 1]).is_err());
    }

    #[test]
    fn test_validate() {
        assert!(test_provider().validate());
        assert!(CipherProvider::generate().validate());
    }

    #[test]
    fn test_random_token_is_url_safe() {
        let token = random_token(32);
        // 32 bytes -> 43 base64 chars without padding
        assert_eq!(token.len(), 43);
        assert!(token
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_'));
        assert_ne!(token, random_token(32));
    }

    #[test]
    fn test_debug_redacts_key() {
        let key = CipherKey::from_bytes([9u8; KEY_SIZE]);
        let rendered = format!("{:?}", key);
        assert!(!rendered.contains(&key.to_base64()));
        assert!(rendered.contains("redacted"));
    }
}
