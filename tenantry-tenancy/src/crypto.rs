//! Envelope encryption for tenant credentials.
//!
//! Every sealed secret gets its own random data key. The secret is encrypted
//! with AES-256-GCM under that data key, and the data key is encrypted
//! (wrapped) under the master key. Only the wrapped form is persisted.

use aes_gcm::aead::rand_core::RngCore;
use aes_gcm::aead::{Aead, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use thiserror::Error;

const KEY_LEN: usize = 32;
const NONCE_LEN: usize = 12;

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("Invalid master key: {0}")]
    InvalidKey(String),

    #[error("Secret was sealed with key {found}, cipher holds {expected}")]
    KeyMismatch { expected: String, found: String },

    #[error("Encryption failed: {0}")]
    Encrypt(String),

    #[error("Decryption failed: {0}")]
    Decrypt(String),
}

impl From<CryptoError> for crate::TenantError {
    fn from(err: CryptoError) -> Self {
        crate::TenantError::Secret(err.to_string())
    }
}

/// Persisted form of a secret. Base64 fields, nonce prepended.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SealedSecret {
    /// Fingerprint of the master key that wrapped the data key
    pub key_id: String,
    pub wrapped_key: String,
    pub ciphertext: String,
}

impl fmt::Debug for SealedSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SealedSecret")
            .field("key_id", &self.key_id)
            .finish_non_exhaustive()
    }
}

/// Seals and opens tenant secrets under a master key.
pub struct SecretCipher {
    master: Aes256Gcm,
    key_id: String,
}

impl SecretCipher {
    pub fn new(master_key: &[u8]) -> Result<Self, CryptoError> {
        if master_key.len() != KEY_LEN {
            return Err(CryptoError::InvalidKey(format!(
                "expected {} bytes, got {}",
                KEY_LEN,
                master_key.len()
            )));
        }
        let fingerprint = Sha256::digest(master_key);
        Ok(Self {
            master: Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(master_key)),
            key_id: hex::encode(&fingerprint[..8]),
        })
    }

    pub fn from_base64(encoded: &SecretString) -> Result<Self, CryptoError> {
        let bytes = STANDARD
            .decode(encoded.expose_secret().trim())
            .map_err(|e| CryptoError::InvalidKey(e.to_string()))?;
        Self::new(&bytes)
    }

    /// Cipher with a random master key. Sealed secrets do not survive a
    /// restart, so this is only suitable for the in-memory store.
    pub fn ephemeral() -> Self {
        let mut key = [0u8; KEY_LEN];
        OsRng.fill_bytes(&mut key);
        Self {
            master: Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key)),
            key_id: hex::encode(&Sha256::digest(key)[..8]),
        }
    }

    pub fn key_id(&self) -> &str {
        &self.key_id
    }

    pub fn seal(&self, secret: &SecretString) -> Result<SealedSecret, CryptoError> {
        let mut data_key = [0u8; KEY_LEN];
        OsRng.fill_bytes(&mut data_key);
        let data_cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&data_key));

        let ciphertext = encrypt(&data_cipher, secret.expose_secret().as_bytes())?;
        let wrapped_key = encrypt(&self.master, &data_key)?;

        Ok(SealedSecret {
            key_id: self.key_id.clone(),
            wrapped_key,
            ciphertext,
        })
    }

    pub fn open(&self, sealed: &SealedSecret) -> Result<SecretString, CryptoError> {
        if sealed.key_id != self.key_id {
            return Err(CryptoError::KeyMismatch {
                expected: self.key_id.clone(),
                found: sealed.key_id.clone(),
            });
        }

        let data_key = decrypt(&self.master, &sealed.wrapped_key)?;
        if data_key.len() != KEY_LEN {
            return Err(CryptoError::Decrypt("wrapped key has wrong length".to_string()));
        }
        let data_cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&data_key));
        let plaintext = decrypt(&data_cipher, &sealed.ciphertext)?;

        String::from_utf8(plaintext)
            .map(SecretString::from)
            .map_err(|_| CryptoError::Decrypt("secret is not valid UTF-8".to_string()))
    }
}

fn encrypt(cipher: &Aes256Gcm, plaintext: &[u8]) -> Result<String, CryptoError> {
    let mut nonce_bytes = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce_bytes);
    let nonce = Nonce::from_slice(&nonce_bytes);

    let ciphertext = cipher
        .encrypt(nonce, plaintext)
        .map_err(|e| CryptoError::Encrypt(format!("AES-GCM encrypt: {e}")))?;

    let mut combined = Vec::with_capacity(NONCE_LEN + ciphertext.len());
    combined.extend_from_slice(&nonce_bytes);
    combined.extend_from_slice(&ciphertext);
    Ok(STANDARD.encode(combined))
}

fn decrypt(cipher: &Aes256Gcm, encoded: &str) -> Result<Vec<u8>, CryptoError> {
    let combined = STANDARD
        .decode(encoded)
        .map_err(|e| CryptoError::Decrypt(format!("base64: {e}")))?;
    if combined.len() <= NONCE_LEN {
        return Err(CryptoError::Decrypt("ciphertext too short".to_string()));
    }

    let (nonce_bytes, ciphertext) = combined.split_at(NONCE_LEN);
    cipher
        .decrypt(Nonce::from_slice(nonce_bytes), ciphertext)
        .map_err(|e| CryptoError::Decrypt(format!("AES-GCM decrypt: {e}")))
}
