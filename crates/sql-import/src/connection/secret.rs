//! Credential encryption at rest.
//!
//! Passwords are sealed with AES-256-GCM and stored as base64 of
//! `nonce || ciphertext`. The key is the SHA-256 of a passphrase taken from
//! the environment, or a random per-process key when none is set.

use std::fmt;

use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Nonce,
};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use rand::Rng;
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::error::{ImportError, Result};

const NONCE_LEN: usize = 12;

/// Seals and opens connection passwords.
#[derive(Clone)]
pub struct SecretCipher {
    key: [u8; 32],
}

impl fmt::Debug for SecretCipher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecretCipher")
            .field("key", &"[REDACTED]")
            .finish()
    }
}

impl SecretCipher {
    /// Derive the key from a passphrase.
    pub fn from_passphrase(passphrase: &str) -> Self {
        let digest = Sha256::digest(passphrase.as_bytes());
        let mut key = [0u8; 32];
        key.copy_from_slice(&digest);
        Self { key }
    }

    /// Random key valid for this process only.
    pub fn ephemeral() -> Self {
        let mut key = [0u8; 32];
        rand::thread_rng().fill(&mut key[..]);
        Self { key }
    }

    /// Use the passphrase in `var` when set, an ephemeral key otherwise.
    pub fn from_env(var: &str) -> Self {
        match std::env::var(var) {
            Ok(passphrase) if !passphrase.is_empty() => Self::from_passphrase(&passphrase),
            _ => {
                debug!("{} not set, using an ephemeral credential key", var);
                Self::ephemeral()
            }
        }
    }

    /// Encrypt a password. The empty password stays empty.
    pub fn seal(&self, plaintext: &str) -> Result<String> {
        if plaintext.is_empty() {
            return Ok(String::new());
        }

        let cipher = Aes256Gcm::new_from_slice(&self.key)
            .map_err(|e| ImportError::Crypto(format!("Failed to create cipher: {}", e)))?;

        let nonce_bytes: [u8; NONCE_LEN] = rand::thread_rng().gen();
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = cipher
            .encrypt(nonce, plaintext.as_bytes())
            .map_err(|e| ImportError::Crypto(format!("Encryption failed: {}", e)))?;

        let mut combined = nonce_bytes.to_vec();
        combined.extend(ciphertext);
        Ok(BASE64.encode(combined))
    }

    /// Decrypt a password sealed with the same key.
    pub fn open(&self, sealed: &str) -> Result<String> {
        if sealed.is_empty() {
            return Ok(String::new());
        }

        let combined = BASE64
            .decode(sealed)
            .map_err(|e| ImportError::Crypto(format!("Base64 decode failed: {}", e)))?;
        if combined.len() < NONCE_LEN {
            return Err(ImportError::Crypto("Invalid encrypted data".to_string()));
        }

        let cipher = Aes256Gcm::new_from_slice(&self.key)
            .map_err(|e| ImportError::Crypto(format!("Failed to create cipher: {}", e)))?;

        let (nonce, ciphertext) = combined.split_at(NONCE_LEN);
        let plaintext = cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| ImportError::Crypto("Decryption failed (wrong key?)".to_string()))?;

        String::from_utf8(plaintext)
            .map_err(|e| ImportError::Crypto(format!("UTF-8 conversion failed: {}", e)))
    }
}
