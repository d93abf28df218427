//! AES-256-GCM sealing for source secrets at rest.
//!
//! Source passwords, API tokens and service-account keys are sealed before
//! they reach the source store. A sealed value is `base64(nonce).base64(ciphertext)`
//! so the nonce travels with the data.

use aes_gcm::{
    aead::{Aead, AeadCore, KeyInit, OsRng},
    Aes256Gcm, Nonce,
};
use anyhow::{anyhow, bail, Context, Result};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};

const KEY_SIZE: usize = 32;
const NONCE_SIZE: usize = 12;

/// Seals and opens secrets with one master key held in memory.
#[derive(Clone)]
pub struct SecretCipher {
    cipher: Aes256Gcm,
}

impl std::fmt::Debug for SecretCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SecretCipher { .. }")
    }
}

impl SecretCipher {
    /// Builds a cipher from a base64-encoded 32-byte master key.
    pub fn from_base64_key(key_base64: &str) -> Result<Self> {
        let key_bytes = BASE64
            .decode(key_base64.trim())
            .context("Failed to decode base64 encryption key")?;
        if key_bytes.len() != KEY_SIZE {
            bail!(
                "Encryption key must be {} bytes (256 bits), got {} bytes",
                KEY_SIZE,
                key_bytes.len()
            );
        }
        let cipher = Aes256Gcm::new_from_slice(&key_bytes)
            .map_err(|e| anyhow!("Failed to create cipher: {}", e))?;
        Ok(Self { cipher })
    }

    /// Seals `plaintext` under a fresh random nonce. Empty input stays empty.
    pub fn seal(&self, plaintext: &str) -> Result<String> {
        if plaintext.is_empty() {
            return Ok(String::new());
        }
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let ciphertext = self
            .cipher
            .encrypt(&nonce, plaintext.as_bytes())
            .map_err(|e| anyhow!("Encryption failed: {}", e))?;
        Ok(format!("{}.{}", BASE64.encode(nonce), BASE64.encode(ciphertext)))
    }

    /// Opens a value produced by [`SecretCipher::seal`].
    pub fn open(&self, sealed: &str) -> Result<String> {
        if sealed.is_empty() {
            return Ok(String::new());
        }
        let (nonce_b64, ciphertext_b64) = sealed
            .split_once('.')
            .context("Sealed secret is missing its nonce")?;
        let nonce_bytes = BASE64.decode(nonce_b64).context("Failed to decode nonce")?;
        if nonce_bytes.len() != NONCE_SIZE {
            bail!(
                "Invalid nonce size: expected {}, got {}",
                NONCE_SIZE,
                nonce_bytes.len()
            );
        }
        let ciphertext = BASE64
            .decode(ciphertext_b64)
            .context("Failed to decode ciphertext")?;
        let plaintext = self
            .cipher
            .decrypt(Nonce::from_slice(&nonce_bytes), ciphertext.as_ref())
            .map_err(|e| anyhow!("Decryption failed (wrong key or corrupted data): {}", e))?;
        String::from_utf8(plaintext).context("Decrypted secret is not valid UTF-8")
    }
}
