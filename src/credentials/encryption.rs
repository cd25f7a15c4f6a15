//! AES-256-GCM sealing of cached ALM passwords.
//!
//! The master key is 32 bytes, base64-encoded, and only ever held in memory.

use aes_gcm::{
    aead::{Aead, AeadCore, KeyInit, OsRng},
    Aes256Gcm, Nonce,
};
use anyhow::{anyhow, Context, Result};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};

use super::SealedSecret;

const KEY_SIZE: usize = 32;

/// 96-bit GCM nonce
const NONCE_SIZE: usize = 12;

/// Opaque encryption capability used by the session layer.
///
/// The session manager never sees key material, only this trait.
pub trait SecretCipher: Send + Sync {
    fn seal(&self, plaintext: &str) -> Result<SealedSecret>;
    fn open(&self, sealed: &SealedSecret) -> Result<String>;
}

/// Decodes a base64 master key and checks it is 256 bits.
pub fn validate_key(key_base64: &str) -> Result<Vec<u8>> {
    let key_bytes = BASE64
        .decode(key_base64)
        .context("Failed to decode base64 encryption key")?;

    if key_bytes.len() != KEY_SIZE {
        return Err(anyhow!(
            "Encryption key must be {} bytes (256 bits), got {} bytes",
            KEY_SIZE,
            key_bytes.len()
        ));
    }

    Ok(key_bytes)
}

/// [`SecretCipher`] backed by AES-256-GCM with a fresh random nonce per seal.
pub struct AesGcmCipher {
    cipher: Aes256Gcm,
}

impl AesGcmCipher {
    /// # Arguments
    /// * `key_base64` - Base64-encoded 32-byte master key
    pub fn from_base64_key(key_base64: &str) -> Result<Self> {
        let key = validate_key(key_base64)?;
        let cipher = Aes256Gcm::new_from_slice(&key)
            .map_err(|e| anyhow!("Failed to create cipher: {}", e))?;
        Ok(Self { cipher })
    }
}

impl SecretCipher for AesGcmCipher {
    fn seal(&self, plaintext: &str) -> Result<SealedSecret> {
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let ciphertext = self
            .cipher
            .encrypt(&nonce, plaintext.as_bytes())
            .map_err(|e| anyhow!("Encryption failed: {}", e))?;

        Ok(SealedSecret {
            ciphertext: BASE64.encode(&ciphertext),
            nonce: BASE64.encode(nonce),
        })
    }

    fn open(&self, sealed: &SealedSecret) -> Result<String> {
        let ciphertext = BASE64
            .decode(&sealed.ciphertext)
            .context("Failed to decode ciphertext")?;
        let nonce_bytes = BASE64
            .decode(&sealed.nonce)
            .context("Failed to decode nonce")?;

        if nonce_bytes.len() != NONCE_SIZE {
            return Err(anyhow!(
                "Invalid nonce size: expected {}, got {}",
                NONCE_SIZE,
                nonce_bytes.len()
            ));
        }

        let plaintext = self
            .cipher
            .decrypt(Nonce::from_slice(&nonce_bytes), ciphertext.as_ref())
            .map_err(|e| anyhow!("Decryption failed (wrong key or corrupted data): {}", e))?;

        String::from_utf8(plaintext).context("Decrypted secret is not valid UTF-8")
    }
}
