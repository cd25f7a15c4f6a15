//! Encrypted cache of ALM passwords, used for silent re-authentication.
//!
//! ```text
//!   SessionManager ──seal/open──▶ SecretCipher (AES-256-GCM)
//!         │
//!         └──store/get/delete──▶ CredentialStore (SQLite, keyed by owner)
//! ```
//!
//! Only the sealed password is persisted. Session cookies never leave memory.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

mod encryption;
mod storage;

pub use encryption::{validate_key, AesGcmCipher, SecretCipher};
pub use storage::CredentialStore;

/// Ciphertext and nonce, both base64-encoded.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SealedSecret {
    pub ciphertext: String,
    pub nonce: String,
}

/// A cached credential row.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CachedCredential {
    pub owner: String,
    pub encrypted_secret: SealedSecret,
    pub created_at: DateTime<Utc>,
}
