//! Error taxonomy for the fetch engine.

use thiserror::Error;

/// Failures surfaced by the catalog, session, transport and paginator layers.
///
/// Configuration errors (`UnknownResourceType`, `MissingPathParameter`,
/// `InvalidFilterValue`) are never retried. Authentication errors mean the caller has to supply
/// credentials again.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("unknown resource type: {0}")]
    UnknownResourceType(String),

    #[error("missing path parameter '{param}' for {resource}")]
    MissingPathParameter { resource: String, param: String },

    #[error("filter value for '{param}' contains a reserved character: {value}")]
    InvalidFilterValue { param: String, value: String },

    #[error("authentication required")]
    AuthenticationRequired,

    #[error("no cached credential available for {owner}")]
    NoCredentialAvailable { owner: String },

    #[error("invalid username or password")]
    BadCredentials,

    #[error("authentication handshake failed at {step}: {reason}")]
    HandshakeFailed { step: &'static str, reason: String },

    #[error("request failed: {0}")]
    RequestFailed(String),

    #[error("invalid response: {0}")]
    InvalidResponse(String),

    #[error("cached credential could not be decrypted")]
    DecryptionFailed,

    #[error("operation cancelled")]
    Cancelled,

    #[error("store error: {0}")]
    Store(String),
}

impl FetchError {
    /// True for failures the caller resolves by prompting for credentials.
    pub fn is_auth_failure(&self) -> bool {
        matches!(
            self,
            FetchError::AuthenticationRequired
                | FetchError::NoCredentialAvailable { .. }
                | FetchError::BadCredentials
                | FetchError::HandshakeFailed { .. }
                | FetchError::DecryptionFailed
        )
    }
}

impl From<anyhow::Error> for FetchError {
    fn from(e: anyhow::Error) -> Self {
        FetchError::Store(format!("{:#}", e))
    }
}

pub type FetchResult<T> = std::result::Result<T, FetchError>;
