// FieldVault — Store error types

use thiserror::Error;

use crate::crypto::CryptoError;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Secure storage not initialized: call initialize() with a user session first")]
    NotInitialized,

    /// The session a background pass was started for is no longer active.
    #[error("Storage session ended or was replaced")]
    SessionEnded,

    /// Wrong key, wrong user, or tampered record. Deliberately undifferentiated.
    #[error("Authentication failed: record could not be verified")]
    Authentication,

    #[error("Corrupted record: {0}")]
    Corruption(String),

    #[error("Storage I/O error: {0}")]
    StorageIo(#[from] rusqlite::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Crypto error: {0}")]
    Crypto(CryptoError),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Storage worker failed: {0}")]
    Task(String),
}

impl From<CryptoError> for StoreError {
    fn from(err: CryptoError) -> Self {
        match err {
            CryptoError::Authentication => StoreError::Authentication,
            CryptoError::Malformed(detail) => StoreError::Corruption(detail),
            other => StoreError::Crypto(other),
        }
    }
}
