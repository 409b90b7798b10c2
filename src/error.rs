// FieldVault — Top-level error types
//
// Aggregates errors from the crypto, store, classification and config
// modules into a single error enum for the application boundary.

use thiserror::Error;

/// Top-level error type for all FieldVault operations.
#[derive(Debug, Error)]
pub enum FieldVaultError {
    #[error("Crypto error: {0}")]
    Crypto(#[from] crate::crypto::CryptoError),

    #[error("Store error: {0}")]
    Store(#[from] crate::store::StoreError),

    #[error("Classification error: {0}")]
    Classify(#[from] crate::classify::ClassifyError),

    #[error("Config error: {0}")]
    Config(#[from] crate::config::ConfigError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, FieldVaultError>;
