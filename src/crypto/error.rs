// FieldVault — Crypto error types

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CryptoError {
    /// Wrong key, wrong user, or tampered data. Deliberately undifferentiated.
    #[error("Authentication failed: data could not be verified")]
    Authentication,

    #[error("Malformed encrypted blob: {0}")]
    Malformed(String),

    #[error("Key derivation error: {0}")]
    Derivation(String),

    #[error("Encryption failed")]
    Encryption,

    #[error("Crypto worker failed: {0}")]
    Task(String),
}
