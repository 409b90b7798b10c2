// FieldVault — Classification error types

use std::path::PathBuf;

use thiserror::Error;

use crate::store::StoreError;

#[derive(Debug, Error)]
pub enum ClassifyError {
    #[error("Classification table has no entry for data kind '{0}'")]
    MissingKind(String),

    #[error("Unknown data kind: '{0}'")]
    UnknownKind(String),

    #[error("Invalid policy for '{kind}': {reason}")]
    InvalidPolicy { kind: String, reason: String },

    #[error("Invalid classification table: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Failed to read classification table {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error(transparent)]
    Store(#[from] StoreError),
}
