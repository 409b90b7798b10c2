// FieldVault — Library root
//
// Encrypted offline record storage: crypto core, SQLite-backed encrypted
// store, classification policy, background task scheduling, and the CLI.

pub mod classify;
pub mod cli;
pub mod clock;
pub mod config;
pub mod crypto;
pub mod error;
pub mod store;
pub mod tasks;

pub use classify::{ClassificationTable, CleanupReport, DataKind, SecureStorage, Sensitivity};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{ReadMode, VaultConfig};
pub use error::{FieldVaultError, Result};
pub use store::{Database, EncryptedStore, StorageMetrics};
