// FieldVault — Store Module
//
// Encrypted record persistence on SQLite. Every payload is sealed with
// AES-256-GCM before it reaches the database; rows carry only ciphertext
// plus the metadata needed for rotation, metrics and cleanup.

mod db;
mod error;
mod models;
mod records;
mod repository;
mod session;

pub use db::Database;
pub use error::StoreError;
pub use models::{DataTypeMetrics, MaintenanceReport, RecordMetadata, StorageMetrics, StorageRecord};
pub use repository::{EncryptedStore, WeakStore};
pub use session::SessionContext;
