// FieldVault — Storage data models
//
// SECURITY: records hold ciphertext only. `Debug` on a record prints sizes
// and timestamps, never blob bytes.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::crypto::EncryptedBlob;

/// Bookkeeping stored next to each blob.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordMetadata {
    /// Size of the serialized plaintext in bytes.
    pub original_size: u64,
    pub encrypted_at: DateTime<Utc>,
    pub last_accessed_at: DateTime<Utc>,
}

/// The persisted unit, unique per `(id, data_type, owner_user_id)`.
#[derive(Clone)]
pub struct StorageRecord {
    pub id: String,
    pub data_type: String,
    pub owner_user_id: String,
    pub blob: EncryptedBlob,
    /// Time bucket of the session key material that sealed `blob`.
    pub key_epoch: i64,
    pub metadata: RecordMetadata,
}

impl fmt::Debug for StorageRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StorageRecord")
            .field("id", &self.id)
            .field("data_type", &self.data_type)
            .field("owner_user_id", &self.owner_user_id)
            .field("blob", &self.blob)
            .field("key_epoch", &self.key_epoch)
            .field("metadata", &self.metadata)
            .finish()
    }
}

/// Aggregates for one data type.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataTypeMetrics {
    pub count: u64,
    pub original_bytes: u64,
    pub encrypted_bytes: u64,
    pub rotation_due: u64,
}

/// Storage aggregates for the current user.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageMetrics {
    pub total_records: u64,
    pub total_original_bytes: u64,
    pub total_encrypted_bytes: u64,
    /// Records older than the rotation interval, awaiting re-encryption.
    pub rotation_due: u64,
    /// Derived keys currently held in memory.
    pub cached_keys: usize,
    pub by_data_type: BTreeMap<String, DataTypeMetrics>,
}

/// Outcome of one maintenance pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MaintenanceReport {
    pub idle_records_removed: usize,
    pub expired_keys_purged: usize,
}
