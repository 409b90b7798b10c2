// FieldVault — Record table queries
//
// Synchronous SQL against `storage_records`. Every query is scoped by
// owner; nothing here can read or delete another user's rows. Timestamps are
// stored as Unix milliseconds so range scans stay index-friendly.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};

use super::models::{DataTypeMetrics, RecordMetadata, StorageMetrics, StorageRecord};
use super::StoreError;
use crate::crypto::{EncryptedBlob, SALT_LEN};

/// Column layout shared by every full-record SELECT.
const RECORD_COLUMNS: &str = "id, data_type, owner_user_id, ciphertext, iv, salt,
     blob_timestamp, key_epoch, original_size, encrypted_at, last_accessed_at";

/// Row as read from SQLite, before structural validation.
struct RawRecord {
    id: String,
    data_type: String,
    owner_user_id: String,
    ciphertext: Vec<u8>,
    iv: Vec<u8>,
    salt: Vec<u8>,
    blob_timestamp: i64,
    key_epoch: i64,
    original_size: i64,
    encrypted_at: i64,
    last_accessed_at: i64,
}

impl RawRecord {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            data_type: row.get(1)?,
            owner_user_id: row.get(2)?,
            ciphertext: row.get(3)?,
            iv: row.get(4)?,
            salt: row.get(5)?,
            blob_timestamp: row.get(6)?,
            key_epoch: row.get(7)?,
            original_size: row.get(8)?,
            encrypted_at: row.get(9)?,
            last_accessed_at: row.get(10)?,
        })
    }

    fn into_record(self) -> Result<StorageRecord, StoreError> {
        let timestamp = from_millis(self.blob_timestamp, "blob_timestamp")?;
        let blob = EncryptedBlob::from_parts(self.ciphertext, &self.iv, &self.salt, timestamp)?;
        let original_size = u64::try_from(self.original_size)
            .map_err(|_| StoreError::Corruption("negative original_size".into()))?;

        Ok(StorageRecord {
            id: self.id,
            data_type: self.data_type,
            owner_user_id: self.owner_user_id,
            blob,
            key_epoch: self.key_epoch,
            metadata: RecordMetadata {
                original_size,
                encrypted_at: from_millis(self.encrypted_at, "encrypted_at")?,
                last_accessed_at: from_millis(self.last_accessed_at, "last_accessed_at")?,
            },
        })
    }
}

fn from_millis(millis: i64, column: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::from_timestamp_millis(millis)
        .ok_or_else(|| StoreError::Corruption(format!("{} out of range: {}", column, millis)))
}

/// Insert a record, or replace content and metadata of the existing one.
pub(crate) fn upsert(conn: &Connection, record: &StorageRecord) -> Result<(), StoreError> {
    conn.execute(
        "INSERT INTO storage_records
            (id, data_type, owner_user_id, ciphertext, iv, salt,
             blob_timestamp, key_epoch, original_size, encrypted_at, last_accessed_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
         ON CONFLICT(id, data_type, owner_user_id) DO UPDATE SET
            ciphertext       = excluded.ciphertext,
            iv               = excluded.iv,
            salt             = excluded.salt,
            blob_timestamp   = excluded.blob_timestamp,
            key_epoch        = excluded.key_epoch,
            original_size    = excluded.original_size,
            encrypted_at     = excluded.encrypted_at,
            last_accessed_at = excluded.last_accessed_at",
        params![
            record.id,
            record.data_type,
            record.owner_user_id,
            record.blob.ciphertext,
            &record.blob.iv[..],
            &record.blob.salt[..],
            record.blob.timestamp.timestamp_millis(),
            record.key_epoch,
            record.metadata.original_size as i64,
            record.metadata.encrypted_at.timestamp_millis(),
            record.metadata.last_accessed_at.timestamp_millis(),
        ],
    )?;
    Ok(())
}

pub(crate) fn fetch(
    conn: &Connection,
    owner: &str,
    data_type: &str,
    id: &str,
) -> Result<Option<StorageRecord>, StoreError> {
    let sql = format!(
        "SELECT {} FROM storage_records
         WHERE owner_user_id = ?1 AND data_type = ?2 AND id = ?3",
        RECORD_COLUMNS
    );
    let raw = conn
        .query_row(&sql, params![owner, data_type, id], RawRecord::from_row)
        .optional()?;

    raw.map(RawRecord::into_record).transpose()
}

pub(crate) fn fetch_metadata(
    conn: &Connection,
    owner: &str,
    data_type: &str,
    id: &str,
) -> Result<Option<RecordMetadata>, StoreError> {
    let raw = conn
        .query_row(
            "SELECT original_size, encrypted_at, last_accessed_at FROM storage_records
             WHERE owner_user_id = ?1 AND data_type = ?2 AND id = ?3",
            params![owner, data_type, id],
            |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, i64>(2)?,
                ))
            },
        )
        .optional()?;

    match raw {
        Some((size, encrypted_at, last_accessed_at)) => Ok(Some(RecordMetadata {
            original_size: u64::try_from(size)
                .map_err(|_| StoreError::Corruption("negative original_size".into()))?,
            encrypted_at: from_millis(encrypted_at, "encrypted_at")?,
            last_accessed_at: from_millis(last_accessed_at, "last_accessed_at")?,
        })),
        None => Ok(None),
    }
}

/// Refresh `last_accessed_at`. Returns false if the record no longer exists.
pub(crate) fn touch(
    conn: &Connection,
    owner: &str,
    data_type: &str,
    id: &str,
    at: DateTime<Utc>,
) -> Result<bool, StoreError> {
    let affected = conn.execute(
        "UPDATE storage_records SET last_accessed_at = ?4
         WHERE owner_user_id = ?1 AND data_type = ?2 AND id = ?3",
        params![owner, data_type, id, at.timestamp_millis()],
    )?;
    Ok(affected > 0)
}

pub(crate) fn list_ids(
    conn: &Connection,
    owner: &str,
    data_type: &str,
) -> Result<Vec<String>, StoreError> {
    let mut stmt = conn.prepare(
        "SELECT id FROM storage_records
         WHERE owner_user_id = ?1 AND data_type = ?2 ORDER BY id ASC",
    )?;
    let rows = stmt.query_map(params![owner, data_type], |row| row.get::<_, String>(0))?;

    let mut ids = Vec::new();
    for row in rows {
        ids.push(row?);
    }
    Ok(ids)
}

pub(crate) fn delete(
    conn: &Connection,
    owner: &str,
    data_type: &str,
    id: &str,
) -> Result<bool, StoreError> {
    let affected = conn.execute(
        "DELETE FROM storage_records
         WHERE owner_user_id = ?1 AND data_type = ?2 AND id = ?3",
        params![owner, data_type, id],
    )?;
    Ok(affected > 0)
}

pub(crate) fn delete_all_for_owner(conn: &Connection, owner: &str) -> Result<usize, StoreError> {
    let affected = conn.execute(
        "DELETE FROM storage_records WHERE owner_user_id = ?1",
        params![owner],
    )?;
    Ok(affected)
}

/// Delete records whose last access is strictly before `cutoff`.
pub(crate) fn delete_idle<K>(
    conn: &Connection,
    owner: &str,
    cutoff: DateTime<Utc>,
    keep: K,
) -> Result<usize, StoreError>
where
    K: Fn(&str, DateTime<Utc>) -> bool,
{
    let tx = conn.unchecked_transaction()?;

    let candidates = {
        let mut stmt = tx.prepare(
            "SELECT data_type, id, encrypted_at FROM storage_records
             WHERE owner_user_id = ?1 AND last_accessed_at < ?2",
        )?;
        let rows = stmt.query_map(params![owner, cutoff.timestamp_millis()], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, i64>(2)?,
            ))
        })?;
        let mut candidates = Vec::new();
        for row in rows {
            candidates.push(row?);
        }
        candidates
    };

    let mut removed = 0;
    for (data_type, id, encrypted_at) in candidates {
        if keep(&data_type, from_millis(encrypted_at, "encrypted_at")?) {
            continue;
        }
        removed += tx.execute(
            "DELETE FROM storage_records
             WHERE owner_user_id = ?1 AND data_type = ?2 AND id = ?3",
            params![owner, data_type, id],
        )?;
    }

    tx.commit()?;
    Ok(removed)
}

/// Swap in a re-encrypted blob, but only if the row still holds the blob
/// identified by `expected_salt`. A concurrent store or delete wins.
#[allow(clippy::too_many_arguments)]
pub(crate) fn replace_blob_if_unchanged(
    conn: &Connection,
    owner: &str,
    data_type: &str,
    id: &str,
    expected_salt: &[u8; SALT_LEN],
    blob: &EncryptedBlob,
    key_epoch: i64,
    encrypted_at: DateTime<Utc>,
) -> Result<bool, StoreError> {
    let affected = conn.execute(
        "UPDATE storage_records
         SET ciphertext = ?5, iv = ?6, salt = ?7, blob_timestamp = ?8,
             key_epoch = ?9, encrypted_at = ?10
         WHERE owner_user_id = ?1 AND data_type = ?2 AND id = ?3 AND salt = ?4",
        params![
            owner,
            data_type,
            id,
            &expected_salt[..],
            blob.ciphertext,
            &blob.iv[..],
            &blob.salt[..],
            blob.timestamp.timestamp_millis(),
            key_epoch,
            encrypted_at.timestamp_millis(),
        ],
    )?;
    Ok(affected > 0)
}

/// Per-type aggregates for one owner. Blobs sealed before `rotation_cutoff`
/// count as rotation-due.
pub(crate) fn metrics(
    conn: &Connection,
    owner: &str,
    rotation_cutoff: DateTime<Utc>,
) -> Result<StorageMetrics, StoreError> {
    let mut stmt = conn.prepare(
        "SELECT data_type,
                COUNT(*),
                COALESCE(SUM(original_size), 0),
                COALESCE(SUM(LENGTH(ciphertext)), 0),
                COALESCE(SUM(CASE WHEN blob_timestamp < ?2 THEN 1 ELSE 0 END), 0)
         FROM storage_records
         WHERE owner_user_id = ?1
         GROUP BY data_type
         ORDER BY data_type",
    )?;

    let rows = stmt.query_map(params![owner, rotation_cutoff.timestamp_millis()], |row| {
        Ok((
            row.get::<_, String>(0)?,
            row.get::<_, i64>(1)?,
            row.get::<_, i64>(2)?,
            row.get::<_, i64>(3)?,
            row.get::<_, i64>(4)?,
        ))
    })?;

    let mut metrics = StorageMetrics::default();
    for row in rows {
        let (data_type, count, original, encrypted, rotation_due) = row?;
        let entry = DataTypeMetrics {
            count: count.max(0) as u64,
            original_bytes: original.max(0) as u64,
            encrypted_bytes: encrypted.max(0) as u64,
            rotation_due: rotation_due.max(0) as u64,
        };
        metrics.total_records += entry.count;
        metrics.total_original_bytes += entry.original_bytes;
        metrics.total_encrypted_bytes += entry.encrypted_bytes;
        metrics.rotation_due += entry.rotation_due;
        metrics.by_data_type.insert(data_type, entry);
    }

    Ok(metrics)
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::IV_LEN;
    use crate::store::Database;
    use chrono::{Duration, TimeZone};

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 10, 9, 30, 0).unwrap()
    }

    fn record(owner: &str, data_type: &str, id: &str, salt_byte: u8) -> StorageRecord {
        StorageRecord {
            id: id.to_string(),
            data_type: data_type.to_string(),
            owner_user_id: owner.to_string(),
            blob: EncryptedBlob {
                ciphertext: vec![0xAB; 40],
                iv: [1u8; IV_LEN],
                salt: [salt_byte; SALT_LEN],
                timestamp: t0(),
            },
            key_epoch: 19_853,
            metadata: RecordMetadata {
                original_size: 24,
                encrypted_at: t0(),
                last_accessed_at: t0(),
            },
        }
    }

    #[test]
    fn test_upsert_then_fetch() {
        let db = Database::open_in_memory().unwrap();
        db.with_conn(|conn| {
            upsert(conn, &record("u1", "assessment", "a1", 1)).unwrap();

            let fetched = fetch(conn, "u1", "assessment", "a1").unwrap().unwrap();
            assert_eq!(fetched.id, "a1");
            assert_eq!(fetched.blob.salt, [1u8; SALT_LEN]);
            assert_eq!(fetched.blob.timestamp, t0());
            assert_eq!(fetched.key_epoch, 19_853);
            assert_eq!(fetched.metadata.original_size, 24);
        });
    }

    #[test]
    fn test_upsert_replaces_existing_row() {
        let db = Database::open_in_memory().unwrap();
        db.with_conn(|conn| {
            upsert(conn, &record("u1", "assessment", "a1", 1)).unwrap();

            let mut updated = record("u1", "assessment", "a1", 2);
            updated.metadata.last_accessed_at = t0() + Duration::minutes(5);
            upsert(conn, &updated).unwrap();

            let ids = list_ids(conn, "u1", "assessment").unwrap();
            assert_eq!(ids, vec!["a1"]);

            let fetched = fetch(conn, "u1", "assessment", "a1").unwrap().unwrap();
            assert_eq!(fetched.blob.salt, [2u8; SALT_LEN]);
            assert_eq!(fetched.metadata.last_accessed_at, t0() + Duration::minutes(5));
        });
    }

    #[test]
    fn test_identity_includes_type_and_owner() {
        let db = Database::open_in_memory().unwrap();
        db.with_conn(|conn| {
            upsert(conn, &record("u1", "assessment", "x", 1)).unwrap();
            upsert(conn, &record("u1", "incident", "x", 2)).unwrap();
            upsert(conn, &record("u2", "assessment", "x", 3)).unwrap();

            assert_eq!(
                fetch(conn, "u1", "incident", "x").unwrap().unwrap().blob.salt,
                [2u8; SALT_LEN]
            );
            assert_eq!(
                fetch(conn, "u2", "assessment", "x").unwrap().unwrap().blob.salt,
                [3u8; SALT_LEN]
            );
        });
    }

    #[test]
    fn test_fetch_missing_returns_none() {
        let db = Database::open_in_memory().unwrap();
        db.with_conn(|conn| {
            assert!(fetch(conn, "u1", "assessment", "nope").unwrap().is_none());
            assert!(fetch_metadata(conn, "u1", "assessment", "nope").unwrap().is_none());
        });
    }

    #[test]
    fn test_fetch_malformed_row_is_corruption() {
        let db = Database::open_in_memory().unwrap();
        db.with_conn(|conn| {
            upsert(conn, &record("u1", "assessment", "a1", 1)).unwrap();
            conn.execute("UPDATE storage_records SET iv = x'0102'", []).unwrap();

            assert!(matches!(
                fetch(conn, "u1", "assessment", "a1"),
                Err(StoreError::Corruption(_))
            ));
        });
    }

    #[test]
    fn test_delete_is_scoped_and_idempotent() {
        let db = Database::open_in_memory().unwrap();
        db.with_conn(|conn| {
            upsert(conn, &record("u1", "assessment", "a1", 1)).unwrap();

            assert!(!delete(conn, "u2", "assessment", "a1").unwrap());
            assert!(delete(conn, "u1", "assessment", "a1").unwrap());
            assert!(!delete(conn, "u1", "assessment", "a1").unwrap());
        });
    }

    #[test]
    fn test_delete_all_for_owner_leaves_other_users() {
        let db = Database::open_in_memory().unwrap();
        db.with_conn(|conn| {
            upsert(conn, &record("u1", "assessment", "a1", 1)).unwrap();
            upsert(conn, &record("u1", "incident", "i1", 2)).unwrap();
            upsert(conn, &record("u2", "assessment", "a1", 3)).unwrap();

            assert_eq!(delete_all_for_owner(conn, "u1").unwrap(), 2);
            assert!(fetch(conn, "u2", "assessment", "a1").unwrap().is_some());
        });
    }

    #[test]
    fn test_touch_updates_last_accessed() {
        let db = Database::open_in_memory().unwrap();
        db.with_conn(|conn| {
            upsert(conn, &record("u1", "assessment", "a1", 1)).unwrap();
            let later = t0() + Duration::hours(2);

            assert!(touch(conn, "u1", "assessment", "a1", later).unwrap());
            assert!(!touch(conn, "u1", "assessment", "missing", later).unwrap());

            let meta = fetch_metadata(conn, "u1", "assessment", "a1").unwrap().unwrap();
            assert_eq!(meta.last_accessed_at, later);
            assert_eq!(meta.encrypted_at, t0());
        });
    }

    #[test]
    fn test_delete_idle_uses_last_access() {
        let db = Database::open_in_memory().unwrap();
        db.with_conn(|conn| {
            upsert(conn, &record("u1", "assessment", "old", 1)).unwrap();
            let mut fresh = record("u1", "assessment", "fresh", 2);
            fresh.metadata.last_accessed_at = t0() + Duration::days(40);
            upsert(conn, &fresh).unwrap();

            let removed = delete_idle(conn, "u1", t0() + Duration::days(10), |_, _| false).unwrap();
            assert_eq!(removed, 1);
            assert_eq!(list_ids(conn, "u1", "assessment").unwrap(), vec!["fresh"]);
        });
    }

    #[test]
    fn test_delete_idle_respects_keep() {
        let db = Database::open_in_memory().unwrap();
        db.with_conn(|conn| {
            upsert(conn, &record("u1", "assessment", "a1", 1)).unwrap();
            upsert(conn, &record("u1", "commitment", "c1", 2)).unwrap();

            let removed = delete_idle(conn, "u1", t0() + Duration::days(10), |data_type, _| {
                data_type == "commitment"
            })
            .unwrap();
            assert_eq!(removed, 1);
            assert!(list_ids(conn, "u1", "assessment").unwrap().is_empty());
            assert_eq!(list_ids(conn, "u1", "commitment").unwrap(), vec!["c1"]);
        });
    }

    #[test]
    fn test_replace_blob_requires_matching_salt() {
        let db = Database::open_in_memory().unwrap();
        db.with_conn(|conn| {
            upsert(conn, &record("u1", "assessment", "a1", 1)).unwrap();
            let replacement = EncryptedBlob {
                ciphertext: vec![0xCD; 40],
                iv: [9u8; IV_LEN],
                salt: [9u8; SALT_LEN],
                timestamp: t0() + Duration::days(2),
            };

            let stale = replace_blob_if_unchanged(
                conn, "u1", "assessment", "a1", &[7u8; SALT_LEN], &replacement, 2, t0(),
            )
            .unwrap();
            assert!(!stale, "A salt mismatch must not overwrite the row");

            let swapped = replace_blob_if_unchanged(
                conn, "u1", "assessment", "a1", &[1u8; SALT_LEN], &replacement, 2, t0(),
            )
            .unwrap();
            assert!(swapped);

            let fetched = fetch(conn, "u1", "assessment", "a1").unwrap().unwrap();
            assert_eq!(fetched.blob, replacement);
            assert_eq!(fetched.key_epoch, 2);
        });
    }

    #[test]
    fn test_metrics_aggregate_per_type() {
        let db = Database::open_in_memory().unwrap();
        db.with_conn(|conn| {
            upsert(conn, &record("u1", "assessment", "a1", 1)).unwrap();
            upsert(conn, &record("u1", "assessment", "a2", 2)).unwrap();
            let mut newer = record("u1", "incident", "i1", 3);
            newer.blob.timestamp = t0() + Duration::days(3);
            upsert(conn, &newer).unwrap();
            upsert(conn, &record("u2", "incident", "i9", 4)).unwrap();

            let m = metrics(conn, "u1", t0() + Duration::days(1)).unwrap();
            assert_eq!(m.total_records, 3);
            assert_eq!(m.total_original_bytes, 72);
            assert_eq!(m.total_encrypted_bytes, 120);
            assert_eq!(m.rotation_due, 2);
            assert_eq!(m.by_data_type["assessment"].count, 2);
            assert_eq!(m.by_data_type["incident"].count, 1);
            assert_eq!(m.by_data_type["incident"].rotation_due, 0);
        });
    }
}
