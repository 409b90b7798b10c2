// FieldVault — Secure storage facade
//
// Typed per-kind operations over `EncryptedStore`. Each payload is wrapped in
// a stamped envelope carrying its own `encrypted_at` and sensitivity, so
// retention is measured from the first write of that payload version and is
// unaffected by background re-encryption.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::de::{DeserializeOwned, IgnoredAny};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::policy::{ClassificationTable, DataKind, Sensitivity};
use super::ClassifyError;
use crate::store::{EncryptedStore, StorageMetrics, StoreError};

/// Envelope persisted for every classified payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StampedRecord<T> {
    pub encrypted_at: DateTime<Utc>,
    pub sensitivity: Sensitivity,
    pub data: T,
}

/// Outcome of one retention pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CleanupReport {
    pub items_removed: usize,
    /// Kinds from which at least one record was removed.
    pub data_types: Vec<String>,
    /// Records that could not be inspected and were left in place.
    pub skipped: usize,
}

impl CleanupReport {
    fn record_removals(&mut self, data_type: &str, removed: usize) {
        if removed > 0 {
            tracing::info!(data_type, removed, "Expired records removed");
            self.items_removed += removed;
            self.data_types.push(data_type.to_string());
        }
    }
}

/// Classified, typed access to the encrypted store.
#[derive(Clone)]
pub struct SecureStorage {
    store: EncryptedStore,
    table: Arc<ClassificationTable>,
    sweep_interval: std::time::Duration,
    /// Session whose crypto self-test passed.
    verified_session: Arc<Mutex<Option<Uuid>>>,
}

macro_rules! typed_ops {
    ($($kind:expr => $store:ident, $get:ident, $remove:ident;)*) => {
        $(
            pub async fn $store<T>(&self, id: &str, data: &T) -> Result<(), ClassifyError>
            where
                T: Serialize + ?Sized,
            {
                self.store_record($kind, id, data).await
            }

            pub async fn $get<T>(&self, id: &str) -> Result<Option<T>, ClassifyError>
            where
                T: DeserializeOwned,
            {
                self.get_record($kind, id).await
            }

            pub async fn $remove(&self, id: &str) -> bool {
                self.remove_record($kind, id).await
            }
        )*
    };
}

impl SecureStorage {
    pub fn new(
        store: EncryptedStore,
        table: ClassificationTable,
        sweep_interval: std::time::Duration,
    ) -> Self {
        for classification in table.iter() {
            store.protect_retention(
                classification.data_type.as_key(),
                classification.retention(),
            );
        }
        Self {
            store,
            table: Arc::new(table),
            sweep_interval,
            verified_session: Arc::new(Mutex::new(None)),
        }
    }

    pub fn store(&self) -> &EncryptedStore {
        &self.store
    }

    pub fn table(&self) -> &ClassificationTable {
        &self.table
    }

    /// Verify the cipher, start the user session and schedule the recurring
    /// retention sweep.
    pub async fn initialize(&self, user_id: &str, session_token: &str) -> Result<(), ClassifyError> {
        self.store
            .crypto()
            .self_test()
            .await
            .map_err(StoreError::from)?;

        let context = self.store.initialize(user_id, session_token).await?;
        *self.verified_session.lock() = Some(context.session_id());

        self.schedule_retention_sweep(context.session_id())?;
        tracing::info!(
            user_id = context.user_id(),
            session_id = %context.session_id(),
            "Secure storage ready"
        );
        Ok(())
    }

    pub fn is_initialized(&self) -> bool {
        self.store.is_initialized()
    }

    /// True when the active session passed the crypto self-test.
    pub fn is_security_enabled(&self) -> bool {
        let verified = *self.verified_session.lock();
        match (verified, self.store.session()) {
            (Some(verified), Ok(active)) => verified == active.session_id(),
            _ => false,
        }
    }

    pub fn end_session(&self) {
        *self.verified_session.lock() = None;
        self.store.end_session();
    }

    pub async fn shutdown(&self) {
        *self.verified_session.lock() = None;
        self.store.shutdown().await;
    }

    // ─── Typed operations ────────────────────────────────────────────────────

    pub async fn store_record<T>(&self, kind: DataKind, id: &str, data: &T) -> Result<(), ClassifyError>
    where
        T: Serialize + ?Sized,
    {
        let classification = self.table.classify(kind);
        let stamped = StampedRecord {
            encrypted_at: self.store.clock().now(),
            sensitivity: classification.sensitivity,
            data,
        };
        self.store.store(id, &stamped, kind.as_key()).await?;
        Ok(())
    }

    pub async fn get_record<T>(&self, kind: DataKind, id: &str) -> Result<Option<T>, ClassifyError>
    where
        T: DeserializeOwned,
    {
        let stamped: Option<StampedRecord<T>> = self.store.retrieve(id, kind.as_key()).await?;
        Ok(stamped.map(|record| record.data))
    }

    pub async fn remove_record(&self, kind: DataKind, id: &str) -> bool {
        self.store.remove(id, kind.as_key()).await
    }

    typed_ops! {
        DataKind::Assessment => store_assessment, get_assessment, remove_assessment;
        DataKind::Incident => store_incident, get_incident, remove_incident;
        DataKind::Response => store_response, get_response, remove_response;
        DataKind::UserProfile => store_user_profile, get_user_profile, remove_user_profile;
        DataKind::Commitment => store_commitment, get_commitment, remove_commitment;
        DataKind::AuthToken => store_auth_token, get_auth_token, remove_auth_token;
    }

    pub async fn list(&self, kind: DataKind) -> Result<Vec<String>, ClassifyError> {
        Ok(self.store.list(kind.as_key()).await?)
    }

    pub async fn get_storage_metrics(&self) -> Result<StorageMetrics, ClassifyError> {
        Ok(self.store.get_metrics().await?)
    }

    /// Delete every record of the current user. Returns how many were removed.
    pub async fn clear_all_data(&self) -> Result<usize, ClassifyError> {
        Ok(self.store.clear_user_data().await?)
    }

    // ─── Retention ───────────────────────────────────────────────────────────

    /// Remove every record older than its kind's retention window.
    pub async fn perform_data_cleanup(&self) -> Result<CleanupReport, ClassifyError> {
        let context = self.store.session()?;
        Ok(sweep_expired(&self.store, &self.table, context.session_id()).await)
    }

    fn schedule_retention_sweep(&self, session_id: Uuid) -> Result<(), ClassifyError> {
        let scope = self.store.session_scope()?;
        let weak = self.store.downgrade();
        let table = Arc::clone(&self.table);

        scope.spawn_interval("retention-sweep", self.sweep_interval, move || {
            let weak = weak.clone();
            let table = Arc::clone(&table);
            async move {
                let Some(store) = weak.upgrade() else {
                    return;
                };
                let report = sweep_expired(&store, &table, session_id).await;
                if report.items_removed > 0 || report.skipped > 0 {
                    tracing::info!(
                        removed = report.items_removed,
                        skipped = report.skipped,
                        data_types = ?report.data_types,
                        "Scheduled retention sweep completed"
                    );
                }
            }
        });
        Ok(())
    }
}

impl std::fmt::Debug for SecureStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecureStorage")
            .field("store", &self.store)
            .field("security_enabled", &self.is_security_enabled())
            .finish_non_exhaustive()
    }
}

/// One retention pass for `session_id`. Every record is handled on its own;
/// failures are logged and counted, and the pass stops early only if the
/// session ends or is replaced underneath it.
async fn sweep_expired(
    store: &EncryptedStore,
    table: &ClassificationTable,
    session_id: Uuid,
) -> CleanupReport {
    let mut report = CleanupReport::default();
    let now = store.clock().now();

    'kinds: for classification in table.iter() {
        let Some(retention) = classification.retention() else {
            continue;
        };
        let data_type = classification.data_type.as_key();
        let Some(cutoff) = now.checked_sub_signed(retention) else {
            tracing::warn!(data_type, "Retention window out of range, kind skipped");
            continue;
        };

        let ids = match store.list_in_session(session_id, data_type).await {
            Ok(ids) => ids,
            Err(StoreError::SessionEnded) => {
                log_abandoned(session_id);
                break;
            }
            Err(err) => {
                tracing::warn!(data_type, error = %err, "Retention sweep could not list records");
                continue;
            }
        };

        let mut removed_here = 0;
        for id in ids {
            let expired = match store
                .inspect_in_session::<StampedRecord<IgnoredAny>>(session_id, &id, data_type)
                .await
            {
                Ok(Some(stamped)) => stamped.encrypted_at < cutoff,
                Ok(None) => false,
                Err(StoreError::SessionEnded) => {
                    log_abandoned(session_id);
                    report.record_removals(data_type, removed_here);
                    break 'kinds;
                }
                Err(err) => {
                    tracing::warn!(
                        record_id = %id,
                        data_type,
                        error = %err,
                        "Skipping record during retention sweep"
                    );
                    report.skipped += 1;
                    false
                }
            };
            if !expired {
                continue;
            }

            match store.remove_in_session(session_id, &id, data_type).await {
                Ok(true) => removed_here += 1,
                Ok(false) => {}
                Err(StoreError::SessionEnded) => {
                    log_abandoned(session_id);
                    report.record_removals(data_type, removed_here);
                    break 'kinds;
                }
                Err(err) => {
                    tracing::warn!(
                        record_id = %id,
                        data_type,
                        error = %err,
                        "Failed to remove expired record"
                    );
                }
            }
        }

        report.record_removals(data_type, removed_here);
    }

    report
}

fn log_abandoned(session_id: Uuid) {
    tracing::debug!(%session_id, "Retention sweep abandoned, session changed");
}

// ─── Tests ───────────────────────────────────────────────────────────────────
