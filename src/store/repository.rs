// FieldVault — Encrypted Record Store
//
// Implements user-scoped persistence of encrypted records. Plaintext exists
// only in memory: it is JSON-serialized, sealed by `CryptoCore`, and only the
// resulting blob reaches SQLite.
//
// Background work (re-encryption of rotation-due blobs, idle-record
// maintenance) runs in the active session's task scope and holds only a weak
// reference to the store. Before writing, it re-checks under the connection
// lock that its session is still the active one.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use chrono::{DateTime, Duration, Utc};
use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde::Serialize;
use uuid::Uuid;
use zeroize::Zeroizing;

use super::db::Database;
use super::models::{MaintenanceReport, RecordMetadata, StorageMetrics, StorageRecord};
use super::records;
use super::session::SessionContext;
use super::StoreError;
use crate::clock::Clock;
use crate::config::{ReadMode, StoreConfig, VaultConfig};
use crate::crypto::CryptoCore;
use crate::tasks::{TaskScheduler, TaskScope};

struct ActiveSession {
    context: Arc<SessionContext>,
    scope: TaskScope,
}

struct StoreInner {
    db: Database,
    crypto: Arc<CryptoCore>,
    scheduler: TaskScheduler,
    clock: Arc<dyn Clock>,
    config: StoreConfig,
    active: RwLock<Option<ActiveSession>>,
    /// Per data type retention that idle eviction must not cut short.
    /// `None` means the type is never idle-evicted.
    retention_floors: RwLock<HashMap<String, Option<Duration>>>,
}

impl StoreInner {
    fn is_current(&self, session_id: Uuid) -> bool {
        self.active
            .read()
            .as_ref()
            .is_some_and(|active| active.context.session_id() == session_id)
    }
}

/// Persistent encrypted key-value store bound to one user session at a time.
///
/// Cheap to clone; clones share the session, key cache and scheduler.
/// Several stores over the same [`Database`] model concurrent sessions.
#[derive(Clone)]
pub struct EncryptedStore {
    inner: Arc<StoreInner>,
}

impl EncryptedStore {
    pub fn new(db: Database, config: &VaultConfig, clock: Arc<dyn Clock>) -> Self {
        let crypto = Arc::new(CryptoCore::new(&config.crypto, clock.clone()));
        Self::with_parts(db, crypto, TaskScheduler::new(), clock, config.store.clone())
    }

    /// Build a store around an existing crypto core and scheduler.
    pub fn with_parts(
        db: Database,
        crypto: Arc<CryptoCore>,
        scheduler: TaskScheduler,
        clock: Arc<dyn Clock>,
        config: StoreConfig,
    ) -> Self {
        Self {
            inner: Arc::new(StoreInner {
                db,
                crypto,
                scheduler,
                clock,
                config,
                active: RwLock::new(None),
                retention_floors: RwLock::new(HashMap::new()),
            }),
        }
    }

    /// Non-owning handle for background tasks, so a pending task never keeps
    /// the store (and its session) alive.
    pub fn downgrade(&self) -> WeakStore {
        WeakStore(Arc::downgrade(&self.inner))
    }

    pub fn crypto(&self) -> &Arc<CryptoCore> {
        &self.inner.crypto
    }

    pub fn scheduler(&self) -> &TaskScheduler {
        &self.inner.scheduler
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.inner.clock
    }

    pub fn database(&self) -> &Database {
        &self.inner.db
    }

    pub fn read_mode(&self) -> ReadMode {
        self.inner.config.read_mode
    }

    /// Keep idle eviction from removing `data_type` records younger than
    /// `retention`, or from removing them at all when `retention` is `None`.
    pub fn protect_retention(&self, data_type: &str, retention: Option<Duration>) {
        self.inner
            .retention_floors
            .write()
            .insert(data_type.to_string(), retention);
    }

    // ─── Session lifecycle ───────────────────────────────────────────────────

    /// Start a session for `user_id`, replacing any active one.
    ///
    /// Background tasks of the previous session are cancelled and the derived
    /// key cache is cleared.
    pub async fn initialize(
        &self,
        user_id: &str,
        session_token: &str,
    ) -> Result<Arc<SessionContext>, StoreError> {
        let context = Arc::new(SessionContext::new(
            user_id,
            session_token,
            self.inner.clock.now(),
            self.inner.config.key_epoch(),
        )?);
        let scope = self.inner.scheduler.scope();

        let previous = self.inner.active.write().replace(ActiveSession {
            context: Arc::clone(&context),
            scope: scope.clone(),
        });

        if let Some(previous) = previous {
            previous.scope.cancel();
            self.inner.crypto.clear_key_cache();
            tracing::info!(
                previous_session = %previous.context.session_id(),
                previous_user = previous.context.user_id(),
                "Replaced active storage session"
            );
        }

        self.schedule_maintenance(&scope, context.session_id());

        tracing::info!(
            user_id = context.user_id(),
            session_id = %context.session_id(),
            "Secure storage initialized"
        );
        Ok(context)
    }

    pub fn is_initialized(&self) -> bool {
        self.inner.active.read().is_some()
    }

    /// The active session, or `NotInitialized`.
    pub fn session(&self) -> Result<Arc<SessionContext>, StoreError> {
        self.inner
            .active
            .read()
            .as_ref()
            .map(|active| Arc::clone(&active.context))
            .ok_or(StoreError::NotInitialized)
    }

    /// Task scope of the active session, for callers that attach their own
    /// session-bound background work.
    pub fn session_scope(&self) -> Result<TaskScope, StoreError> {
        self.inner
            .active
            .read()
            .as_ref()
            .map(|active| active.scope.clone())
            .ok_or(StoreError::NotInitialized)
    }

    /// Drop the active session: cancel its tasks and forget derived keys.
    /// Stored records are kept. Returns false if no session was active.
    pub fn end_session(&self) -> bool {
        let previous = self.inner.active.write().take();
        match previous {
            Some(previous) => {
                previous.scope.cancel();
                self.inner.crypto.clear_key_cache();
                tracing::info!(
                    user_id = previous.context.user_id(),
                    session_id = %previous.context.session_id(),
                    "Storage session ended"
                );
                true
            }
            None => false,
        }
    }

    /// End the session and stop every background task.
    pub async fn shutdown(&self) {
        self.end_session();
        self.inner.scheduler.shutdown().await;
    }

    fn session_matching(&self, session_id: Uuid) -> Option<Arc<SessionContext>> {
        self.inner
            .active
            .read()
            .as_ref()
            .filter(|active| active.context.session_id() == session_id)
            .map(|active| Arc::clone(&active.context))
    }

    fn scope_matching(&self, session_id: Uuid) -> Option<TaskScope> {
        self.inner
            .active
            .read()
            .as_ref()
            .filter(|active| active.context.session_id() == session_id)
            .map(|active| active.scope.clone())
    }

    // ─── Records ─────────────────────────────────────────────────────────────

    /// Serialize, encrypt and upsert `data` under `(id, data_type)` for the
    /// current user.
    pub async fn store<T>(&self, id: &str, data: &T, data_type: &str) -> Result<(), StoreError>
    where
        T: Serialize + ?Sized,
    {
        check_identity(id, data_type)?;
        let context = self.session()?;

        let plaintext = Zeroizing::new(serde_json::to_vec(data)?);
        let now = self.inner.clock.now();
        let key_epoch = context.epoch_at(now);
        let blob = self
            .inner
            .crypto
            .encrypt(&plaintext, context.user_id(), &context.key_material(key_epoch))
            .await?;

        let record = StorageRecord {
            id: id.to_string(),
            data_type: data_type.to_string(),
            owner_user_id: context.user_id().to_string(),
            blob,
            key_epoch,
            metadata: RecordMetadata {
                original_size: plaintext.len() as u64,
                encrypted_at: now,
                last_accessed_at: now,
            },
        };

        let inner = Arc::clone(&self.inner);
        let session_id = context.session_id();
        self.inner
            .db
            .call(move |conn| {
                if !inner.is_current(session_id) {
                    return Err(StoreError::NotInitialized);
                }
                records::upsert(conn, &record)
            })
            .await?;

        tracing::debug!(
            record_id = id,
            data_type,
            user_id = context.user_id(),
            size = plaintext.len(),
            "Record stored"
        );
        Ok(())
    }

    /// Fetch and decrypt a record of the current user.
    ///
    /// Returns `Ok(None)` when no such record exists. In lenient read mode an
    /// undecryptable or unreadable record is also reported as `None`; in
    /// strict mode the failure is returned. A successful read refreshes the
    /// record's access time and, when the blob is past the rotation interval,
    /// schedules a background re-encryption.
    pub async fn retrieve<T>(&self, id: &str, data_type: &str) -> Result<Option<T>, StoreError>
    where
        T: DeserializeOwned,
    {
        let context = self.session()?;

        match self.read_record(&context, id, data_type).await {
            Ok(value) => Ok(value),
            Err(err) => match self.inner.config.read_mode {
                ReadMode::Strict => Err(err),
                ReadMode::Lenient => {
                    tracing::warn!(
                        record_id = id,
                        data_type,
                        error = %err,
                        "Record could not be read, treating as absent"
                    );
                    Ok(None)
                }
            },
        }
    }

    async fn read_record<T>(
        &self,
        context: &Arc<SessionContext>,
        id: &str,
        data_type: &str,
    ) -> Result<Option<T>, StoreError>
    where
        T: DeserializeOwned,
    {
        let Some(record) = self.fetch(context, id, data_type).await? else {
            return Ok(None);
        };

        let plaintext = self.open(context, &record).await?;
        let value: T = serde_json::from_slice(&plaintext)?;

        let owner = record.owner_user_id.clone();
        let (touch_type, touch_id) = (record.data_type.clone(), record.id.clone());
        let now = self.inner.clock.now();
        if let Err(err) = self
            .inner
            .db
            .call(move |conn| records::touch(conn, &owner, &touch_type, &touch_id, now))
            .await
        {
            tracing::warn!(record_id = id, data_type, error = %err, "Access time not refreshed");
        }

        if self.inner.crypto.needs_reencryption(&record.blob) {
            self.schedule_reencryption(context.session_id(), record);
        }

        Ok(Some(value))
    }

    /// Strict, side-effect-free read: no access-time refresh and no
    /// re-encryption. Failures are always returned.
    pub async fn inspect<T>(&self, id: &str, data_type: &str) -> Result<Option<T>, StoreError>
    where
        T: DeserializeOwned,
    {
        let context = self.session()?;
        self.inspect_as(&context, id, data_type).await
    }

    async fn inspect_as<T>(
        &self,
        context: &SessionContext,
        id: &str,
        data_type: &str,
    ) -> Result<Option<T>, StoreError>
    where
        T: DeserializeOwned,
    {
        let Some(record) = self.fetch(context, id, data_type).await? else {
            return Ok(None);
        };

        let plaintext = self.open(context, &record).await?;
        Ok(Some(serde_json::from_slice(&plaintext)?))
    }

    async fn fetch(
        &self,
        context: &SessionContext,
        id: &str,
        data_type: &str,
    ) -> Result<Option<StorageRecord>, StoreError> {
        let owner = context.user_id().to_string();
        let (data_type, id) = (data_type.to_string(), id.to_string());
        self.inner
            .db
            .call(move |conn| records::fetch(conn, &owner, &data_type, &id))
            .await
    }

    async fn open(
        &self,
        context: &SessionContext,
        record: &StorageRecord,
    ) -> Result<Zeroizing<Vec<u8>>, StoreError> {
        let material = context.key_material(record.key_epoch);
        let plaintext = self
            .inner
            .crypto
            .decrypt(&record.blob, context.user_id(), &material)
            .await?;
        Ok(plaintext)
    }

    /// Ids of the current user's records of `data_type`, in ascending order.
    pub async fn list(&self, data_type: &str) -> Result<Vec<String>, StoreError> {
        let context = self.session()?;
        let owner = context.user_id().to_string();
        let data_type = data_type.to_string();
        self.inner
            .db
            .call(move |conn| records::list_ids(conn, &owner, &data_type))
            .await
    }

    /// Delete a record. Best effort: absence is a no-op and failures are
    /// logged. Returns true only if a record was actually removed.
    pub async fn remove(&self, id: &str, data_type: &str) -> bool {
        let context = match self.session() {
            Ok(context) => context,
            Err(err) => {
                tracing::warn!(record_id = id, data_type, error = %err, "Remove skipped");
                return false;
            }
        };

        let owner = context.user_id().to_string();
        let (dt, rid) = (data_type.to_string(), id.to_string());
        match self
            .inner
            .db
            .call(move |conn| records::delete(conn, &owner, &dt, &rid))
            .await
        {
            Ok(removed) => {
                if removed {
                    tracing::debug!(record_id = id, data_type, "Record removed");
                }
                removed
            }
            Err(err) => {
                tracing::warn!(record_id = id, data_type, error = %err, "Failed to remove record");
                false
            }
        }
    }

    pub async fn metadata(
        &self,
        id: &str,
        data_type: &str,
    ) -> Result<Option<RecordMetadata>, StoreError> {
        let context = self.session()?;
        let owner = context.user_id().to_string();
        let (data_type, id) = (data_type.to_string(), id.to_string());
        self.inner
            .db
            .call(move |conn| records::fetch_metadata(conn, &owner, &data_type, &id))
            .await
    }

    pub async fn get_metrics(&self) -> Result<StorageMetrics, StoreError> {
        let context = self.session()?;
        let owner = context.user_id().to_string();
        let rotation_cutoff = self
            .inner
            .clock
            .now()
            .checked_sub_signed(self.inner.crypto.rotation_interval())
            .unwrap_or(DateTime::<Utc>::MIN_UTC);

        let mut metrics = self
            .inner
            .db
            .call(move |conn| records::metrics(conn, &owner, rotation_cutoff))
            .await?;
        metrics.cached_keys = self.inner.crypto.cached_key_count();
        Ok(metrics)
    }

    /// Delete every record of the current user and forget derived keys.
    /// The session itself stays active.
    pub async fn clear_user_data(&self) -> Result<usize, StoreError> {
        let context = self.session()?;
        let owner = context.user_id().to_string();
        let removed = self
            .inner
            .db
            .call(move |conn| records::delete_all_for_owner(conn, &owner))
            .await?;
        self.inner.crypto.clear_key_cache();

        tracing::info!(user_id = context.user_id(), removed, "User data cleared");
        Ok(removed)
    }

    // ─── Session-bound access ────────────────────────────────────────────────
    //
    // For passes that captured a session id before awaiting. Each call works
    // on that session's user, never the currently active one, and fails with
    // `SessionEnded` once it has been replaced.

    pub(crate) async fn list_in_session(
        &self,
        session_id: Uuid,
        data_type: &str,
    ) -> Result<Vec<String>, StoreError> {
        let context = self
            .session_matching(session_id)
            .ok_or(StoreError::SessionEnded)?;
        let owner = context.user_id().to_string();
        let data_type = data_type.to_string();
        self.inner
            .db
            .call(move |conn| records::list_ids(conn, &owner, &data_type))
            .await
    }

    pub(crate) async fn inspect_in_session<T>(
        &self,
        session_id: Uuid,
        id: &str,
        data_type: &str,
    ) -> Result<Option<T>, StoreError>
    where
        T: DeserializeOwned,
    {
        let context = self
            .session_matching(session_id)
            .ok_or(StoreError::SessionEnded)?;
        self.inspect_as(&context, id, data_type).await
    }

    /// Delete a record of the session's user. The session is re-checked under
    /// the connection lock, so a switch that lands mid-pass cannot redirect
    /// the delete to another user's row.
    pub(crate) async fn remove_in_session(
        &self,
        session_id: Uuid,
        id: &str,
        data_type: &str,
    ) -> Result<bool, StoreError> {
        let context = self
            .session_matching(session_id)
            .ok_or(StoreError::SessionEnded)?;
        let owner = context.user_id().to_string();
        let (dt, rid) = (data_type.to_string(), id.to_string());
        let inner = Arc::clone(&self.inner);
        self.inner
            .db
            .call(move |conn| {
                if !inner.is_current(session_id) {
                    return Err(StoreError::SessionEnded);
                }
                records::delete(conn, &owner, &dt, &rid)
            })
            .await
    }

    // ─── Background work ─────────────────────────────────────────────────────

    /// Evict idle records of the current user and purge expired keys.
    pub async fn run_maintenance(&self) -> Result<MaintenanceReport, StoreError> {
        let context = self.session()?;
        self.maintain(context.session_id()).await
    }

    async fn maintain(&self, session_id: Uuid) -> Result<MaintenanceReport, StoreError> {
        let Some(context) = self.session_matching(session_id) else {
            return Ok(MaintenanceReport::default());
        };

        let idle_cutoff = self.inner.config.idle_eviction_days.and_then(|days| {
            let cutoff = self
                .inner
                .clock
                .now()
                .checked_sub_signed(Duration::days(i64::from(days)));
            if cutoff.is_none() {
                tracing::warn!(days, "Idle eviction window out of range, skipping eviction");
            }
            cutoff
        });

        let idle_records_removed = match idle_cutoff {
            Some(cutoff) => {
                let owner = context.user_id().to_string();
                let floors = self.inner.retention_floors.read().clone();
                let now = self.inner.clock.now();
                let keep = move |data_type: &str, encrypted_at: DateTime<Utc>| {
                    match floors.get(data_type) {
                        None => false,
                        Some(None) => true,
                        Some(Some(retention)) => now
                            .checked_sub_signed(*retention)
                            .map_or(true, |window_start| encrypted_at >= window_start),
                    }
                };
                let inner = Arc::clone(&self.inner);
                self.inner
                    .db
                    .call(move |conn| {
                        if !inner.is_current(session_id) {
                            return Ok(0);
                        }
                        records::delete_idle(conn, &owner, cutoff, keep)
                    })
                    .await?
            }
            None => 0,
        };
        let expired_keys_purged = self.inner.crypto.purge_expired_keys();

        if idle_records_removed > 0 || expired_keys_purged > 0 {
            tracing::info!(
                user_id = context.user_id(),
                idle_records_removed,
                expired_keys_purged,
                "Storage maintenance completed"
            );
        }
        Ok(MaintenanceReport {
            idle_records_removed,
            expired_keys_purged,
        })
    }

    fn schedule_maintenance(&self, scope: &TaskScope, session_id: Uuid) {
        let weak = self.downgrade();
        scope.spawn_interval(
            "store-maintenance",
            self.inner.config.maintenance_interval(),
            move || {
                let weak = weak.clone();
                async move {
                    let Some(store) = weak.upgrade() else {
                        return;
                    };
                    if let Err(err) = store.maintain(session_id).await {
                        tracing::warn!(%session_id, error = %err, "Storage maintenance failed");
                    }
                }
            },
        );
    }

    fn schedule_reencryption(&self, session_id: Uuid, record: StorageRecord) {
        let Some(scope) = self.scope_matching(session_id) else {
            return;
        };
        let weak = self.downgrade();

        scope.spawn_after(
            "reencrypt-record",
            self.inner.config.reencrypt_delay(),
            async move {
                let Some(store) = weak.upgrade() else {
                    return;
                };
                let (id, data_type) = (record.id.clone(), record.data_type.clone());
                if let Err(err) = store.reencrypt(session_id, record).await {
                    tracing::warn!(
                        record_id = %id,
                        data_type = %data_type,
                        error = %err,
                        "Background re-encryption failed"
                    );
                }
            },
        );
    }

    /// Re-seal `record` with fresh salt and IV under the current key epoch.
    /// Returns false if the session ended or the row changed in the meantime.
    async fn reencrypt(&self, session_id: Uuid, record: StorageRecord) -> Result<bool, StoreError> {
        let Some(context) = self.session_matching(session_id) else {
            tracing::debug!(record_id = %record.id, "Re-encryption abandoned, session ended");
            return Ok(false);
        };

        let plaintext = self.open(&context, &record).await?;
        let now = self.inner.clock.now();
        let key_epoch = context.epoch_at(now);
        let blob = self
            .inner
            .crypto
            .encrypt(&plaintext, context.user_id(), &context.key_material(key_epoch))
            .await?;

        let inner = Arc::clone(&self.inner);
        let expected_salt = record.blob.salt;
        let StorageRecord {
            id,
            data_type,
            owner_user_id,
            ..
        } = record;
        let (log_id, log_type) = (id.clone(), data_type.clone());

        let swapped = self
            .inner
            .db
            .call(move |conn| {
                if !inner.is_current(session_id) {
                    return Ok(false);
                }
                records::replace_blob_if_unchanged(
                    conn,
                    &owner_user_id,
                    &data_type,
                    &id,
                    &expected_salt,
                    &blob,
                    key_epoch,
                    now,
                )
            })
            .await?;

        if swapped {
            tracing::debug!(record_id = %log_id, data_type = %log_type, "Record re-encrypted");
        } else {
            tracing::debug!(
                record_id = %log_id,
                data_type = %log_type,
                "Re-encryption skipped, record changed or session ended"
            );
        }
        Ok(swapped)
    }
}

impl std::fmt::Debug for EncryptedStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let active = self.inner.active.read();
        f.debug_struct("EncryptedStore")
            .field("session", &active.as_ref().map(|a| a.context.session_id()))
            .field("read_mode", &self.inner.config.read_mode)
            .finish_non_exhaustive()
    }
}

/// Weak counterpart of [`EncryptedStore`].
#[derive(Clone)]
pub struct WeakStore(Weak<StoreInner>);

impl WeakStore {
    pub fn upgrade(&self) -> Option<EncryptedStore> {
        self.0.upgrade().map(|inner| EncryptedStore { inner })
    }
}

fn check_identity(id: &str, data_type: &str) -> Result<(), StoreError> {
    if id.is_empty() {
        return Err(StoreError::InvalidInput("record id must not be empty".into()));
    }
    if data_type.is_empty() {
        return Err(StoreError::InvalidInput("data type must not be empty".into()));
    }
    Ok(())
}

// ─── Tests ───────────────────────────────────────────────────────────────────
