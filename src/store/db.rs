// FieldVault — SQLite Database Management
//
// Opens the record database, applies hardening pragmas and runs schema
// migrations. The single connection is shared behind a mutex; async callers
// go through `call()`, which runs the closure on tokio's blocking pool.

use std::path::Path;
use std::sync::Arc;

use parking_lot::Mutex;
use rusqlite::{Connection, OpenFlags};

use super::StoreError;

/// Shared handle to the record database.
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    /// Open (or create) the database file at `path`.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;

        Self::from_connection(conn)
    }

    /// Open a private in-memory database.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self, StoreError> {
        // Deleted rows are overwritten on disk; no WAL file lingers.
        conn.execute_batch(
            "
            PRAGMA journal_mode = DELETE;
            PRAGMA secure_delete = ON;
            PRAGMA temp_store = MEMORY;
            ",
        )?;
        Self::run_migrations(&conn)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Run `f` against the connection on the blocking pool.
    pub async fn call<F, R>(&self, f: F) -> Result<R, StoreError>
    where
        F: FnOnce(&Connection) -> Result<R, StoreError> + Send + 'static,
        R: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let guard = conn.lock();
            f(&*guard)
        })
        .await
        .map_err(|e| StoreError::Task(e.to_string()))?
    }

    /// Synchronous access for setup code and tests.
    pub fn with_conn<R>(&self, f: impl FnOnce(&Connection) -> R) -> R {
        let guard = self.conn.lock();
        f(&*guard)
    }

    /// Create or update tables.
    fn run_migrations(conn: &Connection) -> Result<(), StoreError> {
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS storage_records (
                id                  TEXT NOT NULL,
                data_type           TEXT NOT NULL,
                owner_user_id       TEXT NOT NULL,
                ciphertext          BLOB NOT NULL,
                iv                  BLOB NOT NULL,
                salt                BLOB NOT NULL,
                blob_timestamp      INTEGER NOT NULL,
                key_epoch           INTEGER NOT NULL,
                original_size       INTEGER NOT NULL,
                encrypted_at        INTEGER NOT NULL,
                last_accessed_at    INTEGER NOT NULL,
                PRIMARY KEY (id, data_type, owner_user_id)
            );

            CREATE INDEX IF NOT EXISTS idx_records_type_owner
                ON storage_records(data_type, owner_user_id);

            CREATE INDEX IF NOT EXISTS idx_records_last_accessed
                ON storage_records(last_accessed_at);
            ",
        )?;

        tracing::debug!("Database migrations completed successfully");
        Ok(())
    }
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database").finish_non_exhaustive()
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
