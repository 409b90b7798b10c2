// FieldVault — CLI Command Handlers
//
// Each function handles one CLI subcommand. Commands that touch records open
// the database, start a session for `--user`/`--token`, do their work, and
// shut the session down again so no background task outlives the process.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::classify::{ClassificationTable, DataKind, SecureStorage};
use crate::clock::SystemClock;
use crate::config::VaultConfig;
use crate::crypto::CryptoCore;
use crate::error::FieldVaultError;
use crate::store::{Database, EncryptedStore};

use super::{Cli, Commands, GlobalArgs};

/// Default directory for FieldVault data files.
fn data_dir() -> PathBuf {
    let base = dirs_next::data_dir().unwrap_or_else(|| PathBuf::from("."));
    base.join("fieldvault")
}

/// Path to the record database.
fn db_path(global: &GlobalArgs) -> PathBuf {
    global
        .db
        .clone()
        .unwrap_or_else(|| data_dir().join("fieldvault.db"))
}

/// Execute the parsed CLI command.
pub async fn execute(cli: Cli) -> Result<(), FieldVaultError> {
    let global = cli.global;
    match cli.command {
        Commands::Init => cmd_init(&global).await,
        Commands::Put {
            kind,
            id,
            data,
            file,
        } => cmd_put(&global, kind, id, data, file).await,
        Commands::Get { kind, id } => cmd_get(&global, kind, id).await,
        Commands::List { kind } => cmd_list(&global, kind).await,
        Commands::Remove { kind, id } => cmd_remove(&global, kind, id).await,
        Commands::Metrics => cmd_metrics(&global).await,
        Commands::Cleanup => cmd_cleanup(&global).await,
        Commands::Clear { yes } => cmd_clear(&global, yes).await,
        Commands::Classifications => cmd_classifications(&global),
    }
}

// ─── Init ────────────────────────────────────────────────────────────────────

async fn cmd_init(global: &GlobalArgs) -> Result<(), FieldVaultError> {
    let config = load_config(global.config.as_deref())?;
    let table = ClassificationTable::load(config.classification.table_path.as_deref())?;

    let crypto = CryptoCore::new(&config.crypto, Arc::new(SystemClock));
    crypto.self_test().await?;

    let path = db_path(global);
    let _db = Database::open(&path)?;

    println!("✓ FieldVault initialized successfully");
    println!("  Database:        {}", path.display());
    println!("  KDF iterations:  {}", config.crypto.kdf_iterations);
    println!("  Classifications: {} data kinds", table.iter().count());
    println!();
    println!("Next: store a record with `fieldvault put <kind> <id> --data '<json>'`");

    Ok(())
}

// ─── Records ─────────────────────────────────────────────────────────────────

async fn cmd_put(
    global: &GlobalArgs,
    kind: DataKind,
    id: String,
    data: Option<String>,
    file: Option<PathBuf>,
) -> Result<(), FieldVaultError> {
    let raw = match (data, file) {
        (Some(data), _) => data,
        (None, Some(file)) => std::fs::read_to_string(file)?,
        (None, None) => {
            return Err(FieldVaultError::Other(
                "Provide the payload with --data '<json>' or --file <path>".to_string(),
            ))
        }
    };
    let payload: serde_json::Value = serde_json::from_str(&raw)?;

    with_session(global, |secure| async move {
        secure.store_record(kind, &id, &payload).await?;
        println!("✓ Stored {} '{}'", kind, id);
        Ok::<_, FieldVaultError>(())
    })
    .await
}

async fn cmd_get(global: &GlobalArgs, kind: DataKind, id: String) -> Result<(), FieldVaultError> {
    with_session(global, |secure| async move {
        match secure.get_record::<serde_json::Value>(kind, &id).await? {
            Some(payload) => println!("{}", serde_json::to_string_pretty(&payload)?),
            None => println!("No {} record '{}' (absent or unreadable)", kind, id),
        }
        Ok::<_, FieldVaultError>(())
    })
    .await
}

async fn cmd_list(global: &GlobalArgs, kind: DataKind) -> Result<(), FieldVaultError> {
    with_session(global, |secure| async move {
        let ids = secure.list(kind).await?;
        if ids.is_empty() {
            println!("No {} records stored.", kind);
            return Ok(());
        }

        println!("{} records ({}):\n", kind, ids.len());
        for id in &ids {
            match secure.store().metadata(id, kind.as_key()).await? {
                Some(meta) => println!(
                    "  {:24} │ {:>8} bytes │ last read {}",
                    id,
                    meta.original_size,
                    meta.last_accessed_at.format("%Y-%m-%d %H:%M:%S UTC"),
                ),
                None => println!("  {}", id),
            }
        }
        Ok::<_, FieldVaultError>(())
    })
    .await
}

async fn cmd_remove(global: &GlobalArgs, kind: DataKind, id: String) -> Result<(), FieldVaultError> {
    with_session(global, |secure| async move {
        if secure.remove_record(kind, &id).await {
            println!("✓ Removed {} '{}'", kind, id);
        } else {
            println!("No {} record '{}' to remove", kind, id);
        }
        Ok::<_, FieldVaultError>(())
    })
    .await
}

// ─── Maintenance ─────────────────────────────────────────────────────────────

async fn cmd_metrics(global: &GlobalArgs) -> Result<(), FieldVaultError> {
    with_session(global, |secure| async move {
        let metrics = secure.get_storage_metrics().await?;

        println!("Storage metrics:\n");
        println!("  Records:         {}", metrics.total_records);
        println!("  Plaintext bytes: {}", metrics.total_original_bytes);
        println!("  Stored bytes:    {}", metrics.total_encrypted_bytes);
        println!("  Rotation due:    {}", metrics.rotation_due);
        if !metrics.by_data_type.is_empty() {
            println!();
            for (data_type, m) in &metrics.by_data_type {
                println!(
                    "  {:14} │ {:>5} records │ {:>10} bytes │ {:>4} rotation due",
                    data_type, m.count, m.encrypted_bytes, m.rotation_due
                );
            }
        }
        Ok::<_, FieldVaultError>(())
    })
    .await
}

async fn cmd_cleanup(global: &GlobalArgs) -> Result<(), FieldVaultError> {
    with_session(global, |secure| async move {
        let report = secure.perform_data_cleanup().await?;
        println!("✓ Retention cleanup finished");
        println!("  Removed: {}", report.items_removed);
        if !report.data_types.is_empty() {
            println!("  Kinds:   {}", report.data_types.join(", "));
        }
        if report.skipped > 0 {
            println!("  Skipped: {} unreadable record(s)", report.skipped);
        }
        Ok::<_, FieldVaultError>(())
    })
    .await
}

async fn cmd_clear(global: &GlobalArgs, yes: bool) -> Result<(), FieldVaultError> {
    if !yes {
        return Err(FieldVaultError::Other(
            "Refusing to delete all records without --yes".to_string(),
        ));
    }

    with_session(global, |secure| async move {
        let removed = secure.clear_all_data().await?;
        println!("✓ Deleted {} record(s)", removed);
        Ok::<_, FieldVaultError>(())
    })
    .await
}

fn cmd_classifications(global: &GlobalArgs) -> Result<(), FieldVaultError> {
    let config = load_config(global.config.as_deref())?;
    let table = ClassificationTable::load(config.classification.table_path.as_deref())?;

    println!("Classification table:\n");
    for c in table.iter() {
        let retention = c
            .retention_days
            .map(|days| format!("{} days", days))
            .unwrap_or_else(|| "indefinite".to_string());
        println!(
            "  {:13} │ {:12} │ encrypt: {:5} │ retain: {:10} │ {}",
            c.data_type.as_key(),
            c.sensitivity.as_str(),
            c.requires_encryption,
            retention,
            c.note,
        );
    }

    Ok(())
}

// ─── Helpers ─────────────────────────────────────────────────────────────────

fn load_config(path: Option<&Path>) -> Result<VaultConfig, FieldVaultError> {
    match path {
        Some(path) => Ok(VaultConfig::from_file(path)?),
        None => Ok(VaultConfig::default()),
    }
}

/// Open the store, start a session for the CLI user, run `f`, then shut the
/// session down whether or not `f` succeeded.
async fn with_session<F, Fut>(global: &GlobalArgs, f: F) -> Result<(), FieldVaultError>
where
    F: FnOnce(SecureStorage) -> Fut,
    Fut: std::future::Future<Output = Result<(), FieldVaultError>>,
{
    let user = global.user.as_deref().ok_or_else(|| {
        FieldVaultError::Other("--user (or FIELDVAULT_USER) is required".to_string())
    })?;
    let token = global.token.as_deref().ok_or_else(|| {
        FieldVaultError::Other(
            "--token (or FIELDVAULT_SESSION_TOKEN) is required".to_string(),
        )
    })?;

    let config = load_config(global.config.as_deref())?;
    let table = ClassificationTable::load(config.classification.table_path.as_deref())?;

    let path = db_path(global);
    if !path.exists() {
        return Err(FieldVaultError::Other(format!(
            "Database not found at {}. Run `fieldvault init` first.",
            path.display()
        )));
    }
    let db = Database::open(&path)?;

    let store = EncryptedStore::new(db, &config, Arc::new(SystemClock));
    let secure = SecureStorage::new(
        store,
        table,
        config.classification.retention_sweep_interval(),
    );
    secure.initialize(user, token).await?;

    let result = f(secure.clone()).await;
    secure.shutdown().await;
    result
}
