// FieldVault — Runtime configuration
//
// Every field has a default, so an empty JSON object (or no file at all)
// yields a production-ready configuration. `validate()` runs before any
// component is constructed from it.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Minimum-acceptable PBKDF2-HMAC-SHA256 iteration count for production use.
pub const DEFAULT_KDF_ITERATIONS: u32 = 100_000;

/// Default key rotation interval (24 hours).
pub const DEFAULT_ROTATION_INTERVAL_SECS: u64 = 24 * 60 * 60;

/// Upper bound for every interval and key epoch width (10 years).
pub const MAX_INTERVAL_SECS: u64 = 10 * 365 * 24 * 60 * 60;

/// Upper bound for `idle_eviction_days` (100 years).
pub const MAX_IDLE_EVICTION_DAYS: u32 = 36_500;

fn clamp_secs(secs: u64) -> i64 {
    // MAX_INTERVAL_SECS fits comfortably in i64 and in chrono's range.
    secs.min(MAX_INTERVAL_SECS) as i64
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Invalid config file: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// How read-path failures are reported to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReadMode {
    /// Undecryptable or unreadable records are reported as absent.
    #[default]
    Lenient,
    /// Authentication, corruption and storage errors are returned as errors.
    Strict,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CryptoConfig {
    pub kdf_iterations: u32,
    pub rotation_interval_secs: u64,
    pub max_cached_keys: usize,
}

impl Default for CryptoConfig {
    fn default() -> Self {
        Self {
            kdf_iterations: DEFAULT_KDF_ITERATIONS,
            rotation_interval_secs: DEFAULT_ROTATION_INTERVAL_SECS,
            max_cached_keys: 256,
        }
    }
}

impl CryptoConfig {
    pub fn rotation_interval(&self) -> chrono::Duration {
        chrono::Duration::seconds(clamp_secs(self.rotation_interval_secs))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Width of the time bucket mixed into session key material.
    pub key_epoch_secs: u64,
    pub read_mode: ReadMode,
    /// Period of the recurring maintenance task.
    pub maintenance_interval_secs: u64,
    /// Opt-in: records not read for this many days are evicted by
    /// maintenance, regardless of their retention class. `None` (the default)
    /// leaves record lifetime to removal, retention cleanup and clearing.
    pub idle_eviction_days: Option<u32>,
    /// Delay before a rotation-due record is re-encrypted in the background.
    pub reencrypt_delay_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            key_epoch_secs: DEFAULT_ROTATION_INTERVAL_SECS,
            read_mode: ReadMode::Lenient,
            maintenance_interval_secs: 60 * 60,
            idle_eviction_days: None,
            reencrypt_delay_ms: 100,
        }
    }
}

impl StoreConfig {
    pub fn key_epoch(&self) -> chrono::Duration {
        chrono::Duration::seconds(clamp_secs(self.key_epoch_secs))
    }

    pub fn maintenance_interval(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.maintenance_interval_secs.min(MAX_INTERVAL_SECS))
    }

    pub fn reencrypt_delay(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.reencrypt_delay_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClassificationConfig {
    /// External classification table. The built-in table is used when unset.
    pub table_path: Option<PathBuf>,
    pub retention_sweep_interval_secs: u64,
}

impl Default for ClassificationConfig {
    fn default() -> Self {
        Self {
            table_path: None,
            retention_sweep_interval_secs: 6 * 60 * 60,
        }
    }
}

impl ClassificationConfig {
    pub fn retention_sweep_interval(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.retention_sweep_interval_secs.min(MAX_INTERVAL_SECS))
    }
}

/// Top-level configuration for a FieldVault instance.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct VaultConfig {
    pub crypto: CryptoConfig,
    pub store: StoreConfig,
    pub classification: ClassificationConfig,
}

impl VaultConfig {
    /// Load and validate a JSON config file.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json(&raw)
    }

    pub fn from_json(raw: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.crypto.kdf_iterations == 0 {
            return Err(ConfigError::Invalid("kdf_iterations must be positive".into()));
        }
        if self.crypto.kdf_iterations < DEFAULT_KDF_ITERATIONS {
            tracing::warn!(
                iterations = self.crypto.kdf_iterations,
                minimum = DEFAULT_KDF_ITERATIONS,
                "KDF iteration count is below the recommended minimum"
            );
        }
        if self.crypto.rotation_interval_secs == 0 {
            return Err(ConfigError::Invalid(
                "rotation_interval_secs must be positive".into(),
            ));
        }
        if self.crypto.max_cached_keys == 0 {
            return Err(ConfigError::Invalid("max_cached_keys must be positive".into()));
        }
        if self.store.key_epoch_secs == 0 {
            return Err(ConfigError::Invalid("key_epoch_secs must be positive".into()));
        }
        if self.store.maintenance_interval_secs == 0 {
            return Err(ConfigError::Invalid(
                "maintenance_interval_secs must be positive".into(),
            ));
        }
        if self.store.idle_eviction_days == Some(0) {
            return Err(ConfigError::Invalid(
                "idle_eviction_days must be positive when set".into(),
            ));
        }
        if self.classification.retention_sweep_interval_secs == 0 {
            return Err(ConfigError::Invalid(
                "retention_sweep_interval_secs must be positive".into(),
            ));
        }
        for (name, secs) in [
            ("rotation_interval_secs", self.crypto.rotation_interval_secs),
            ("key_epoch_secs", self.store.key_epoch_secs),
            ("maintenance_interval_secs", self.store.maintenance_interval_secs),
            (
                "retention_sweep_interval_secs",
                self.classification.retention_sweep_interval_secs,
            ),
        ] {
            if secs > MAX_INTERVAL_SECS {
                return Err(ConfigError::Invalid(format!(
                    "{} must not exceed {}",
                    name, MAX_INTERVAL_SECS
                )));
            }
        }
        if self.store.reencrypt_delay_ms > MAX_INTERVAL_SECS * 1000 {
            return Err(ConfigError::Invalid(format!(
                "reencrypt_delay_ms must not exceed {}",
                MAX_INTERVAL_SECS * 1000
            )));
        }
        if self
            .store
            .idle_eviction_days
            .is_some_and(|days| days > MAX_IDLE_EVICTION_DAYS)
        {
            return Err(ConfigError::Invalid(format!(
                "idle_eviction_days must not exceed {}",
                MAX_IDLE_EVICTION_DAYS
            )));
        }
        Ok(())
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = VaultConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.crypto.kdf_iterations, 100_000);
        assert_eq!(config.crypto.rotation_interval(), chrono::Duration::hours(24));
        assert_eq!(config.store.read_mode, ReadMode::Lenient);
    }

    #[test]
    fn test_empty_json_uses_defaults() {
        let config = VaultConfig::from_json("{}").unwrap();
        assert_eq!(config.store.idle_eviction_days, None);
        assert!(config.classification.table_path.is_none());
    }

    #[test]
    fn test_partial_json_overrides_fields() {
        let config = VaultConfig::from_json(
            r#"{ "crypto": { "kdf_iterations": 200000 }, "store": { "read_mode": "strict" } }"#,
        )
        .unwrap();
        assert_eq!(config.crypto.kdf_iterations, 200_000);
        assert_eq!(config.crypto.max_cached_keys, 256);
        assert_eq!(config.store.read_mode, ReadMode::Strict);
    }

    #[test]
    fn test_zero_iterations_rejected() {
        let result = VaultConfig::from_json(r#"{ "crypto": { "kdf_iterations": 0 } }"#);
        assert!(matches!(result, Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_zero_idle_eviction_rejected() {
        let result = VaultConfig::from_json(r#"{ "store": { "idle_eviction_days": 0 } }"#);
        assert!(matches!(result, Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_oversized_durations_rejected() {
        for json in [
            r#"{ "crypto": { "rotation_interval_secs": 18446744073709551615 } }"#,
            r#"{ "store": { "key_epoch_secs": 9223372036854775808 } }"#,
            r#"{ "store": { "idle_eviction_days": 4000000000 } }"#,
            r#"{ "classification": { "retention_sweep_interval_secs": 18446744073709551615 } }"#,
        ] {
            assert!(
                matches!(VaultConfig::from_json(json), Err(ConfigError::Invalid(_))),
                "accepted {}",
                json
            );
        }
    }

    #[test]
    fn test_unvalidated_durations_do_not_overflow() {
        let mut config = VaultConfig::default();
        config.crypto.rotation_interval_secs = u64::MAX;
        config.store.key_epoch_secs = u64::MAX;

        let cap = chrono::Duration::seconds(MAX_INTERVAL_SECS as i64);
        assert_eq!(config.crypto.rotation_interval(), cap);
        assert_eq!(config.store.key_epoch(), cap);
    }

    #[test]
    fn test_from_file_reports_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let result = VaultConfig::from_file(&dir.path().join("missing.json"));
        assert!(matches!(result, Err(ConfigError::Io { .. })));
    }
}
