// FieldVault — Data classification policy
//
// Maps every domain data kind to a sensitivity level and retention window.
// The table is data, not code: a built-in JSON default is compiled in and an
// operator can point the config at a replacement file. Either way the table
// must cover every `DataKind` before anything is stored.

use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::ClassifyError;

const BUILTIN_TABLE: &str = include_str!("classifications.json");

/// Longest accepted retention window (100 years).
pub const MAX_RETENTION_DAYS: u32 = 36_500;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Sensitivity {
    Public,
    Internal,
    Confidential,
    Restricted,
}

impl Sensitivity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Sensitivity::Public => "public",
            Sensitivity::Internal => "internal",
            Sensitivity::Confidential => "confidential",
            Sensitivity::Restricted => "restricted",
        }
    }
}

impl fmt::Display for Sensitivity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Domain entity kinds the application stores locally.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataKind {
    Assessment,
    Incident,
    Response,
    UserProfile,
    Commitment,
    AuthToken,
}

impl DataKind {
    pub const ALL: [DataKind; 6] = [
        DataKind::Assessment,
        DataKind::Incident,
        DataKind::Response,
        DataKind::UserProfile,
        DataKind::Commitment,
        DataKind::AuthToken,
    ];

    /// Storage key used as the record `data_type`.
    pub fn as_key(&self) -> &'static str {
        match self {
            DataKind::Assessment => "assessment",
            DataKind::Incident => "incident",
            DataKind::Response => "response",
            DataKind::UserProfile => "user_profile",
            DataKind::Commitment => "commitment",
            DataKind::AuthToken => "auth_token",
        }
    }

    fn index(&self) -> usize {
        *self as usize
    }
}

impl fmt::Display for DataKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_key())
    }
}

impl FromStr for DataKind {
    type Err = ClassifyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase().replace('-', "_");
        DataKind::ALL
            .into_iter()
            .find(|kind| kind.as_key() == normalized)
            .ok_or_else(|| ClassifyError::UnknownKind(s.to_string()))
    }
}

/// Policy for one data kind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Classification {
    pub data_type: DataKind,
    pub sensitivity: Sensitivity,
    pub requires_encryption: bool,
    /// `None` means the data is kept until removed explicitly.
    pub retention_days: Option<u32>,
    pub note: String,
}

impl Classification {
    pub fn retention(&self) -> Option<chrono::Duration> {
        self.retention_days
            .map(|days| chrono::Duration::days(i64::from(days)))
    }
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct RawTable {
    #[allow(dead_code)]
    version: u32,
    classifications: BTreeMap<String, RawEntry>,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct RawEntry {
    sensitivity: Sensitivity,
    requires_encryption: bool,
    retention_days: Option<u32>,
    #[serde(default)]
    note: String,
}

/// Validated classification table with exactly one entry per `DataKind`.
#[derive(Debug, Clone)]
pub struct ClassificationTable {
    /// Indexed by `DataKind::index()`.
    entries: Vec<Classification>,
}

impl ClassificationTable {
    /// The table compiled into the binary.
    pub fn builtin() -> Result<Self, ClassifyError> {
        Self::from_json(BUILTIN_TABLE)
    }

    /// Load `path` if given, otherwise the built-in table.
    pub fn load(path: Option<&Path>) -> Result<Self, ClassifyError> {
        match path {
            Some(path) => {
                let raw = std::fs::read_to_string(path).map_err(|source| ClassifyError::Io {
                    path: path.to_path_buf(),
                    source,
                })?;
                let table = Self::from_json(&raw)?;
                tracing::info!(path = %path.display(), "Loaded classification table");
                Ok(table)
            }
            None => Self::builtin(),
        }
    }

    pub fn from_json(raw: &str) -> Result<Self, ClassifyError> {
        let mut table: RawTable = serde_json::from_str(raw)?;

        if let Some(unknown) = table
            .classifications
            .keys()
            .find(|key| key.parse::<DataKind>().is_err())
        {
            return Err(ClassifyError::UnknownKind(unknown.clone()));
        }

        let mut entries = Vec::with_capacity(DataKind::ALL.len());
        for kind in DataKind::ALL {
            let raw = table
                .classifications
                .remove(kind.as_key())
                .ok_or_else(|| ClassifyError::MissingKind(kind.as_key().to_string()))?;
            entries.push(Classification {
                data_type: kind,
                sensitivity: raw.sensitivity,
                requires_encryption: raw.requires_encryption,
                retention_days: raw.retention_days,
                note: raw.note,
            });
        }

        let table = Self { entries };
        table.validate()?;
        Ok(table)
    }

    /// Check the policy rules every table must satisfy.
    pub fn validate(&self) -> Result<(), ClassifyError> {
        for (position, kind) in DataKind::ALL.iter().enumerate() {
            let entry = self
                .entries
                .get(position)
                .filter(|entry| entry.data_type == *kind)
                .ok_or_else(|| ClassifyError::MissingKind(kind.as_key().to_string()))?;

            match entry.retention_days {
                Some(0) => {
                    return Err(ClassifyError::InvalidPolicy {
                        kind: kind.as_key().to_string(),
                        reason: "retention_days must be positive or null".into(),
                    })
                }
                Some(days) if days > MAX_RETENTION_DAYS => {
                    return Err(ClassifyError::InvalidPolicy {
                        kind: kind.as_key().to_string(),
                        reason: format!("retention_days must not exceed {}", MAX_RETENTION_DAYS),
                    })
                }
                _ => {}
            }
            if entry.sensitivity >= Sensitivity::Confidential && !entry.requires_encryption {
                return Err(ClassifyError::InvalidPolicy {
                    kind: kind.as_key().to_string(),
                    reason: format!("{} data must require encryption", entry.sensitivity),
                });
            }
        }
        Ok(())
    }

    pub fn classify(&self, kind: DataKind) -> &Classification {
        &self.entries[kind.index()]
    }

    pub fn get_classification(&self, key: &str) -> Result<&Classification, ClassifyError> {
        Ok(self.classify(key.parse()?))
    }

    /// Unknown keys are treated as requiring encryption.
    pub fn requires_encryption(&self, key: &str) -> bool {
        self.get_classification(key)
            .map(|c| c.requires_encryption)
            .unwrap_or(true)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Classification> {
        self.entries.iter()
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
