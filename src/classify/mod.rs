// FieldVault — Classification Module
//
// Sensitivity and retention policy per data kind, and the typed storage
// facade that applies it on top of the encrypted store.

mod error;
mod policy;
mod secure;

pub use error::ClassifyError;
pub use policy::{
    Classification, ClassificationTable, DataKind, Sensitivity, MAX_RETENTION_DAYS,
};
pub use secure::{CleanupReport, SecureStorage, StampedRecord};
