// FieldVault — Crypto Module
//
// PBKDF2-HMAC-SHA256 key derivation and AES-256-GCM authenticated encryption
// of record payloads. Derived keys are cached per (user, salt, key material)
// for at most one rotation interval and never leave process memory.

mod cipher;
mod error;
mod key_cache;

pub use cipher::{
    derive_key, CryptoCore, DerivedKey, EncryptedBlob, KeyMaterial, IV_LEN, KEY_LEN, SALT_LEN,
    TAG_LEN,
};
pub use error::CryptoError;
