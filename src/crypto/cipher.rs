// FieldVault — Record cipher
//
// Flow for every encrypt call:
//   1. fresh 256-bit salt and 96-bit IV from the OS RNG
//   2. PBKDF2-HMAC-SHA256(key material, salt) -> 256-bit AES key (cached)
//   3. AES-256-GCM with the user id as associated data
//
// Binding the user id as AAD means a blob cannot be opened under another
// user's identity even if the symmetric key were shared.

use std::fmt;
use std::sync::Arc;

use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes256Gcm, Nonce};
use chrono::{DateTime, Utc};
use hmac::Hmac;
use rand::RngCore;
use sha2::{Digest, Sha256};
use zeroize::Zeroizing;

use super::key_cache::{CacheKey, KeyCache};
use super::CryptoError;
use crate::clock::Clock;
use crate::config::CryptoConfig;

// ─── Constants ───────────────────────────────────────────────────────────────

/// Length of a derived AES-256 key in bytes.
pub const KEY_LEN: usize = 32;

/// Length of the per-blob KDF salt in bytes (256-bit).
pub const SALT_LEN: usize = 32;

/// Length of the AES-GCM nonce in bytes (96-bit).
pub const IV_LEN: usize = 12;

/// Length of the AES-GCM authentication tag in bytes.
pub const TAG_LEN: usize = 16;

const FINGERPRINT_DOMAIN: &[u8] = b"fieldvault/key-material-fingerprint/v1";

// ─── Key material ────────────────────────────────────────────────────────────

/// Secret input to the KDF. Never a usable cipher key on its own.
#[derive(Clone)]
pub struct KeyMaterial(Zeroizing<Vec<u8>>);

impl KeyMaterial {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self(Zeroizing::new(bytes))
    }

    /// Random key material, used by the crypto self-test.
    pub fn random() -> Self {
        let mut bytes = vec![0u8; KEY_LEN];
        rand::rng().fill_bytes(&mut bytes);
        Self::new(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// One-way identifier used to scope cache entries to this material.
    pub(crate) fn fingerprint(&self) -> [u8; 32] {
        let mut hasher = Sha256::new();
        hasher.update(FINGERPRINT_DOMAIN);
        hasher.update(self.0.as_slice());
        hasher.finalize().into()
    }
}

impl fmt::Debug for KeyMaterial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("KeyMaterial([REDACTED])")
    }
}

// ─── Derived key ─────────────────────────────────────────────────────────────

/// A 256-bit AES-GCM key. Only usable for sealing and opening payloads.
#[derive(Clone)]
pub struct DerivedKey(Zeroizing<[u8; KEY_LEN]>);

impl DerivedKey {
    fn cipher(&self) -> Result<Aes256Gcm, CryptoError> {
        Aes256Gcm::new_from_slice(self.0.as_slice())
            .map_err(|e| CryptoError::Derivation(format!("invalid key length: {}", e)))
    }

    pub fn seal(
        &self,
        iv: &[u8; IV_LEN],
        plaintext: &[u8],
        aad: &[u8],
    ) -> Result<Vec<u8>, CryptoError> {
        self.cipher()?
            .encrypt(
                Nonce::from_slice(iv),
                Payload {
                    msg: plaintext,
                    aad,
                },
            )
            .map_err(|_| CryptoError::Encryption)
    }

    pub fn open(
        &self,
        iv: &[u8; IV_LEN],
        ciphertext: &[u8],
        aad: &[u8],
    ) -> Result<Zeroizing<Vec<u8>>, CryptoError> {
        let plaintext = self
            .cipher()?
            .decrypt(
                Nonce::from_slice(iv),
                Payload {
                    msg: ciphertext,
                    aad,
                },
            )
            .map_err(|_| CryptoError::Authentication)?;
        Ok(Zeroizing::new(plaintext))
    }
}

impl fmt::Debug for DerivedKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("DerivedKey([REDACTED])")
    }
}

/// PBKDF2-HMAC-SHA256 key derivation. Blocking and intentionally slow.
pub fn derive_key(secret: &[u8], salt: &[u8], iterations: u32) -> Result<DerivedKey, CryptoError> {
    if iterations == 0 {
        return Err(CryptoError::Derivation("iteration count must be positive".into()));
    }
    if salt.is_empty() {
        return Err(CryptoError::Derivation("salt must not be empty".into()));
    }

    let mut key = Zeroizing::new([0u8; KEY_LEN]);
    pbkdf2::pbkdf2::<Hmac<Sha256>>(secret, salt, iterations, &mut key[..])
        .map_err(|e| CryptoError::Derivation(format!("PBKDF2 failed: {}", e)))?;

    Ok(DerivedKey(key))
}

// ─── Encrypted blob ──────────────────────────────────────────────────────────

/// Opaque encrypted payload as persisted.
#[derive(Clone, PartialEq, Eq)]
pub struct EncryptedBlob {
    /// AES-GCM ciphertext with the 16-byte tag appended.
    pub ciphertext: Vec<u8>,
    pub iv: [u8; IV_LEN],
    pub salt: [u8; SALT_LEN],
    pub timestamp: DateTime<Utc>,
}

impl EncryptedBlob {
    /// Rebuild a blob from stored columns, rejecting structurally invalid parts.
    pub fn from_parts(
        ciphertext: Vec<u8>,
        iv: &[u8],
        salt: &[u8],
        timestamp: DateTime<Utc>,
    ) -> Result<Self, CryptoError> {
        let iv: [u8; IV_LEN] = iv.try_into().map_err(|_| {
            CryptoError::Malformed(format!("iv must be {} bytes, got {}", IV_LEN, iv.len()))
        })?;
        let salt: [u8; SALT_LEN] = salt.try_into().map_err(|_| {
            CryptoError::Malformed(format!(
                "salt must be {} bytes, got {}",
                SALT_LEN,
                salt.len()
            ))
        })?;
        let blob = Self {
            ciphertext,
            iv,
            salt,
            timestamp,
        };
        blob.check_structure()?;
        Ok(blob)
    }

    fn check_structure(&self) -> Result<(), CryptoError> {
        if self.ciphertext.len() < TAG_LEN {
            return Err(CryptoError::Malformed(format!(
                "ciphertext shorter than the {}-byte tag",
                TAG_LEN
            )));
        }
        Ok(())
    }
}

impl fmt::Debug for EncryptedBlob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EncryptedBlob")
            .field("ciphertext", &format_args!("[{} bytes]", self.ciphertext.len()))
            .field("timestamp", &self.timestamp)
            .finish_non_exhaustive()
    }
}

// ─── Crypto core ─────────────────────────────────────────────────────────────

/// Stateless cipher operations plus the ephemeral derived-key cache.
pub struct CryptoCore {
    iterations: u32,
    rotation_interval: chrono::Duration,
    cache: KeyCache,
    clock: Arc<dyn Clock>,
}

impl CryptoCore {
    pub fn new(config: &CryptoConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            iterations: config.kdf_iterations,
            rotation_interval: config.rotation_interval(),
            cache: KeyCache::new(config.max_cached_keys),
            clock,
        }
    }

    pub fn rotation_interval(&self) -> chrono::Duration {
        self.rotation_interval
    }

    /// Derive a key on the blocking pool with the configured iteration count.
    pub async fn derive_key(
        &self,
        material: &KeyMaterial,
        salt: &[u8; SALT_LEN],
    ) -> Result<DerivedKey, CryptoError> {
        let secret = material.clone();
        let salt = *salt;
        let iterations = self.iterations;

        tokio::task::spawn_blocking(move || derive_key(secret.as_bytes(), &salt, iterations))
            .await
            .map_err(|e| CryptoError::Task(e.to_string()))?
    }

    async fn key_for(
        &self,
        user_id: &str,
        material: &KeyMaterial,
        salt: &[u8; SALT_LEN],
    ) -> Result<DerivedKey, CryptoError> {
        let cache_key = CacheKey::new(user_id, salt, material.fingerprint());
        if let Some(key) = self.cache.get(&cache_key, self.clock.now()) {
            return Ok(key);
        }

        let key = self.derive_key(material, salt).await?;
        let expires_at = self
            .clock
            .now()
            .checked_add_signed(self.rotation_interval)
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        self.cache.insert(cache_key, key.clone(), expires_at);
        Ok(key)
    }

    pub async fn encrypt(
        &self,
        plaintext: &[u8],
        user_id: &str,
        material: &KeyMaterial,
    ) -> Result<EncryptedBlob, CryptoError> {
        let mut salt = [0u8; SALT_LEN];
        let mut iv = [0u8; IV_LEN];
        {
            // ThreadRng is !Send; keep it out of the await below.
            let mut rng = rand::rng();
            rng.fill_bytes(&mut salt);
            rng.fill_bytes(&mut iv);
        }

        let key = self.key_for(user_id, material, &salt).await?;
        let ciphertext = key.seal(&iv, plaintext, user_id.as_bytes())?;

        Ok(EncryptedBlob {
            ciphertext,
            iv,
            salt,
            timestamp: self.clock.now(),
        })
    }

    pub async fn decrypt(
        &self,
        blob: &EncryptedBlob,
        user_id: &str,
        material: &KeyMaterial,
    ) -> Result<Zeroizing<Vec<u8>>, CryptoError> {
        blob.check_structure()?;
        let key = self.key_for(user_id, material, &blob.salt).await?;
        key.open(&blob.iv, &blob.ciphertext, user_id.as_bytes())
    }

    /// True once the blob is older than the rotation interval.
    pub fn needs_reencryption(&self, blob: &EncryptedBlob) -> bool {
        self.clock.now() - blob.timestamp > self.rotation_interval
    }

    pub fn clear_key_cache(&self) {
        let evicted = self.cache.clear();
        tracing::debug!(evicted, "Derived key cache cleared");
    }

    pub fn purge_expired_keys(&self) -> usize {
        self.cache.purge_expired(self.clock.now())
    }

    pub fn cached_key_count(&self) -> usize {
        self.cache.len()
    }

    /// Round-trip a random probe and confirm that user binding holds.
    pub async fn self_test(&self) -> Result<(), CryptoError> {
        const PROBE: &[u8] = b"fieldvault-self-test";
        let material = KeyMaterial::random();

        let blob = self.encrypt(PROBE, "self-test", &material).await?;
        let opened = self.decrypt(&blob, "self-test", &material).await?;
        if opened.as_slice() != PROBE {
            return Err(CryptoError::Authentication);
        }
        if self.decrypt(&blob, "self-test-other", &material).await.is_ok() {
            return Err(CryptoError::Authentication);
        }
        Ok(())
    }
}

impl fmt::Debug for CryptoCore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CryptoCore")
            .field("iterations", &self.iterations)
            .field("rotation_interval", &self.rotation_interval)
            .field("cached_keys", &self.cache.len())
            .finish()
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use chrono::{Duration, TimeZone};

    fn test_core() -> (CryptoCore, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2024, 6, 1, 8, 0, 0).unwrap(),
        ));
        let config = CryptoConfig {
            kdf_iterations: 1_000,
            ..CryptoConfig::default()
        };
        (CryptoCore::new(&config, clock.clone()), clock)
    }

    fn material(tag: &str) -> KeyMaterial {
        KeyMaterial::new(format!("session-material-{}", tag).into_bytes())
    }

    #[test]
    fn test_derive_key_is_deterministic() {
        let a = derive_key(b"secret", &[3u8; SALT_LEN], 1_000).unwrap();
        let b = derive_key(b"secret", &[3u8; SALT_LEN], 1_000).unwrap();
        let iv = [0u8; IV_LEN];

        let sealed = a.seal(&iv, b"payload", b"aad").unwrap();
        let opened = b.open(&iv, &sealed, b"aad").unwrap();
        assert_eq!(opened.as_slice(), b"payload");
    }

    #[test]
    fn test_derive_key_differs_per_salt() {
        let a = derive_key(b"secret", &[3u8; SALT_LEN], 1_000).unwrap();
        let b = derive_key(b"secret", &[4u8; SALT_LEN], 1_000).unwrap();
        let iv = [0u8; IV_LEN];

        let sealed = a.seal(&iv, b"payload", b"aad").unwrap();
        assert!(matches!(
            b.open(&iv, &sealed, b"aad"),
            Err(CryptoError::Authentication)
        ));
    }

    #[test]
    fn test_derive_key_rejects_zero_iterations() {
        assert!(matches!(
            derive_key(b"secret", &[3u8; SALT_LEN], 0),
            Err(CryptoError::Derivation(_))
        ));
    }

    #[test]
    fn test_debug_output_redacts_key_material() {
        let m = KeyMaterial::new(b"very-secret-token".to_vec());
        let k = derive_key(b"very-secret-token", &[1u8; SALT_LEN], 10).unwrap();
        assert!(!format!("{:?}", m).contains("very-secret"));
        assert!(format!("{:?}", k).contains("REDACTED"));
    }

    #[tokio::test]
    async fn test_round_trip() {
        let (core, _) = test_core();
        let m = material("a");
        let payload = br#"{"site":"camp-4","households":112}"#;

        let blob = core.encrypt(payload, "user-a", &m).await.unwrap();
        assert_ne!(blob.ciphertext.as_slice(), payload.as_slice());
        assert_eq!(blob.ciphertext.len(), payload.len() + TAG_LEN);

        let opened = core.decrypt(&blob, "user-a", &m).await.unwrap();
        assert_eq!(opened.as_slice(), payload.as_slice());
    }

    #[tokio::test]
    async fn test_round_trip_empty_payload() {
        let (core, _) = test_core();
        let m = material("a");

        let blob = core.encrypt(b"", "user-a", &m).await.unwrap();
        let opened = core.decrypt(&blob, "user-a", &m).await.unwrap();
        assert!(opened.is_empty());
    }

    #[tokio::test]
    async fn test_fresh_salt_and_iv_per_encrypt() {
        let (core, _) = test_core();
        let m = material("a");

        let first = core.encrypt(b"same", "user-a", &m).await.unwrap();
        let second = core.encrypt(b"same", "user-a", &m).await.unwrap();
        assert_ne!(first.iv, second.iv);
        assert_ne!(first.salt, second.salt);
        assert_ne!(first.ciphertext, second.ciphertext);
    }

    #[tokio::test]
    async fn test_tampered_ciphertext_fails() {
        let (core, _) = test_core();
        let m = material("a");
        let blob = core.encrypt(b"incident report", "user-a", &m).await.unwrap();

        for index in [0, blob.ciphertext.len() / 2, blob.ciphertext.len() - 1] {
            for bit in [0u8, 3, 7] {
                let mut tampered = blob.clone();
                tampered.ciphertext[index] ^= 1 << bit;
                assert!(
                    matches!(
                        core.decrypt(&tampered, "user-a", &m).await,
                        Err(CryptoError::Authentication)
                    ),
                    "Flipping bit {} of byte {} must fail authentication",
                    bit,
                    index
                );
            }
        }
    }

    #[tokio::test]
    async fn test_tampered_iv_fails() {
        let (core, _) = test_core();
        let m = material("a");
        let blob = core.encrypt(b"incident report", "user-a", &m).await.unwrap();

        for index in 0..IV_LEN {
            let mut tampered = blob.clone();
            tampered.iv[index] ^= 0x01;
            assert!(matches!(
                core.decrypt(&tampered, "user-a", &m).await,
                Err(CryptoError::Authentication)
            ));
        }
    }

    #[tokio::test]
    async fn test_tampered_salt_fails() {
        let (core, _) = test_core();
        let m = material("a");
        let blob = core.encrypt(b"incident report", "user-a", &m).await.unwrap();

        for index in [0, SALT_LEN - 1] {
            let mut tampered = blob.clone();
            tampered.salt[index] ^= 0x80;
            assert!(matches!(
                core.decrypt(&tampered, "user-a", &m).await,
                Err(CryptoError::Authentication)
            ));
        }
    }

    #[tokio::test]
    async fn test_blob_is_bound_to_user() {
        let (core, _) = test_core();
        let m = material("shared");
        let blob = core.encrypt(b"assessment", "A", &m).await.unwrap();

        assert!(matches!(
            core.decrypt(&blob, "B", &m).await,
            Err(CryptoError::Authentication)
        ));
        assert!(core.decrypt(&blob, "A", &m).await.is_ok());
    }

    #[tokio::test]
    async fn test_wrong_material_fails_with_warm_cache() {
        let (core, _) = test_core();
        let right = material("right");
        let wrong = material("wrong");

        let blob = core.encrypt(b"assessment", "user-a", &right).await.unwrap();
        // The correct key for this salt is now cached.
        core.decrypt(&blob, "user-a", &right).await.unwrap();

        assert!(matches!(
            core.decrypt(&blob, "user-a", &wrong).await,
            Err(CryptoError::Authentication)
        ));
    }

    #[tokio::test]
    async fn test_short_ciphertext_is_malformed() {
        let (core, clock) = test_core();
        let blob = EncryptedBlob {
            ciphertext: vec![1, 2, 3],
            iv: [0u8; IV_LEN],
            salt: [0u8; SALT_LEN],
            timestamp: clock.now(),
        };

        assert!(matches!(
            core.decrypt(&blob, "user-a", &material("a")).await,
            Err(CryptoError::Malformed(_))
        ));
    }

    #[test]
    fn test_from_parts_rejects_bad_lengths() {
        let now = Utc::now();
        assert!(matches!(
            EncryptedBlob::from_parts(vec![0u8; 32], &[0u8; 11], &[0u8; SALT_LEN], now),
            Err(CryptoError::Malformed(_))
        ));
        assert!(matches!(
            EncryptedBlob::from_parts(vec![0u8; 32], &[0u8; IV_LEN], &[0u8; 16], now),
            Err(CryptoError::Malformed(_))
        ));
        assert!(EncryptedBlob::from_parts(vec![0u8; 32], &[0u8; IV_LEN], &[0u8; SALT_LEN], now)
            .is_ok());
    }

    #[tokio::test]
    async fn test_needs_reencryption_after_rotation_interval() {
        let (core, clock) = test_core();
        let blob = core.encrypt(b"payload", "user-a", &material("a")).await.unwrap();

        assert!(!core.needs_reencryption(&blob));
        clock.advance(Duration::hours(23));
        assert!(!core.needs_reencryption(&blob));
        clock.advance(Duration::hours(2));
        assert!(core.needs_reencryption(&blob));
    }

    #[tokio::test]
    async fn test_key_cache_fills_and_clears() {
        let (core, _) = test_core();
        let m = material("a");

        core.encrypt(b"one", "user-a", &m).await.unwrap();
        core.encrypt(b"two", "user-a", &m).await.unwrap();
        assert_eq!(core.cached_key_count(), 2);

        core.clear_key_cache();
        assert_eq!(core.cached_key_count(), 0);
    }

    #[tokio::test]
    async fn test_cached_keys_expire_after_rotation_interval() {
        let (core, clock) = test_core();
        let m = material("a");
        let blob = core.encrypt(b"payload", "user-a", &m).await.unwrap();

        clock.advance(Duration::hours(25));
        assert_eq!(core.purge_expired_keys(), 1);
        assert_eq!(core.cached_key_count(), 0);

        // Decryption still works by re-deriving.
        let opened = core.decrypt(&blob, "user-a", &m).await.unwrap();
        assert_eq!(opened.as_slice(), b"payload");
    }

    #[tokio::test]
    async fn test_self_test_passes() {
        let (core, _) = test_core();
        assert!(core.self_test().await.is_ok());
    }
}
