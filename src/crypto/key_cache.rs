// FieldVault — Derived key cache
//
// PBKDF2 is deliberately slow, so a key derived for one blob is reused for
// later reads of that blob within the same session. Entries expire after one
// rotation interval and the cache is bounded; the oldest-expiring entry is
// evicted first when it is full.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use super::cipher::{DerivedKey, SALT_LEN};

/// Cache identity of a derived key. The key-material fingerprint is part of
/// the identity so a different session secret can never hit a warm entry.
#[derive(Clone, PartialEq, Eq, Hash)]
pub(crate) struct CacheKey {
    user_id: String,
    salt: [u8; SALT_LEN],
    material: [u8; 32],
}

impl CacheKey {
    pub(crate) fn new(user_id: &str, salt: &[u8; SALT_LEN], material: [u8; 32]) -> Self {
        Self {
            user_id: user_id.to_string(),
            salt: *salt,
            material,
        }
    }
}

struct CacheEntry {
    key: DerivedKey,
    expires_at: DateTime<Utc>,
}

pub(crate) struct KeyCache {
    entries: Mutex<HashMap<CacheKey, CacheEntry>>,
    capacity: usize,
}

impl KeyCache {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            capacity: capacity.max(1),
        }
    }

    pub(crate) fn get(&self, key: &CacheKey, now: DateTime<Utc>) -> Option<DerivedKey> {
        let mut entries = self.entries.lock();
        match entries.get(key) {
            Some(entry) if entry.expires_at > now => Some(entry.key.clone()),
            Some(_) => {
                entries.remove(key);
                None
            }
            None => None,
        }
    }

    pub(crate) fn insert(&self, key: CacheKey, derived: DerivedKey, expires_at: DateTime<Utc>) {
        let mut entries = self.entries.lock();

        if entries.len() >= self.capacity && !entries.contains_key(&key) {
            let oldest = entries
                .iter()
                .min_by_key(|(_, entry)| entry.expires_at)
                .map(|(k, _)| k.clone());
            if let Some(oldest) = oldest {
                entries.remove(&oldest);
            }
        }

        entries.insert(
            key,
            CacheEntry {
                key: derived,
                expires_at,
            },
        );
    }

    /// Drop every entry whose expiry has passed. Returns how many were dropped.
    pub(crate) fn purge_expired(&self, now: DateTime<Utc>) -> usize {
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|_, entry| entry.expires_at > now);
        before - entries.len()
    }

    pub(crate) fn clear(&self) -> usize {
        let mut entries = self.entries.lock();
        let count = entries.len();
        entries.clear();
        count
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.lock().len()
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::derive_key;
    use chrono::{Duration, TimeZone};

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap()
    }

    fn key(user: &str, salt_byte: u8) -> CacheKey {
        CacheKey::new(user, &[salt_byte; SALT_LEN], [7u8; 32])
    }

    fn derived() -> DerivedKey {
        derive_key(b"material", &[1u8; SALT_LEN], 10).unwrap()
    }

    #[test]
    fn test_entry_is_served_until_expiry() {
        let cache = KeyCache::new(8);
        cache.insert(key("u1", 1), derived(), t0() + Duration::hours(24));

        assert!(cache.get(&key("u1", 1), t0()).is_some());
        assert!(cache.get(&key("u1", 1), t0() + Duration::hours(23)).is_some());
        assert!(cache.get(&key("u1", 1), t0() + Duration::hours(24)).is_none());
        assert_eq!(cache.len(), 0, "Expired entry should be dropped on lookup");
    }

    #[test]
    fn test_lookup_is_scoped_to_user_and_material() {
        let cache = KeyCache::new(8);
        cache.insert(key("u1", 1), derived(), t0() + Duration::hours(1));

        assert!(cache.get(&key("u2", 1), t0()).is_none());
        let other_material = CacheKey::new("u1", &[1u8; SALT_LEN], [8u8; 32]);
        assert!(cache.get(&other_material, t0()).is_none());
    }

    #[test]
    fn test_purge_expired_keeps_live_entries() {
        let cache = KeyCache::new(8);
        cache.insert(key("u1", 1), derived(), t0() + Duration::hours(1));
        cache.insert(key("u1", 2), derived(), t0() + Duration::hours(48));

        let purged = cache.purge_expired(t0() + Duration::hours(2));
        assert_eq!(purged, 1);
        assert_eq!(cache.len(), 1);
        assert!(cache.get(&key("u1", 2), t0() + Duration::hours(2)).is_some());
    }

    #[test]
    fn test_capacity_evicts_oldest_expiry_first() {
        let cache = KeyCache::new(2);
        cache.insert(key("u1", 1), derived(), t0() + Duration::hours(5));
        cache.insert(key("u1", 2), derived(), t0() + Duration::hours(1));
        cache.insert(key("u1", 3), derived(), t0() + Duration::hours(3));

        assert_eq!(cache.len(), 2);
        assert!(cache.get(&key("u1", 2), t0()).is_none());
        assert!(cache.get(&key("u1", 1), t0()).is_some());
        assert!(cache.get(&key("u1", 3), t0()).is_some());
    }

    #[test]
    fn test_clear_empties_cache() {
        let cache = KeyCache::new(8);
        cache.insert(key("u1", 1), derived(), t0() + Duration::hours(1));
        cache.insert(key("u2", 1), derived(), t0() + Duration::hours(1));

        assert_eq!(cache.clear(), 2);
        assert_eq!(cache.len(), 0);
    }
}
