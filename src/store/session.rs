// FieldVault — Session context
//
// One authenticated user session. Key material is never stored: it is
// recomputed per time bucket from (user id, session token, epoch), so every
// blob sealed under a session can be reopened for as long as that session
// token is presented again.

use std::fmt;

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use uuid::Uuid;
use zeroize::Zeroizing;

use super::StoreError;
use crate::crypto::KeyMaterial;

const MATERIAL_DOMAIN: &[u8] = b"fieldvault/session-key-material/v1";

pub struct SessionContext {
    session_id: Uuid,
    user_id: String,
    token: Zeroizing<String>,
    epoch_width_secs: i64,
    started_at: DateTime<Utc>,
}

impl SessionContext {
    pub fn new(
        user_id: &str,
        session_token: &str,
        started_at: DateTime<Utc>,
        epoch_width: chrono::Duration,
    ) -> Result<Self, StoreError> {
        if user_id.trim().is_empty() {
            return Err(StoreError::InvalidInput("user id must not be empty".into()));
        }
        if session_token.is_empty() {
            return Err(StoreError::InvalidInput("session token must not be empty".into()));
        }
        let epoch_width_secs = epoch_width.num_seconds();
        if epoch_width_secs <= 0 {
            return Err(StoreError::InvalidInput("key epoch width must be positive".into()));
        }

        Ok(Self {
            session_id: Uuid::new_v4(),
            user_id: user_id.to_string(),
            token: Zeroizing::new(session_token.to_string()),
            epoch_width_secs,
            started_at,
        })
    }

    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    /// Time bucket that contains `at`.
    pub fn epoch_at(&self, at: DateTime<Utc>) -> i64 {
        at.timestamp().div_euclid(self.epoch_width_secs)
    }

    /// KDF input for the given time bucket.
    pub fn key_material(&self, epoch: i64) -> KeyMaterial {
        let mut hasher = Sha256::new();
        hasher.update(MATERIAL_DOMAIN);
        hasher.update((self.user_id.len() as u64).to_be_bytes());
        hasher.update(self.user_id.as_bytes());
        hasher.update((self.token.len() as u64).to_be_bytes());
        hasher.update(self.token.as_bytes());
        hasher.update(epoch.to_be_bytes());
        KeyMaterial::new(hasher.finalize().to_vec())
    }
}

impl fmt::Debug for SessionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionContext")
            .field("session_id", &self.session_id)
            .field("user_id", &self.user_id)
            .field("token", &"[REDACTED]")
            .field("epoch_width_secs", &self.epoch_width_secs)
            .field("started_at", &self.started_at)
            .finish()
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 1, 8, 0, 0).unwrap()
    }

    fn session(user: &str, token: &str) -> SessionContext {
        SessionContext::new(user, token, t0(), Duration::hours(24)).unwrap()
    }

    #[test]
    fn test_rejects_empty_inputs() {
        assert!(matches!(
            SessionContext::new("", "tok", t0(), Duration::hours(24)),
            Err(StoreError::InvalidInput(_))
        ));
        assert!(matches!(
            SessionContext::new("u1", "", t0(), Duration::hours(24)),
            Err(StoreError::InvalidInput(_))
        ));
        assert!(matches!(
            SessionContext::new("u1", "tok", t0(), Duration::zero()),
            Err(StoreError::InvalidInput(_))
        ));
    }

    #[test]
    fn test_epoch_buckets_by_width() {
        let s = session("u1", "tok");
        let midnight = Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap();

        assert_eq!(s.epoch_at(midnight), s.epoch_at(t0()));
        assert_eq!(s.epoch_at(midnight + Duration::hours(24)), s.epoch_at(t0()) + 1);
        assert_eq!(
            s.epoch_at(midnight - Duration::seconds(1)),
            s.epoch_at(t0()) - 1
        );
    }

    #[test]
    fn test_key_material_is_stable_within_session() {
        let a = session("u1", "tok");
        let b = session("u1", "tok");
        assert_ne!(a.session_id(), b.session_id());
        assert_eq!(a.key_material(5).as_bytes(), b.key_material(5).as_bytes());
    }

    #[test]
    fn test_key_material_depends_on_every_input() {
        let base = session("u1", "tok").key_material(5);

        assert_ne!(base.as_bytes(), session("u2", "tok").key_material(5).as_bytes());
        assert_ne!(base.as_bytes(), session("u1", "tok2").key_material(5).as_bytes());
        assert_ne!(base.as_bytes(), session("u1", "tok").key_material(6).as_bytes());
        // Length prefixes keep ("u1t", "ok") distinct from ("u1", "tok").
        assert_ne!(base.as_bytes(), session("u1t", "ok").key_material(5).as_bytes());
    }

    #[test]
    fn test_debug_redacts_token() {
        let s = session("u1", "super-secret-token");
        let rendered = format!("{:?}", s);
        assert!(rendered.contains("u1"));
        assert!(!rendered.contains("super-secret-token"));
    }
}
