//! Mutual exclusion around transform-and-persist attempts.
//!
//! Writes to the target system are not idempotent, so at most one
//! transform-and-persist may be in flight per lock key. The key depends on
//! the configured [`LockScope`]. Keys are hashed onto a fixed set of mutex
//! stripes, so unrelated keys may occasionally share a stripe; that only
//! serializes more than needed.
//!
//! Claims are a second, independent set of stripes keyed by the fingerprint
//! of an inbound change. A listener holds the claim from its dedup check
//! until the fingerprint is recorded, so two deliveries of one change never
//! both reach the target. A claim is always taken before a write lock, never
//! the other way round.

use crate::config::LockScope;
use crate::configuration::SyncConfiguration;
use fhirsync_protocol::{ProcessedItemFingerprint, ResourceIdentity};
use parking_lot::{Mutex, MutexGuard};
use sha2::{Digest, Sha256};
use tracing::trace;
use uuid::Uuid;

/// Hands out guards for lock keys.
#[derive(Debug)]
pub struct LockManager {
    scope: LockScope,
    stripes: Vec<Mutex<()>>,
    claims: Vec<Mutex<()>>,
}

/// Held while a transform-and-persist attempt runs.
#[must_use = "the lock is released when the guard is dropped"]
pub struct LockGuard<'a> {
    _guard: MutexGuard<'a, ()>,
    key: String,
}

impl LockGuard<'_> {
    /// Returns the key the guard was taken for.
    pub fn key(&self) -> &str {
        &self.key
    }
}

impl std::fmt::Debug for LockGuard<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockGuard").field("key", &self.key).finish()
    }
}

impl LockManager {
    /// Creates a manager with `stripes` mutexes.
    pub fn new(scope: LockScope, stripes: usize) -> Self {
        let count = stripes.max(1);
        Self {
            scope,
            stripes: (0..count).map(|_| Mutex::new(())).collect(),
            claims: (0..count).map(|_| Mutex::new(())).collect(),
        }
    }

    /// Returns the scope.
    pub fn scope(&self) -> LockScope {
        self.scope
    }

    /// Returns the lock key for writing `resource` under `config`.
    pub fn key_for(&self, config: &SyncConfiguration, resource: Option<&ResourceIdentity>) -> String {
        match (self.scope, resource) {
            (LockScope::Global, _) => "global".to_string(),
            (LockScope::PerResource, Some(identity)) => {
                format!("{}/{}", config.id, identity.unversioned())
            }
            // A resource without identity cannot collide with another write
            // of itself; fall back to the configuration.
            (LockScope::PerConfiguration, _) | (LockScope::PerResource, None) => {
                config.id.to_string()
            }
        }
    }

    /// Blocks until the lock for `config` and `resource` is held.
    pub fn lock(
        &self,
        config: &SyncConfiguration,
        resource: Option<&ResourceIdentity>,
    ) -> LockGuard<'_> {
        let key = self.key_for(config, resource);
        let stripe = self.stripe(&key);
        trace!(key = %key, stripe, "acquiring sync lock");
        LockGuard {
            _guard: self.stripes[stripe].lock(),
            key,
        }
    }

    /// Blocks until no other delivery of `fingerprint` is in flight for
    /// `group`.
    pub fn claim(&self, group: Uuid, fingerprint: &ProcessedItemFingerprint) -> LockGuard<'_> {
        let key = format!("{group}/{}", fingerprint.to_id_string());
        let stripe = self.stripe(&key);
        trace!(key = %key, stripe, "claiming change");
        LockGuard {
            _guard: self.claims[stripe].lock(),
            key,
        }
    }

    fn stripe(&self, key: &str) -> usize {
        let digest = Sha256::digest(key.as_bytes());
        let mut prefix = [0u8; 8];
        prefix.copy_from_slice(&digest[..8]);
        (u64::from_le_bytes(prefix) % self.stripes.len() as u64) as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::configuration::EndpointConfig;
    use fhirsync_protocol::FhirVersion;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use uuid::Uuid;

    fn config() -> SyncConfiguration {
        SyncConfiguration::new(
            Uuid::new_v4(),
            "p",
            FhirVersion::R4,
            "Patient",
            EndpointConfig::local(),
        )
    }

    #[test]
    fn keys_follow_scope() {
        let cfg = config();
        let id = ResourceIdentity::new("Patient", "7");

        assert_eq!(LockManager::new(LockScope::Global, 4).key_for(&cfg, Some(&id)), "global");
        assert_eq!(
            LockManager::new(LockScope::PerConfiguration, 4).key_for(&cfg, Some(&id)),
            cfg.id.to_string()
        );
        assert_eq!(
            LockManager::new(LockScope::PerResource, 4).key_for(&cfg, Some(&id)),
            format!("{}/Patient/7", cfg.id)
        );
        assert_eq!(
            LockManager::new(LockScope::PerResource, 4).key_for(&cfg, None),
            cfg.id.to_string()
        );
    }

    #[test]
    fn same_key_is_exclusive() {
        let locks = Arc::new(LockManager::new(LockScope::PerConfiguration, 8));
        let cfg = Arc::new(config());
        let inside = Arc::new(AtomicUsize::new(0));
        let max_inside = Arc::new(AtomicUsize::new(0));

        std::thread::scope(|s| {
            for _ in 0..4 {
                let (locks, cfg, inside, max_inside) =
                    (locks.clone(), cfg.clone(), inside.clone(), max_inside.clone());
                s.spawn(move || {
                    for _ in 0..50 {
                        let _guard = locks.lock(&cfg, None);
                        let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
                        max_inside.fetch_max(now, Ordering::SeqCst);
                        inside.fetch_sub(1, Ordering::SeqCst);
                    }
                });
            }
        });

        assert_eq!(max_inside.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn claims_do_not_block_writes() {
        use chrono::TimeZone;

        let locks = LockManager::new(LockScope::Global, 1);
        let at = chrono::Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 0).unwrap();
        let fingerprint = ProcessedItemFingerprint::new("Patient/7", at, false);
        let group = Uuid::new_v4();

        let claim = locks.claim(group, &fingerprint);
        assert_eq!(claim.key(), format!("{group}/{}", fingerprint.to_id_string()));
        let write = locks.lock(&config(), None);
        assert_eq!(write.key(), "global");
        assert!(locks.claims[0].try_lock().is_none());
        drop(claim);
        assert!(locks.claims[0].try_lock().is_some());
    }
}
