//! Dedup ledger of applied changes.
//!
//! Every change that was applied, and every write the engine made itself, is
//! recorded as a [`ProcessedItemFingerprint`] under a group id (the remote
//! client the configuration belongs to). A message whose fingerprint is
//! already recorded is a redelivery or an echo and is skipped.

use crate::error::SyncResult;
use chrono::{DateTime, SecondsFormat, Utc};
use fhirsync_protocol::ProcessedItemFingerprint;
use fhirsync_storage::{RecordLog, StorageBackend};
use parking_lot::RwLock;
use std::collections::HashMap;
use tracing::{debug, warn};
use uuid::Uuid;

/// Records and queries fingerprints.
pub trait DedupLedger: Send + Sync {
    /// Returns true if `fingerprint` is recorded for `group`.
    fn contains(&self, group: Uuid, fingerprint: &ProcessedItemFingerprint) -> SyncResult<bool>;

    /// Records `fingerprint` for `group`.
    ///
    /// Returns false if it was already recorded. That is not an error: two
    /// workers may race to record the same change.
    fn record(&self, group: Uuid, fingerprint: &ProcessedItemFingerprint) -> SyncResult<bool>;

    /// Removes entries of `group` recorded before `cutoff`. Returns how many
    /// were removed.
    fn forget_older_than(&self, group: Uuid, cutoff: DateTime<Utc>) -> SyncResult<usize>;
}

/// Volatile ledger.
#[derive(Debug, Default)]
pub struct MemoryLedger {
    entries: RwLock<HashMap<(Uuid, String), DateTime<Utc>>>,
}

impl MemoryLedger {
    /// Creates an empty ledger.
    pub fn new() -> Self {
        Self::default()
    }

    /// Records `fingerprint` as if it had been recorded at `at`.
    pub fn record_at(&self, group: Uuid, fingerprint: &ProcessedItemFingerprint, at: DateTime<Utc>) -> bool {
        let mut entries = self.entries.write();
        let key = (group, fingerprint.to_id_string());
        if entries.contains_key(&key) {
            return false;
        }
        entries.insert(key, at);
        true
    }

    /// Number of entries across all groups.
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// Returns true if nothing is recorded.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl DedupLedger for MemoryLedger {
    fn contains(&self, group: Uuid, fingerprint: &ProcessedItemFingerprint) -> SyncResult<bool> {
        Ok(self
            .entries
            .read()
            .contains_key(&(group, fingerprint.to_id_string())))
    }

    fn record(&self, group: Uuid, fingerprint: &ProcessedItemFingerprint) -> SyncResult<bool> {
        Ok(self.record_at(group, fingerprint, Utc::now()))
    }

    fn forget_older_than(&self, group: Uuid, cutoff: DateTime<Utc>) -> SyncResult<usize> {
        let mut entries = self.entries.write();
        let before = entries.len();
        entries.retain(|(g, _), at| *g != group || *at >= cutoff);
        Ok(before - entries.len())
    }
}

/// Ledger persisted in a [`RecordLog`].
///
/// Keys are `"<group>/<fingerprint>"`, values the RFC 3339 instant the entry
/// was recorded at.
#[derive(Debug)]
pub struct DurableLedger {
    log: RecordLog,
}

impl DurableLedger {
    /// Opens the ledger stored in `backend`.
    pub fn open(backend: Box<dyn StorageBackend>) -> SyncResult<Self> {
        let log = RecordLog::open(backend)?;
        if log.recovery().truncated_bytes > 0 {
            warn!(
                truncated = log.recovery().truncated_bytes,
                "dedup ledger had a damaged tail"
            );
        }
        Ok(Self { log })
    }

    /// Returns the underlying log.
    pub fn log(&self) -> &RecordLog {
        &self.log
    }

    fn key(group: Uuid, fingerprint: &ProcessedItemFingerprint) -> String {
        format!("{group}/{fingerprint}")
    }

    /// Records `fingerprint` as if it had been recorded at `at`.
    pub fn record_at(
        &self,
        group: Uuid,
        fingerprint: &ProcessedItemFingerprint,
        at: DateTime<Utc>,
    ) -> SyncResult<bool> {
        let value = at.to_rfc3339_opts(SecondsFormat::Millis, true);
        let inserted = self
            .log
            .put_if_absent(&Self::key(group, fingerprint), value.as_bytes())?;
        if inserted {
            self.log.sync()?;
        }
        Ok(inserted)
    }
}

impl DedupLedger for DurableLedger {
    fn contains(&self, group: Uuid, fingerprint: &ProcessedItemFingerprint) -> SyncResult<bool> {
        Ok(self.log.contains(&Self::key(group, fingerprint)))
    }

    fn record(&self, group: Uuid, fingerprint: &ProcessedItemFingerprint) -> SyncResult<bool> {
        self.record_at(group, fingerprint, Utc::now())
    }

    fn forget_older_than(&self, group: Uuid, cutoff: DateTime<Utc>) -> SyncResult<usize> {
        let mut removed = 0;
        for (key, value) in self.log.entries_with_prefix(&format!("{group}/")) {
            let recorded = std::str::from_utf8(&value)
                .ok()
                .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
                .map(|t| t.with_timezone(&Utc));
            match recorded {
                Some(at) if at >= cutoff => {}
                Some(_) => {
                    if self.log.delete(&key)? {
                        removed += 1;
                    }
                }
                None => warn!(key = %key, "ledger entry has no readable timestamp"),
            }
        }
        if removed > 0 {
            self.log.sync()?;
            debug!(%group, removed, "forgot old ledger entries");
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use fhirsync_storage::InMemoryBackend;

    fn fingerprint(id: &str) -> ProcessedItemFingerprint {
        let at = Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, 0).unwrap();
        ProcessedItemFingerprint::new(format!("Patient/{id}"), at, false)
    }

    fn exercise(ledger: &dyn DedupLedger) {
        let group = Uuid::new_v4();
        let other = Uuid::new_v4();
        assert!(!ledger.contains(group, &fingerprint("1")).unwrap());
        assert!(ledger.record(group, &fingerprint("1")).unwrap());
        assert!(!ledger.record(group, &fingerprint("1")).unwrap());
        assert!(ledger.contains(group, &fingerprint("1")).unwrap());
        assert!(!ledger.contains(other, &fingerprint("1")).unwrap());

        // Everything was recorded just now.
        let past = Utc::now() - Duration::hours(1);
        assert_eq!(ledger.forget_older_than(group, past).unwrap(), 0);
        let future = Utc::now() + Duration::hours(1);
        assert_eq!(ledger.forget_older_than(group, future).unwrap(), 1);
        assert!(!ledger.contains(group, &fingerprint("1")).unwrap());
    }

    #[test]
    fn memory_ledger_contract() {
        exercise(&MemoryLedger::new());
    }

    #[test]
    fn durable_ledger_contract() {
        exercise(&DurableLedger::open(Box::new(InMemoryBackend::new())).unwrap());
    }

    #[test]
    fn durable_ledger_survives_reopen() {
        let backend = InMemoryBackend::new();
        let group = Uuid::new_v4();
        {
            let ledger = DurableLedger::open(Box::new(backend.clone())).unwrap();
            ledger.record(group, &fingerprint("7")).unwrap();
        }
        let reopened = DurableLedger::open(Box::new(backend)).unwrap();
        assert!(reopened.contains(group, &fingerprint("7")).unwrap());
    }

    #[test]
    fn ledger_file_outlives_the_engine() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state").join("ledger.log");
        let group = Uuid::new_v4();
        {
            let backend = fhirsync_storage::FileBackend::open_with_create_dirs(&path).unwrap();
            let ledger = DurableLedger::open(Box::new(backend)).unwrap();
            ledger.record(group, &fingerprint("9")).unwrap();
            ledger.log().sync().unwrap();
        }
        let backend = fhirsync_storage::FileBackend::open(&path).unwrap();
        let ledger = DurableLedger::open(Box::new(backend)).unwrap();
        assert!(ledger.contains(group, &fingerprint("9")).unwrap());
        assert!(!ledger.contains(group, &fingerprint("10")).unwrap());
    }

    #[test]
    fn forget_only_touches_old_entries_of_the_group() {
        let ledger = MemoryLedger::new();
        let group = Uuid::new_v4();
        let other = Uuid::new_v4();
        let old = Utc.with_ymd_and_hms(2020, 1, 1, 0, 0, 0).unwrap();
        ledger.record_at(group, &fingerprint("old"), old);
        ledger.record_at(other, &fingerprint("old"), old);
        ledger.record(group, &fingerprint("new")).unwrap();

        let cutoff = Utc.with_ymd_and_hms(2023, 1, 1, 0, 0, 0).unwrap();
        assert_eq!(ledger.forget_older_than(group, cutoff).unwrap(), 1);
        assert_eq!(ledger.len(), 2);
    }
}
