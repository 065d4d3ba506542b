//! In-memory registry side.

use chrono::{DateTime, Duration, TimeZone, Utc};
use fhirsync_engine::{
    ResourceRepository, SyncConfiguration, SyncContext, SyncError, SyncResult, WriteOutcome,
};
use fhirsync_protocol::{ExternalResource, ResourceIdentity};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};

/// What a save of one record needs before it can succeed.
///
/// The error names the source-side resource; the requirement is met once
/// the registry holds `satisfied_by`.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Requirement {
    prerequisite: bool,
    source: (String, String),
    satisfied_by: (String, String),
}

struct RegistryState {
    records: BTreeMap<(String, String), ExternalResource>,
    requirements: HashMap<(String, String), Vec<Requirement>>,
    saved: Vec<ResourceIdentity>,
    deleted: Vec<ResourceIdentity>,
    save_attempts: u64,
    pending_conflicts: u32,
    always_conflict: bool,
    unversioned_writes: bool,
    next_id: u64,
    clock: DateTime<Utc>,
}

/// A DHIS2 registry held in memory.
///
/// Serves as the persistence target of imports and as the source of
/// exports. Requirements and conflicts can be injected per resource to
/// exercise the resolver.
pub struct InMemoryDhisRepository {
    state: Mutex<RegistryState>,
}

impl InMemoryDhisRepository {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(RegistryState {
                records: BTreeMap::new(),
                requirements: HashMap::new(),
                saved: Vec::new(),
                deleted: Vec::new(),
                save_attempts: 0,
                pending_conflicts: 0,
                always_conflict: false,
                unversioned_writes: false,
                next_id: 1,
                clock: Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).single().unwrap_or_default(),
            }),
        }
    }

    /// Stores `resource` without recording a save.
    ///
    /// # Panics
    ///
    /// Panics if the resource has no id.
    pub fn seed(&self, resource: ExternalResource) {
        let id = resource.id().expect("seeded record needs an id").to_string();
        self.state
            .lock()
            .records
            .insert((resource.resource_type().to_string(), id), resource);
    }

    /// Saving `record` fails with a missing dependency on the source-side
    /// `dependency` until the registry holds `satisfied_by`. All three are
    /// `(type, id)` pairs.
    pub fn require_dependency(
        &self,
        record: (&str, &str),
        dependency: (&str, &str),
        satisfied_by: (&str, &str),
    ) {
        self.require(record, false, dependency, satisfied_by);
    }

    /// Saving `record` fails with an absent prerequisite `prerequisite` until
    /// the registry holds `satisfied_by`.
    pub fn require_prerequisite(
        &self,
        record: (&str, &str),
        prerequisite: (&str, &str),
        satisfied_by: (&str, &str),
    ) {
        self.require(record, true, prerequisite, satisfied_by);
    }

    fn require(
        &self,
        record: (&str, &str),
        prerequisite: bool,
        source: (&str, &str),
        satisfied_by: (&str, &str),
    ) {
        let pair = |(t, i): (&str, &str)| (t.to_string(), i.to_string());
        self.state
            .lock()
            .requirements
            .entry(pair(record))
            .or_default()
            .push(Requirement {
                prerequisite,
                source: pair(source),
                satisfied_by: pair(satisfied_by),
            });
    }

    /// Lets the next `count` saves fail with a version conflict.
    pub fn fail_next_saves_with_conflict(&self, count: u32) {
        self.state.lock().pending_conflicts = count;
    }

    /// Lets every save fail with a version conflict.
    pub fn always_conflict(&self) {
        self.state.lock().always_conflict = true;
    }

    /// Makes saves report neither a last-modified instant nor a version, like
    /// a registry that does not expose change tracking.
    pub fn report_unversioned_writes(&self) {
        self.state.lock().unversioned_writes = true;
    }

    /// Returns the stored `resource_type/id`.
    pub fn get(&self, resource_type: &str, id: &str) -> Option<ExternalResource> {
        self.state
            .lock()
            .records
            .get(&(resource_type.to_string(), id.to_string()))
            .cloned()
    }

    /// Number of stored records.
    pub fn len(&self) -> usize {
        self.state.lock().records.len()
    }

    /// Returns true if nothing is stored.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Successful saves, in order.
    pub fn saved(&self) -> Vec<ResourceIdentity> {
        self.state.lock().saved.clone()
    }

    /// Ids of successful saves as `Type/id`, in order.
    pub fn saved_ids(&self) -> Vec<String> {
        self.saved().iter().map(ResourceIdentity::unversioned).collect()
    }

    /// Successful deletions, in order.
    pub fn deleted(&self) -> Vec<ResourceIdentity> {
        self.state.lock().deleted.clone()
    }

    /// Save calls, failed ones included.
    pub fn save_attempts(&self) -> u64 {
        self.state.lock().save_attempts
    }
}

impl Default for InMemoryDhisRepository {
    fn default() -> Self {
        Self::new()
    }
}

impl ResourceRepository for InMemoryDhisRepository {
    fn find_refreshed(
        &self,
        _ctx: &SyncContext,
        _config: &SyncConfiguration,
        resource_type: &str,
        id: &str,
    ) -> SyncResult<Option<ExternalResource>> {
        Ok(self.get(resource_type, id))
    }

    fn save(
        &self,
        _ctx: &SyncContext,
        _config: &SyncConfiguration,
        resource: &ExternalResource,
    ) -> SyncResult<WriteOutcome> {
        let mut state = self.state.lock();
        state.save_attempts += 1;
        let identity = resource
            .identity()
            .map(|i| i.unversioned())
            .unwrap_or_else(|| resource.resource_type().to_string());
        if state.always_conflict || state.pending_conflicts > 0 {
            state.pending_conflicts = state.pending_conflicts.saturating_sub(1);
            return Err(SyncError::VersionConflict { resource: identity });
        }

        let resource_type = resource.resource_type().to_string();
        if let Some(id) = resource.id() {
            let key = (resource_type.clone(), id.to_string());
            let unmet = state
                .requirements
                .get(&key)
                .into_iter()
                .flatten()
                .find(|r| !state.records.contains_key(&r.satisfied_by))
                .cloned();
            if let Some(requirement) = unmet {
                let (t, i) = requirement.source;
                return Err(if requirement.prerequisite {
                    SyncError::prerequisite_not_found(t, i)
                } else {
                    SyncError::missing_dependency(t, i)
                });
            }
        }

        let id = match resource.id() {
            Some(id) => id.to_string(),
            None => {
                let id = format!("dhis{:07}", state.next_id);
                state.next_id += 1;
                id
            }
        };
        state.clock += Duration::seconds(1);
        let stored = resource
            .clone()
            .with_id(id.clone())
            .with_last_updated(state.clock);
        let identity = ResourceIdentity::new(resource_type.clone(), id.clone());
        state.records.insert((resource_type, id), stored.clone());
        state.saved.push(identity.clone());
        if state.unversioned_writes {
            return Ok(WriteOutcome::applied(identity, None));
        }
        Ok(WriteOutcome::applied(identity, Some(state.clock)).with_resource(stored))
    }

    fn delete(
        &self,
        _ctx: &SyncContext,
        _config: &SyncConfiguration,
        resource_type: &str,
        id: &str,
    ) -> SyncResult<WriteOutcome> {
        let mut state = self.state.lock();
        let identity = ResourceIdentity::new(resource_type, id);
        let existed = state
            .records
            .remove(&(resource_type.to_string(), id.to_string()))
            .is_some();
        let outcome = if existed {
            state.deleted.push(identity.clone());
            WriteOutcome::applied(identity, None)
        } else {
            WriteOutcome {
                identity: Some(identity),
                ..WriteOutcome::skipped()
            }
        };
        Ok(outcome.as_deletion())
    }
}
