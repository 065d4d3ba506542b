//! In-memory FHIR endpoint.
//!
//! Implements both [`FhirClient`] and [`FhirClientFactory`], so one server
//! can stand behind a [`ClientRegistry`](fhirsync_engine::ClientRegistry)
//! and still be inspected by the test.

use chrono::{DateTime, Duration, TimeZone, Utc};
use fhirsync_engine::{EndpointConfig, FhirClient, FhirClientFactory, SyncError, SyncResult, WriteOutcome};
use fhirsync_protocol::{ExternalResource, FhirVersion, ResourceIdentity, SystemCodeValue};
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Calls received by an [`InMemoryFhirServer`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ServerCalls {
    /// Point reads.
    pub reads: u64,
    /// Token searches.
    pub searches: u64,
    /// Creates.
    pub creates: u64,
    /// Updates.
    pub updates: u64,
    /// Deletes.
    pub deletes: u64,
}

impl ServerCalls {
    /// Reads plus searches.
    pub fn fetches(&self) -> u64 {
        self.reads + self.searches
    }

    /// Creates plus updates plus deletes.
    pub fn writes(&self) -> u64 {
        self.creates + self.updates + self.deletes
    }
}

#[derive(Default)]
struct Counters {
    reads: AtomicU64,
    searches: AtomicU64,
    creates: AtomicU64,
    updates: AtomicU64,
    deletes: AtomicU64,
}

struct ServerState {
    resources: BTreeMap<(String, String), ExternalResource>,
    next_id: u64,
    clock: DateTime<Utc>,
    pending_conflicts: u32,
    factory_calls: u64,
}

/// A FHIR endpoint held in memory.
///
/// Every write bumps the version id and advances a deterministic clock by
/// one second, so `meta.lastUpdated` differs between writes.
#[derive(Clone)]
pub struct InMemoryFhirServer {
    version: FhirVersion,
    state: Arc<Mutex<ServerState>>,
    calls: Arc<Counters>,
}

impl InMemoryFhirServer {
    /// Creates an empty R4 server.
    pub fn new() -> Self {
        Self::with_version(FhirVersion::R4)
    }

    /// Creates an empty server speaking `version`.
    pub fn with_version(version: FhirVersion) -> Self {
        Self {
            version,
            state: Arc::new(Mutex::new(ServerState {
                resources: BTreeMap::new(),
                next_id: 1,
                clock: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).single().unwrap_or_default(),
                pending_conflicts: 0,
                factory_calls: 0,
            })),
            calls: Arc::new(Counters::default()),
        }
    }

    /// Stores `resource` as is, without counting a write.
    ///
    /// # Panics
    ///
    /// Panics if the resource has no id.
    pub fn seed(&self, resource: ExternalResource) {
        let id = resource.id().expect("seeded resource needs an id").to_string();
        self.state
            .lock()
            .resources
            .insert((resource.resource_type().to_string(), id), resource);
    }

    /// Returns the stored `resource_type/id`.
    pub fn get(&self, resource_type: &str, id: &str) -> Option<ExternalResource> {
        self.state
            .lock()
            .resources
            .get(&(resource_type.to_string(), id.to_string()))
            .cloned()
    }

    /// Number of stored resources.
    pub fn len(&self) -> usize {
        self.state.lock().resources.len()
    }

    /// Returns true if nothing is stored.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Lets the next `count` creates or updates fail with a version conflict.
    pub fn fail_next_writes_with_conflict(&self, count: u32) {
        self.state.lock().pending_conflicts = count;
    }

    /// Calls received so far.
    pub fn calls(&self) -> ServerCalls {
        ServerCalls {
            reads: self.calls.reads.load(Ordering::SeqCst),
            searches: self.calls.searches.load(Ordering::SeqCst),
            creates: self.calls.creates.load(Ordering::SeqCst),
            updates: self.calls.updates.load(Ordering::SeqCst),
            deletes: self.calls.deletes.load(Ordering::SeqCst),
        }
    }

    /// Number of clients handed out as a factory.
    pub fn clients_created(&self) -> u64 {
        self.state.lock().factory_calls
    }

    fn store(&self, resource: &ExternalResource, keep_id: bool) -> SyncResult<WriteOutcome> {
        let mut state = self.state.lock();
        if state.pending_conflicts > 0 {
            state.pending_conflicts -= 1;
            return Err(SyncError::VersionConflict {
                resource: resource
                    .identity()
                    .map(|i| i.to_string())
                    .unwrap_or_else(|| resource.resource_type().to_string()),
            });
        }

        let resource_type = resource.resource_type().to_string();
        let id = match resource.id() {
            Some(id) if keep_id => id.to_string(),
            _ => {
                let id = format!("srv{}", state.next_id);
                state.next_id += 1;
                id
            }
        };
        let key = (resource_type.clone(), id.clone());
        let version = state
            .resources
            .get(&key)
            .and_then(|r| r.version())
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(0)
            + 1;
        state.clock += Duration::seconds(1);
        let stored = ExternalResource::from_fhir_json(resource.to_fhir_json())?
            .with_id(id.clone())
            .with_version(version.to_string())
            .with_last_updated(state.clock);
        state.resources.insert(key, stored.clone());

        Ok(WriteOutcome::applied(
            ResourceIdentity::new(resource_type, id).with_version(version.to_string()),
            Some(state.clock),
        )
        .with_resource(stored))
    }
}

impl Default for InMemoryFhirServer {
    fn default() -> Self {
        Self::new()
    }
}

fn token_matches(resource: &ExternalResource, field: &str, token: &SystemCodeValue) -> bool {
    let candidates: Vec<&Value> = match field {
        "code" => resource
            .body()
            .pointer("/code/coding")
            .and_then(Value::as_array)
            .map(|items| items.iter().collect())
            .unwrap_or_default(),
        other => match resource.body().get(other) {
            Some(Value::Array(items)) => items.iter().collect(),
            Some(value) => vec![value],
            None => Vec::new(),
        },
    };
    candidates.into_iter().any(|candidate| {
        let code = candidate
            .get("value")
            .or_else(|| candidate.get("code"))
            .and_then(Value::as_str);
        let system = candidate.get("system").and_then(Value::as_str);
        code == Some(token.code()) && (token.system().is_none() || system == token.system())
    })
}

impl FhirClient for InMemoryFhirServer {
    fn version(&self) -> FhirVersion {
        self.version
    }

    fn read(&self, resource_type: &str, id: &str) -> SyncResult<Option<ExternalResource>> {
        self.calls.reads.fetch_add(1, Ordering::SeqCst);
        Ok(self.get(resource_type, id))
    }

    fn search_by_token(
        &self,
        resource_type: &str,
        field: &str,
        token: &SystemCodeValue,
    ) -> SyncResult<Option<ExternalResource>> {
        self.calls.searches.fetch_add(1, Ordering::SeqCst);
        let state = self.state.lock();
        Ok(state
            .resources
            .iter()
            .filter(|((t, _), _)| t == resource_type)
            .map(|(_, r)| r)
            .find(|r| token_matches(r, field, token))
            .cloned())
    }

    fn create(&self, resource: &ExternalResource) -> SyncResult<WriteOutcome> {
        self.calls.creates.fetch_add(1, Ordering::SeqCst);
        self.store(resource, true)
    }

    fn update(&self, resource: &ExternalResource) -> SyncResult<WriteOutcome> {
        self.calls.updates.fetch_add(1, Ordering::SeqCst);
        if let (Some(id), Some(expected)) = (resource.id(), resource.version()) {
            let current = self.get(resource.resource_type(), id);
            if let Some(current) = current.as_ref().and_then(|c| c.version().map(str::to_string)) {
                if current != expected {
                    return Err(SyncError::VersionConflict {
                        resource: format!("{}/{}", resource.resource_type(), id),
                    });
                }
            }
        }
        self.store(resource, true)
    }

    fn delete(&self, resource_type: &str, id: &str) -> SyncResult<bool> {
        self.calls.deletes.fetch_add(1, Ordering::SeqCst);
        Ok(self
            .state
            .lock()
            .resources
            .remove(&(resource_type.to_string(), id.to_string()))
            .is_some())
    }
}

impl FhirClientFactory for InMemoryFhirServer {
    fn create_client(
        &self,
        _version: FhirVersion,
        _endpoint: &EndpointConfig,
    ) -> SyncResult<Arc<dyn FhirClient>> {
        self.state.lock().factory_calls += 1;
        Ok(Arc::new(self.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn writes_bump_version_and_clock() {
        let server = InMemoryFhirServer::new();
        let first = server
            .create(&ExternalResource::new("Patient", json!({"active": true})).with_id("7"))
            .unwrap();
        let second = server
            .update(&server.get("Patient", "7").unwrap())
            .unwrap();

        assert_eq!(first.identity.unwrap().version.as_deref(), Some("1"));
        assert_eq!(second.identity.unwrap().version.as_deref(), Some("2"));
        assert!(second.last_updated > first.last_updated);
        assert_eq!(server.calls().writes(), 2);
    }

    #[test]
    fn stale_update_conflicts() {
        let server = InMemoryFhirServer::new();
        server.seed(ExternalResource::new("Patient", json!({})).with_id("7").with_version("4"));
        let stale = ExternalResource::new("Patient", json!({})).with_id("7").with_version("3");
        assert!(server.update(&stale).unwrap_err().is_conflict());
    }

    #[test]
    fn searches_identifiers_and_codes() {
        let server = InMemoryFhirServer::new();
        server.seed(ExternalResource::from_fhir_json(json!({
            "resourceType": "Patient",
            "id": "1",
            "identifier": [{"system": "urn:mrn", "value": "A-1"}]
        })).unwrap());
        server.seed(ExternalResource::from_fhir_json(json!({
            "resourceType": "Observation",
            "id": "2",
            "code": {"coding": [{"system": "http://loinc.org", "code": "8480-6"}]}
        })).unwrap());

        let hit = server
            .search_by_token("Patient", "identifier", &SystemCodeValue::with_system("urn:mrn", "A-1"))
            .unwrap();
        assert_eq!(hit.unwrap().id(), Some("1"));
        let hit = server
            .search_by_token("Observation", "code", &SystemCodeValue::new(None, "8480-6"))
            .unwrap();
        assert_eq!(hit.unwrap().id(), Some("2"));
        assert!(server
            .search_by_token("Patient", "identifier", &SystemCodeValue::with_system("urn:other", "A-1"))
            .unwrap()
            .is_none());
    }
}
