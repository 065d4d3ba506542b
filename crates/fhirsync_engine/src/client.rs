//! Remote FHIR client abstraction and the per-endpoint client registry.

use crate::configuration::{EndpointConfig, SyncConfiguration};
use crate::error::SyncResult;
use chrono::{DateTime, Utc};
use fhirsync_protocol::{
    ExternalResource, FhirVersion, ProcessedItemFingerprint, ResourceIdentity, SystemCodeValue,
};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// Result of a create, update or delete on a remote system.
#[derive(Debug, Clone, PartialEq)]
pub struct WriteOutcome {
    /// Identity assigned by the remote system. Absent for skipped writes.
    pub identity: Option<ResourceIdentity>,
    /// Last-modified instant reported by the remote system.
    pub last_updated: Option<DateTime<Utc>>,
    /// The stored resource, when the remote system returned it.
    pub resource: Option<ExternalResource>,
    /// False when nothing was written.
    pub applied: bool,
    /// True for deletions.
    pub deleted: bool,
}

impl WriteOutcome {
    /// A write that happened.
    pub fn applied(identity: ResourceIdentity, last_updated: Option<DateTime<Utc>>) -> Self {
        Self {
            identity: Some(identity),
            last_updated,
            resource: None,
            applied: true,
            deleted: false,
        }
    }

    /// A write that did not happen.
    pub fn skipped() -> Self {
        Self {
            identity: None,
            last_updated: None,
            resource: None,
            applied: false,
            deleted: false,
        }
    }

    /// Attaches the stored resource.
    pub fn with_resource(mut self, resource: ExternalResource) -> Self {
        self.resource = Some(resource);
        self
    }

    /// Marks the outcome as a deletion.
    pub fn as_deletion(mut self) -> Self {
        self.deleted = true;
        self
    }

    /// Fingerprint of the state this write produced on the remote side.
    ///
    /// When the change comes back as a notification it carries the same
    /// fingerprint and is recognized as the engine's own echo. `None` if the
    /// remote system reported neither a last-modified instant nor a version.
    pub fn fingerprint(&self) -> Option<ProcessedItemFingerprint> {
        let identity = self.identity.as_ref()?;
        if let Some(instant) = self.last_updated {
            return Some(ProcessedItemFingerprint::new(
                identity.unversioned(),
                instant,
                self.deleted,
            ));
        }
        let version = identity.version.as_ref()?;
        let echo = ExternalResource::tombstone(&identity.resource_type, &identity.id)
            .with_deleted(self.deleted)
            .with_version(version.clone());
        ProcessedItemFingerprint::from_resource(&echo)
    }
}

/// A client for one remote FHIR endpoint.
///
/// Not-found is `Ok(None)` or `Ok(false)`, never an error. Writes against a
/// stale version fail with [`SyncError::VersionConflict`](crate::SyncError).
pub trait FhirClient: Send + Sync {
    /// FHIR version spoken by the endpoint.
    fn version(&self) -> FhirVersion;

    /// Reads `resource_type/id`.
    fn read(&self, resource_type: &str, id: &str) -> SyncResult<Option<ExternalResource>>;

    /// Finds the first resource whose `field` matches `token`.
    fn search_by_token(
        &self,
        resource_type: &str,
        field: &str,
        token: &SystemCodeValue,
    ) -> SyncResult<Option<ExternalResource>>;

    /// Creates a resource. If it carries an id, the id is kept.
    fn create(&self, resource: &ExternalResource) -> SyncResult<WriteOutcome>;

    /// Updates a resource. A resource version is sent as precondition.
    fn update(&self, resource: &ExternalResource) -> SyncResult<WriteOutcome>;

    /// Deletes `resource_type/id`. Returns false if it did not exist.
    fn delete(&self, resource_type: &str, id: &str) -> SyncResult<bool>;
}

/// Builds clients for endpoints.
pub trait FhirClientFactory: Send + Sync {
    /// Creates a client for `endpoint` speaking `version`.
    fn create_client(
        &self,
        version: FhirVersion,
        endpoint: &EndpointConfig,
    ) -> SyncResult<Arc<dyn FhirClient>>;
}

/// Client for endpoints with remote use disabled. Never calls out.
#[derive(Debug, Clone, Copy)]
pub struct DisabledClient {
    version: FhirVersion,
}

impl DisabledClient {
    /// Creates a disabled client.
    pub fn new(version: FhirVersion) -> Self {
        Self { version }
    }
}

impl FhirClient for DisabledClient {
    fn version(&self) -> FhirVersion {
        self.version
    }

    fn read(&self, _resource_type: &str, _id: &str) -> SyncResult<Option<ExternalResource>> {
        Ok(None)
    }

    fn search_by_token(
        &self,
        _resource_type: &str,
        _field: &str,
        _token: &SystemCodeValue,
    ) -> SyncResult<Option<ExternalResource>> {
        Ok(None)
    }

    fn create(&self, _resource: &ExternalResource) -> SyncResult<WriteOutcome> {
        Ok(WriteOutcome::skipped())
    }

    fn update(&self, _resource: &ExternalResource) -> SyncResult<WriteOutcome> {
        Ok(WriteOutcome::skipped())
    }

    fn delete(&self, _resource_type: &str, _id: &str) -> SyncResult<bool> {
        Ok(false)
    }
}

/// Opens clients on demand and keeps one per (version, base URL).
pub struct ClientRegistry {
    factory: Arc<dyn FhirClientFactory>,
    clients: RwLock<HashMap<(FhirVersion, String), Arc<dyn FhirClient>>>,
}

impl ClientRegistry {
    /// Creates a registry backed by `factory`.
    pub fn new(factory: Arc<dyn FhirClientFactory>) -> Self {
        Self {
            factory,
            clients: RwLock::new(HashMap::new()),
        }
    }

    /// Returns the client for `config`.
    ///
    /// Configurations with remote use disabled get a [`DisabledClient`].
    pub fn client_for(&self, config: &SyncConfiguration) -> SyncResult<Arc<dyn FhirClient>> {
        if !config.endpoint.use_remote {
            return Ok(Arc::new(DisabledClient::new(config.fhir_version)));
        }

        let key = (config.fhir_version, config.endpoint.base_url.clone());
        if let Some(client) = self.clients.read().get(&key) {
            return Ok(Arc::clone(client));
        }

        let mut clients = self.clients.write();
        if let Some(client) = clients.get(&key) {
            return Ok(Arc::clone(client));
        }
        debug!(
            version = %config.fhir_version,
            base_url = %config.endpoint.base_url,
            "opening FHIR client"
        );
        let client = self
            .factory
            .create_client(config.fhir_version, &config.endpoint)?;
        clients.insert(key, Arc::clone(&client));
        Ok(client)
    }

    /// Closes every cached client.
    pub fn clear(&self) {
        self.clients.write().clear();
    }

    /// Number of open clients.
    pub fn len(&self) -> usize {
        self.clients.read().len()
    }

    /// Returns true if no client is open.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use uuid::Uuid;

    struct CountingFactory(AtomicUsize);

    impl FhirClientFactory for CountingFactory {
        fn create_client(
            &self,
            version: FhirVersion,
            _endpoint: &EndpointConfig,
        ) -> SyncResult<Arc<dyn FhirClient>> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(Arc::new(DisabledClient::new(version)))
        }
    }

    fn config(base: &str, version: FhirVersion) -> SyncConfiguration {
        SyncConfiguration::new(
            Uuid::nil(),
            "p",
            version,
            "Patient",
            EndpointConfig::new(base),
        )
    }

    #[test]
    fn clients_are_cached_per_version_and_url() {
        let factory = Arc::new(CountingFactory(AtomicUsize::new(0)));
        let registry = ClientRegistry::new(factory.clone());

        registry.client_for(&config("http://a", FhirVersion::R4)).unwrap();
        registry.client_for(&config("http://a", FhirVersion::R4)).unwrap();
        registry.client_for(&config("http://a", FhirVersion::Dstu3)).unwrap();
        registry.client_for(&config("http://b", FhirVersion::R4)).unwrap();

        assert_eq!(factory.0.load(Ordering::SeqCst), 3);
        assert_eq!(registry.len(), 3);
    }

    #[test]
    fn disabled_endpoints_never_reach_the_factory() {
        let factory = Arc::new(CountingFactory(AtomicUsize::new(0)));
        let registry = ClientRegistry::new(factory.clone());
        let mut cfg = config("http://a", FhirVersion::R4);
        cfg.endpoint = EndpointConfig::local();

        let client = registry.client_for(&cfg).unwrap();
        assert!(client.read("Patient", "7").unwrap().is_none());
        assert!(!client.create(&ExternalResource::tombstone("Patient", "7")).unwrap().applied);
        assert_eq!(factory.0.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn write_fingerprint_prefers_last_updated() {
        let at = Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, 0).unwrap();
        let outcome = WriteOutcome::applied(
            ResourceIdentity::new("Patient", "7").with_version("2"),
            Some(at),
        );
        assert_eq!(
            outcome.fingerprint().unwrap().to_id_string(),
            "Patient/7|2024-05-01T10:00:00.000Z"
        );

        let versioned = WriteOutcome::applied(ResourceIdentity::new("Patient", "7").with_version("2"), None);
        assert_eq!(versioned.fingerprint().unwrap().to_id_string(), "Patient/7|v2");
        assert!(WriteOutcome::applied(ResourceIdentity::new("Patient", "7"), None)
            .fingerprint()
            .is_none());
    }
}
