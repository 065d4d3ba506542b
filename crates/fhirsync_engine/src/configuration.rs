//! Owning configurations and the store they are looked up in.
//!
//! An owning configuration ties one remote FHIR endpoint and one resource
//! type to the rules that synchronize it. Configurations are administered
//! elsewhere; the engine only reads them through [`ConfigurationStore`].

use crate::auth::Credentials;
use crate::error::SyncResult;
use fhirsync_protocol::FhirVersion;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

/// How to reach a remote FHIR endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointConfig {
    /// Base URL, e.g. `https://fhir.example.org/baseR4`.
    pub base_url: String,
    /// When false, fetches return nothing and writes are skipped.
    pub use_remote: bool,
    /// Extra headers sent with every request.
    pub headers: Vec<(String, String)>,
    /// Log request lines at debug level.
    pub log_requests: bool,
    /// Ask for JSON explicitly instead of relying on server defaults.
    pub use_json_format: bool,
}

impl EndpointConfig {
    /// Creates an endpoint that talks to `base_url`.
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            use_remote: true,
            headers: Vec::new(),
            log_requests: false,
            use_json_format: true,
        }
    }

    /// Creates an endpoint that never calls out.
    pub fn local() -> Self {
        Self {
            use_remote: false,
            ..Self::new("")
        }
    }

    /// Adds a header.
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Enables request logging.
    pub fn with_request_logging(mut self, enabled: bool) -> Self {
        self.log_requests = enabled;
        self
    }
}

/// One owning configuration.
#[derive(Debug, Clone)]
pub struct SyncConfiguration {
    /// Configuration id.
    pub id: Uuid,
    /// Id of the remote client this configuration belongs to. Dedup ledger
    /// entries are grouped under it.
    pub client_id: Uuid,
    /// Short code for logs.
    pub code: String,
    /// FHIR version spoken by the endpoint.
    pub fhir_version: FhirVersion,
    /// Resource type this configuration handles.
    pub resource_type: String,
    /// Remote endpoint.
    pub endpoint: EndpointConfig,
    /// Credentials for writes on the registry side.
    pub registry_credentials: Option<Credentials>,
    /// Name of the resource transform applied to fetched resources.
    pub transform_script: Option<String>,
    /// Use the composite id as FHIR id when creating resources.
    pub sync_composite_id: bool,
}

impl SyncConfiguration {
    /// Creates a configuration for `resource_type` against `endpoint`.
    pub fn new(
        client_id: Uuid,
        code: impl Into<String>,
        fhir_version: FhirVersion,
        resource_type: impl Into<String>,
        endpoint: EndpointConfig,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            client_id,
            code: code.into(),
            fhir_version,
            resource_type: resource_type.into(),
            endpoint,
            registry_credentials: None,
            transform_script: None,
            sync_composite_id: false,
        }
    }

    /// Sets the id.
    pub fn with_id(mut self, id: Uuid) -> Self {
        self.id = id;
        self
    }

    /// Sets registry credentials.
    pub fn with_credentials(mut self, credentials: Credentials) -> Self {
        self.registry_credentials = Some(credentials);
        self
    }

    /// Sets the resource transform.
    pub fn with_transform_script(mut self, name: impl Into<String>) -> Self {
        self.transform_script = Some(name.into());
        self
    }

    /// Uses composite ids as FHIR ids on create.
    pub fn with_composite_ids(mut self) -> Self {
        self.sync_composite_id = true;
        self
    }
}

/// Read access to owning configurations.
pub trait ConfigurationStore: Send + Sync {
    /// Finds a configuration by id.
    fn find_by_id(&self, id: Uuid) -> SyncResult<Option<Arc<SyncConfiguration>>>;

    /// Finds the configuration of `client_id` that handles `resource_type`.
    fn find_by_resource_type(
        &self,
        client_id: Uuid,
        resource_type: &str,
    ) -> SyncResult<Option<Arc<SyncConfiguration>>>;
}

/// Caches lookups of another store until [`CachedConfigurationStore::invalidate`].
///
/// Absent results are not cached, so a configuration created later is found
/// without invalidation.
pub struct CachedConfigurationStore<S: ConfigurationStore> {
    inner: S,
    by_id: RwLock<HashMap<Uuid, Arc<SyncConfiguration>>>,
    by_type: RwLock<HashMap<(Uuid, String), Arc<SyncConfiguration>>>,
}

impl<S: ConfigurationStore> CachedConfigurationStore<S> {
    /// Wraps `inner`.
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            by_id: RwLock::new(HashMap::new()),
            by_type: RwLock::new(HashMap::new()),
        }
    }

    /// Drops every cached lookup.
    pub fn invalidate(&self) {
        self.by_id.write().clear();
        self.by_type.write().clear();
    }

    /// Returns the wrapped store.
    pub fn inner(&self) -> &S {
        &self.inner
    }
}

impl<S: ConfigurationStore> ConfigurationStore for CachedConfigurationStore<S> {
    fn find_by_id(&self, id: Uuid) -> SyncResult<Option<Arc<SyncConfiguration>>> {
        if let Some(hit) = self.by_id.read().get(&id) {
            return Ok(Some(Arc::clone(hit)));
        }
        let found = self.inner.find_by_id(id)?;
        if let Some(config) = &found {
            self.by_id.write().insert(id, Arc::clone(config));
        }
        Ok(found)
    }

    fn find_by_resource_type(
        &self,
        client_id: Uuid,
        resource_type: &str,
    ) -> SyncResult<Option<Arc<SyncConfiguration>>> {
        let key = (client_id, resource_type.to_string());
        if let Some(hit) = self.by_type.read().get(&key) {
            return Ok(Some(Arc::clone(hit)));
        }
        let found = self.inner.find_by_resource_type(client_id, resource_type)?;
        if let Some(config) = &found {
            self.by_type.write().insert(key, Arc::clone(config));
        }
        Ok(found)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingStore {
        config: RwLock<Option<Arc<SyncConfiguration>>>,
        calls: AtomicUsize,
    }

    impl ConfigurationStore for CountingStore {
        fn find_by_id(&self, id: Uuid) -> SyncResult<Option<Arc<SyncConfiguration>>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.config.read().clone().filter(|c| c.id == id))
        }

        fn find_by_resource_type(
            &self,
            client_id: Uuid,
            resource_type: &str,
        ) -> SyncResult<Option<Arc<SyncConfiguration>>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self
                .config
                .read()
                .clone()
                .filter(|c| c.client_id == client_id && c.resource_type == resource_type))
        }
    }

    fn config() -> Arc<SyncConfiguration> {
        Arc::new(SyncConfiguration::new(
            Uuid::new_v4(),
            "patients",
            FhirVersion::R4,
            "Patient",
            EndpointConfig::new("http://fhir.test/r4"),
        ))
    }

    #[test]
    fn hits_are_cached_until_invalidated() {
        let cfg = config();
        let store = CachedConfigurationStore::new(CountingStore {
            config: RwLock::new(Some(Arc::clone(&cfg))),
            calls: AtomicUsize::new(0),
        });

        assert!(store.find_by_id(cfg.id).unwrap().is_some());
        assert!(store.find_by_id(cfg.id).unwrap().is_some());
        assert!(store
            .find_by_resource_type(cfg.client_id, "Patient")
            .unwrap()
            .is_some());
        assert_eq!(store.inner().calls.load(Ordering::SeqCst), 2);

        *store.inner().config.write() = None;
        assert!(store.find_by_id(cfg.id).unwrap().is_some());
        store.invalidate();
        assert!(store.find_by_id(cfg.id).unwrap().is_none());
    }

    #[test]
    fn misses_are_not_cached() {
        let cfg = config();
        let store = CachedConfigurationStore::new(CountingStore {
            config: RwLock::new(None),
            calls: AtomicUsize::new(0),
        });

        assert!(store.find_by_id(cfg.id).unwrap().is_none());
        *store.inner().config.write() = Some(Arc::clone(&cfg));
        assert!(store.find_by_id(cfg.id).unwrap().is_some());
    }

    #[test]
    fn local_endpoint_disables_remote() {
        assert!(!EndpointConfig::local().use_remote);
        assert!(EndpointConfig::new("http://x").use_remote);
    }
}
