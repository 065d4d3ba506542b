//! Resource repositories on either side of the synchronization.
//!
//! [`ResourceRepository`] is what the orchestrator reads sources from and
//! persists outcomes to. [`FhirResourceRepository`] implements it for FHIR
//! endpoints, with cached lookups in front of the remote client.

use crate::cache::CacheStore;
use crate::client::{ClientRegistry, WriteOutcome};
use crate::configuration::SyncConfiguration;
use crate::context::SyncContext;
use crate::error::{SyncError, SyncResult};
use fhirsync_protocol::{
    ExternalResource, ResourceEndpointKey, ResourceIdentity, ResourceLookup, SystemCodeValue,
};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, trace};

/// Reads and writes resources of one side.
pub trait ResourceRepository: Send + Sync {
    /// Fetches the current state of `resource_type/id`, bypassing caches.
    fn find_refreshed(
        &self,
        ctx: &SyncContext,
        config: &SyncConfiguration,
        resource_type: &str,
        id: &str,
    ) -> SyncResult<Option<ExternalResource>>;

    /// Returns the resource that stands for the deletion of
    /// `resource_type/id`.
    fn find_deleted(
        &self,
        _ctx: &SyncContext,
        _config: &SyncConfiguration,
        resource_type: &str,
        id: &str,
    ) -> SyncResult<Option<ExternalResource>> {
        Ok(Some(ExternalResource::tombstone(resource_type, id)))
    }

    /// Creates or updates `resource`.
    fn save(
        &self,
        ctx: &SyncContext,
        config: &SyncConfiguration,
        resource: &ExternalResource,
    ) -> SyncResult<WriteOutcome>;

    /// Deletes `resource_type/id`. The outcome is not applied if it did not
    /// exist.
    fn delete(
        &self,
        ctx: &SyncContext,
        config: &SyncConfiguration,
        resource_type: &str,
        id: &str,
    ) -> SyncResult<WriteOutcome>;
}

/// Per-configuration transform applied to every fetched resource before it
/// is cached or returned.
pub trait ResourceTransformer: Send + Sync {
    /// Transforms `resource`.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::Transformation`] if the resource is rejected.
    fn transform(
        &self,
        config: &SyncConfiguration,
        resource: ExternalResource,
    ) -> SyncResult<ExternalResource>;
}

/// Returns resources unchanged.
#[derive(Debug, Default, Clone, Copy)]
pub struct IdentityTransformer;

impl ResourceTransformer for IdentityTransformer {
    fn transform(
        &self,
        _config: &SyncConfiguration,
        resource: ExternalResource,
    ) -> SyncResult<ExternalResource> {
        Ok(resource)
    }
}

/// FHIR-side repository.
///
/// Lookups come in two modes. A cached lookup answers from the request cache,
/// then the shared cache, and only then asks the remote endpoint. A refreshed
/// lookup always asks the remote endpoint and overwrites both caches. Absent
/// resources are never cached. Every successful write evicts the written
/// resource, so the next lookup goes to the remote endpoint.
pub struct FhirResourceRepository {
    clients: Arc<ClientRegistry>,
    cache: Arc<dyn CacheStore>,
    transformer: Arc<dyn ResourceTransformer>,
    remote_fetches: AtomicU64,
}

impl FhirResourceRepository {
    /// Creates a repository.
    pub fn new(clients: Arc<ClientRegistry>, cache: Arc<dyn CacheStore>) -> Self {
        Self {
            clients,
            cache,
            transformer: Arc::new(IdentityTransformer),
            remote_fetches: AtomicU64::new(0),
        }
    }

    /// Sets the transform applied to fetched resources.
    pub fn with_transformer(mut self, transformer: Arc<dyn ResourceTransformer>) -> Self {
        self.transformer = transformer;
        self
    }

    /// Returns the shared cache.
    pub fn cache(&self) -> &Arc<dyn CacheStore> {
        &self.cache
    }

    /// Number of lookups that reached a remote endpoint.
    pub fn remote_fetches(&self) -> u64 {
        self.remote_fetches.load(Ordering::Relaxed)
    }

    /// Cached point lookup.
    pub fn find(
        &self,
        ctx: &SyncContext,
        config: &SyncConfiguration,
        resource_type: &str,
        id: &str,
    ) -> SyncResult<Option<ExternalResource>> {
        let key = ResourceEndpointKey::by_id(config.id, config.fhir_version, resource_type, id, false);
        self.lookup(ctx, config, &key)
    }

    /// Cached lookup by identifier token.
    pub fn find_by_identifier(
        &self,
        ctx: &SyncContext,
        config: &SyncConfiguration,
        resource_type: &str,
        identifier: &SystemCodeValue,
    ) -> SyncResult<Option<ExternalResource>> {
        let key = self.token_key(config, resource_type, ResourceLookup::Identifier(identifier.clone()), false);
        self.lookup(ctx, config, &key)
    }

    /// Refreshed lookup by identifier token.
    pub fn find_refreshed_by_identifier(
        &self,
        ctx: &SyncContext,
        config: &SyncConfiguration,
        resource_type: &str,
        identifier: &SystemCodeValue,
    ) -> SyncResult<Option<ExternalResource>> {
        let key = self.token_key(config, resource_type, ResourceLookup::Identifier(identifier.clone()), true);
        self.lookup(ctx, config, &key)
    }

    /// Cached lookup by code token.
    pub fn find_by_code(
        &self,
        ctx: &SyncContext,
        config: &SyncConfiguration,
        resource_type: &str,
        code: &SystemCodeValue,
    ) -> SyncResult<Option<ExternalResource>> {
        let key = self.token_key(config, resource_type, ResourceLookup::Code(code.clone()), false);
        self.lookup(ctx, config, &key)
    }

    /// Refreshed lookup by code token.
    pub fn find_refreshed_by_code(
        &self,
        ctx: &SyncContext,
        config: &SyncConfiguration,
        resource_type: &str,
        code: &SystemCodeValue,
    ) -> SyncResult<Option<ExternalResource>> {
        let key = self.token_key(config, resource_type, ResourceLookup::Code(code.clone()), true);
        self.lookup(ctx, config, &key)
    }

    fn token_key(
        &self,
        config: &SyncConfiguration,
        resource_type: &str,
        lookup: ResourceLookup,
        refresh: bool,
    ) -> ResourceEndpointKey {
        ResourceEndpointKey::new(config.id, config.fhir_version, resource_type, lookup, refresh)
    }

    /// Resolves `key` in its mode.
    pub fn lookup(
        &self,
        ctx: &SyncContext,
        config: &SyncConfiguration,
        key: &ResourceEndpointKey,
    ) -> SyncResult<Option<ExternalResource>> {
        if !config.endpoint.use_remote {
            return Ok(None);
        }

        if !key.is_refresh() {
            if let Some(hit) = ctx.request_cache().get(key) {
                trace!(key = %key, "request cache hit");
                return Ok(Some(hit));
            }
            if let Some(hit) = self.cache.get(key)? {
                trace!(key = %key, "shared cache hit");
                ctx.request_cache().put(key, hit.clone());
                return Ok(Some(hit));
            }
        }

        let client = self.clients.client_for(config)?;
        self.remote_fetches.fetch_add(1, Ordering::Relaxed);
        let fetched = match key.lookup() {
            ResourceLookup::Id(id) => client.read(key.resource_type(), id)?,
            ResourceLookup::Identifier(token) => {
                client.search_by_token(key.resource_type(), "identifier", token)?
            }
            ResourceLookup::Code(token) => client.search_by_token(key.resource_type(), "code", token)?,
            ResourceLookup::Hierarchy { .. } => {
                return Err(SyncError::Fatal(format!(
                    "{key} is not a remote lookup"
                )))
            }
        };

        let Some(fetched) = fetched else {
            debug!(key = %key, "not found on remote endpoint");
            if key.is_refresh() {
                self.cache.evict(key)?;
                ctx.request_cache().evict(key);
            }
            return Ok(None);
        };

        let transformed = self.transformer.transform(config, fetched)?;
        self.cache.put(key, &transformed)?;
        ctx.request_cache().put(key, transformed.clone());
        Ok(Some(transformed))
    }

    fn evict(&self, ctx: &SyncContext, config: &SyncConfiguration, identity: &ResourceIdentity) -> SyncResult<()> {
        let key = ResourceEndpointKey::by_id(
            config.id,
            config.fhir_version,
            &identity.resource_type,
            &identity.id,
            false,
        );
        self.cache.evict(&key)?;
        ctx.request_cache().evict(&key);
        trace!(key = %key, "evicted after write");
        Ok(())
    }

    /// A write refused as stale means the cached copy is stale too. Dropping
    /// it lets the next attempt read the current version.
    fn evict_on_conflict<T>(
        &self,
        ctx: &SyncContext,
        config: &SyncConfiguration,
        identity: Option<&ResourceIdentity>,
        written: SyncResult<T>,
    ) -> SyncResult<T> {
        if let (Err(e), Some(identity)) = (&written, identity) {
            if e.is_conflict() {
                debug!(resource = %identity, "version conflict; evicting cached copy");
                self.evict(ctx, config, identity)?;
            }
        }
        written
    }
}

impl ResourceRepository for FhirResourceRepository {
    fn find_refreshed(
        &self,
        ctx: &SyncContext,
        config: &SyncConfiguration,
        resource_type: &str,
        id: &str,
    ) -> SyncResult<Option<ExternalResource>> {
        let key = ResourceEndpointKey::by_id(config.id, config.fhir_version, resource_type, id, true);
        self.lookup(ctx, config, &key)
    }

    fn save(
        &self,
        ctx: &SyncContext,
        config: &SyncConfiguration,
        resource: &ExternalResource,
    ) -> SyncResult<WriteOutcome> {
        let client = self.clients.client_for(config)?;

        let mut resource = resource.clone();
        let mut assigned_id = false;
        if resource.id().is_none() && config.sync_composite_id {
            if let Some(system_id) = resource.system_id().map(str::to_string) {
                resource.set_id(system_id);
                assigned_id = true;
            }
        }

        let written = if resource.id().is_some() && !assigned_id {
            client.update(&resource)
        } else {
            client.create(&resource)
        };
        let outcome = self.evict_on_conflict(ctx, config, resource.identity().as_ref(), written)?;

        if let Some(identity) = resource.identity() {
            self.evict(ctx, config, &identity)?;
        }
        if let Some(identity) = &outcome.identity {
            if Some(identity.id.as_str()) != resource.id() {
                self.evict(ctx, config, identity)?;
            }
        }
        Ok(outcome)
    }

    fn delete(
        &self,
        ctx: &SyncContext,
        config: &SyncConfiguration,
        resource_type: &str,
        id: &str,
    ) -> SyncResult<WriteOutcome> {
        let client = self.clients.client_for(config)?;
        let identity = ResourceIdentity::new(resource_type, id);
        let deleted = client.delete(resource_type, id);
        let existed = self.evict_on_conflict(ctx, config, Some(&identity), deleted)?;
        self.evict(ctx, config, &identity)?;

        let outcome = if existed {
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
