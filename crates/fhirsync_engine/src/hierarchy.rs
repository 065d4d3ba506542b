//! Ancestor chains along parent references.

use crate::cache::CacheStore;
use crate::configuration::SyncConfiguration;
use crate::context::SyncContext;
use crate::error::SyncResult;
use crate::repository::FhirResourceRepository;
use crate::version_support::VersionMap;
use fhirsync_protocol::{ExternalResource, Reference, ResourceEndpointKey, ResourceLookup};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, trace};

/// Returns a parent accessor reading the reference at JSON `pointer`, e.g.
/// `/partOf` for locations and organizations.
pub fn parent_at(pointer: &str) -> impl Fn(&ExternalResource) -> Option<Reference> + '_ {
    move |resource| resource.reference_at(pointer)
}

/// Walks parent references from a start resource.
pub struct HierarchyResolver {
    repository: Arc<FhirResourceRepository>,
    versions: VersionMap,
}

impl HierarchyResolver {
    /// Creates a resolver fetching through `repository`.
    pub fn new(repository: Arc<FhirResourceRepository>) -> Self {
        Self {
            repository,
            versions: VersionMap::standard(),
        }
    }

    /// Replaces the version map used to build bundles.
    pub fn with_versions(mut self, versions: VersionMap) -> Self {
        self.versions = versions;
        self
    }

    /// Returns `resource_type/id` followed by its ancestors, leaf first.
    ///
    /// The walk stops at an empty reference, a parent that cannot be found,
    /// or a parent already in the chain. A parent reference without a type
    /// is taken to have the type of its child. The result is cached under
    /// the hierarchy namespace of `kind`. An absent id or start resource
    /// yields an empty chain.
    pub fn find_with_parents(
        &self,
        ctx: &SyncContext,
        config: &SyncConfiguration,
        resource_type: &str,
        id: Option<&str>,
        kind: &str,
        parent_of: &dyn Fn(&ExternalResource) -> Option<Reference>,
    ) -> SyncResult<Vec<ExternalResource>> {
        let Some(id) = id.filter(|id| !id.is_empty()) else {
            return Ok(Vec::new());
        };
        let support = self.versions.get(config.fhir_version)?;
        let key = ResourceEndpointKey::new(
            config.id,
            config.fhir_version,
            resource_type,
            ResourceLookup::Hierarchy {
                id: id.to_string(),
                kind: kind.to_string(),
            },
            false,
        );

        if let Some(cached) = self.cache().get(&key)? {
            trace!(key = %key, "hierarchy cache hit");
            return support.bundle_entries(&cached.to_fhir_json());
        }

        let chain = self.walk(ctx, config, resource_type, id, parent_of)?;
        if !chain.is_empty() {
            let bundle = support.create_bundle("collection", &chain);
            self.cache()
                .put(&key, &ExternalResource::from_fhir_json(bundle)?)?;
        }
        Ok(chain)
    }

    /// Same as [`find_with_parents`](Self::find_with_parents), wrapped in a
    /// collection bundle of the configured FHIR version.
    pub fn find_bundle_with_parents(
        &self,
        ctx: &SyncContext,
        config: &SyncConfiguration,
        resource_type: &str,
        id: Option<&str>,
        kind: &str,
        parent_of: &dyn Fn(&ExternalResource) -> Option<Reference>,
    ) -> SyncResult<serde_json::Value> {
        let chain = self.find_with_parents(ctx, config, resource_type, id, kind, parent_of)?;
        Ok(self
            .versions
            .get(config.fhir_version)?
            .create_bundle("collection", &chain))
    }

    /// Drops the cached chain of `resource_type/id` along `kind`.
    pub fn evict(
        &self,
        config: &SyncConfiguration,
        resource_type: &str,
        id: &str,
        kind: &str,
    ) -> SyncResult<bool> {
        let key = ResourceEndpointKey::new(
            config.id,
            config.fhir_version,
            resource_type,
            ResourceLookup::Hierarchy {
                id: id.to_string(),
                kind: kind.to_string(),
            },
            false,
        );
        self.cache().evict(&key)
    }

    fn cache(&self) -> &Arc<dyn CacheStore> {
        self.repository.cache()
    }

    fn walk(
        &self,
        ctx: &SyncContext,
        config: &SyncConfiguration,
        resource_type: &str,
        id: &str,
        parent_of: &dyn Fn(&ExternalResource) -> Option<Reference>,
    ) -> SyncResult<Vec<ExternalResource>> {
        let Some(start) = self.repository.find(ctx, config, resource_type, id)? else {
            debug!(resource_type, id, "hierarchy start not found");
            return Ok(Vec::new());
        };

        let mut visited = HashSet::new();
        visited.insert(format!("{resource_type}/{id}"));
        let mut chain = vec![start];

        loop {
            let Some(current) = chain.last() else {
                break;
            };
            let Some(reference) = parent_of(current) else {
                break;
            };
            if reference.is_empty() {
                break;
            }

            let parent_type = reference
                .resource_type
                .clone()
                .unwrap_or_else(|| current.resource_type().to_string());
            let parent = match reference.inline {
                Some(inline) => *inline,
                None => {
                    let Some(parent_id) = reference.id.as_deref() else {
                        break;
                    };
                    if visited.contains(&format!("{parent_type}/{parent_id}")) {
                        debug!(parent = %format!("{parent_type}/{parent_id}"), "hierarchy cycle");
                        break;
                    }
                    match self.repository.find(ctx, config, &parent_type, parent_id)? {
                        Some(parent) => parent,
                        None => {
                            debug!(parent = %format!("{parent_type}/{parent_id}"), "parent not found");
                            break;
                        }
                    }
                }
            };

            if let Some(identity) = parent.identity() {
                if !visited.insert(identity.unversioned()) {
                    debug!(parent = %identity, "hierarchy cycle");
                    break;
                }
            }
            if chain.contains(&parent) {
                break;
            }
            chain.push(parent);
        }
        Ok(chain)
    }
}
