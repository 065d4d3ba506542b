//! Recovery around the transform chain.
//!
//! Three conditions are recovered from before an error leaves the resolver:
//!
//! - **Version conflict.** The whole transform-and-persist is attempted up to
//!   `max_attempts` times, since its inputs may change between attempts.
//!   The request cache is emptied before each retry and the target
//!   repository evicts the refused resource, so the retry reads fresh.
//! - **Missing dependency.** The dependency is fetched fresh from the source
//!   side and saved first, recursively, then the original is retried. A
//!   dependency requested twice within one save is a cycle and fails.
//! - **Absent prerequisite.** The prerequisite is fetched and saved once and
//!   the original retried once. If it is still absent the original is
//!   dropped without error.
//!
//! After a top-level save, every contained resource is saved under its own
//! configuration. Their failures are logged and do not affect the result.

use crate::config::RetryConfig;
use crate::configuration::{ConfigurationStore, SyncConfiguration};
use crate::context::SyncContext;
use crate::error::{SyncError, SyncResult};
use crate::orchestrator::{SaveOutcome, TransformChainOrchestrator};
use crate::repository::ResourceRepository;
use crate::transform::RuleContext;
use fhirsync_protocol::ExternalResource;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Saves resources through the orchestrator, resolving what can be resolved.
pub struct SyncResolver {
    orchestrator: TransformChainOrchestrator,
    source: Arc<dyn ResourceRepository>,
    configurations: Arc<dyn ConfigurationStore>,
    retry: RetryConfig,
}

impl SyncResolver {
    /// Creates a resolver reading dependencies from `source`.
    pub fn new(
        orchestrator: TransformChainOrchestrator,
        source: Arc<dyn ResourceRepository>,
        configurations: Arc<dyn ConfigurationStore>,
        retry: RetryConfig,
    ) -> Self {
        Self {
            orchestrator,
            source,
            configurations,
            retry,
        }
    }

    /// Returns the orchestrator.
    pub fn orchestrator(&self) -> &TransformChainOrchestrator {
        &self.orchestrator
    }

    /// Returns the source-side repository.
    pub fn source(&self) -> &Arc<dyn ResourceRepository> {
        &self.source
    }

    /// Saves `resource` and then its contained resources.
    pub fn save(
        &self,
        ctx: &SyncContext,
        config: &Arc<SyncConfiguration>,
        resource: &mut ExternalResource,
        rules: &RuleContext,
    ) -> SyncResult<SaveOutcome> {
        let mut seen = HashSet::new();
        if let Some(identity) = resource.identity() {
            seen.insert(identity.unversioned());
        }
        let outcome = self.save_with_dependencies(ctx, config, resource, rules, &mut seen)?;
        if !rules.contained {
            self.save_contained(ctx, config, resource);
        }
        Ok(outcome)
    }

    /// Runs the deletion of `resource_type/id` through the chain.
    ///
    /// Returns true if something was deleted on the opposite side.
    pub fn delete(
        &self,
        ctx: &SyncContext,
        config: &Arc<SyncConfiguration>,
        resource_type: &str,
        id: &str,
    ) -> SyncResult<bool> {
        let Some(mut tombstone) = self.source.find_deleted(ctx, config, resource_type, id)? else {
            debug!(resource_type, id, "no deletion to propagate");
            return Ok(false);
        };
        let outcome = self.save(ctx, config, &mut tombstone, &RuleContext::all())?;
        Ok(outcome.deleted > 0)
    }

    fn save_with_dependencies(
        &self,
        ctx: &SyncContext,
        config: &Arc<SyncConfiguration>,
        resource: &mut ExternalResource,
        rules: &RuleContext,
        seen: &mut HashSet<String>,
    ) -> SyncResult<SaveOutcome> {
        loop {
            match self.save_with_prerequisite(ctx, config, resource, rules) {
                Err(SyncError::MissingDependency { resource_type, id }) => {
                    if !seen.insert(format!("{resource_type}/{id}")) {
                        warn!(
                            dependency = %format!("{resource_type}/{id}"),
                            "dependency requested twice"
                        );
                        return Err(SyncError::DependencyCycle { resource_type, id });
                    }
                    self.resolve_dependency(ctx, config, &resource_type, &id, seen)?;
                }
                other => return other,
            }
        }
    }

    fn resolve_dependency(
        &self,
        ctx: &SyncContext,
        config: &SyncConfiguration,
        resource_type: &str,
        id: &str,
        seen: &mut HashSet<String>,
    ) -> SyncResult<()> {
        let unresolvable = |reason: &str| SyncError::UnresolvableDependency {
            resource_type: resource_type.to_string(),
            id: id.to_string(),
            reason: reason.to_string(),
        };

        let dependency_config = self
            .configurations
            .find_by_resource_type(config.client_id, resource_type)?
            .ok_or_else(|| unresolvable("no configuration handles the type"))?;
        let mut dependency = self
            .source
            .find_refreshed(ctx, &dependency_config, resource_type, id)?
            .ok_or_else(|| unresolvable("not found on the source side"))?;

        info!(dependency = %format!("{resource_type}/{id}"), "saving missing dependency first");
        self.save_with_dependencies(
            ctx,
            &dependency_config,
            &mut dependency,
            &RuleContext::all(),
            seen,
        )?;
        Ok(())
    }

    fn save_with_prerequisite(
        &self,
        ctx: &SyncContext,
        config: &Arc<SyncConfiguration>,
        resource: &mut ExternalResource,
        rules: &RuleContext,
    ) -> SyncResult<SaveOutcome> {
        let (resource_type, id) = match self.save_retried(ctx, config, resource, rules) {
            Err(SyncError::PrerequisiteNotFound { resource_type, id }) => (resource_type, id),
            other => return other,
        };

        let prerequisite = format!("{resource_type}/{id}");
        if !self.recover_prerequisite(ctx, config, &resource_type, &id)? {
            warn!(prerequisite = %prerequisite, "prerequisite unavailable; dropping resource");
            return Ok(SaveOutcome::not_applied());
        }
        match self.save_retried(ctx, config, resource, rules) {
            Err(SyncError::PrerequisiteNotFound { .. }) => {
                warn!(prerequisite = %prerequisite, "prerequisite still absent; dropping resource");
                Ok(SaveOutcome::not_applied())
            }
            other => other,
        }
    }

    /// Fetches the prerequisite and runs it through the pipeline once.
    fn recover_prerequisite(
        &self,
        ctx: &SyncContext,
        config: &SyncConfiguration,
        resource_type: &str,
        id: &str,
    ) -> SyncResult<bool> {
        let Some(prerequisite_config) = self
            .configurations
            .find_by_resource_type(config.client_id, resource_type)?
        else {
            return Ok(false);
        };
        let Some(mut prerequisite) =
            self.source
                .find_refreshed(ctx, &prerequisite_config, resource_type, id)?
        else {
            return Ok(false);
        };

        match self.save_retried(ctx, &prerequisite_config, &mut prerequisite, &RuleContext::all()) {
            Ok(outcome) => Ok(outcome.is_applied()),
            Err(SyncError::PrerequisiteNotFound { .. }) => Ok(false),
            Err(e) => Err(e),
        }
    }

    fn save_retried(
        &self,
        ctx: &SyncContext,
        config: &Arc<SyncConfiguration>,
        resource: &mut ExternalResource,
        rules: &RuleContext,
    ) -> SyncResult<SaveOutcome> {
        let mut attempt = 0;
        loop {
            match self.orchestrator.run(ctx, config, resource, rules) {
                Err(e) if e.is_conflict() => {
                    attempt += 1;
                    if attempt >= self.retry.max_attempts {
                        warn!(attempts = attempt, error = %e, "giving up after version conflicts");
                        return Err(e);
                    }
                    // Lookups made for the refused attempt may be stale.
                    ctx.request_cache().clear();
                    let delay = self.retry.delay_for_attempt(attempt);
                    debug!(attempt, delay_ms = delay.as_millis() as u64, "retrying after version conflict");
                    if !delay.is_zero() {
                        std::thread::sleep(delay);
                    }
                }
                other => return other,
            }
        }
    }

    fn save_contained(&self, ctx: &SyncContext, config: &SyncConfiguration, resource: &ExternalResource) {
        let contained = match resource.contained() {
            Ok(contained) => contained,
            Err(e) => {
                warn!(error = %e, "cannot read contained resources");
                return;
            }
        };

        for mut item in contained {
            let resource_type = item.resource_type().to_string();
            let target = match self
                .configurations
                .find_by_resource_type(config.client_id, &resource_type)
            {
                Ok(Some(target)) => target,
                Ok(None) => {
                    debug!(resource_type = %resource_type, "no configuration for contained resource");
                    continue;
                }
                Err(e) => {
                    warn!(resource_type = %resource_type, error = %e, "cannot resolve configuration");
                    continue;
                }
            };
            if let Err(e) = self.save(ctx, &target, &mut item, &RuleContext::all().for_contained()) {
                warn!(
                    resource_type = %resource_type,
                    id = ?item.id(),
                    error = %e,
                    "contained resource not saved"
                );
            }
        }
    }
}
