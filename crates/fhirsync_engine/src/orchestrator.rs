//! Drives the transform chain for one changed resource.

use crate::client::WriteOutcome;
use crate::configuration::SyncConfiguration;
use crate::context::SyncContext;
use crate::error::SyncResult;
use crate::ledger::DedupLedger;
use crate::lock::LockManager;
use crate::repository::ResourceRepository;
use crate::transform::{Direction, RuleContext, RuleInfo, TransformService};
use fhirsync_protocol::{CompositeResourceId, DhisResourceType, ExternalResource, ResourceIdentity};
use std::sync::Arc;
use tracing::{debug, debug_span, info, warn};
use uuid::Uuid;

/// What one save request did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SaveOutcome {
    /// Writes applied on the opposite side, deletions included.
    pub persisted: usize,
    /// Deletions among them.
    pub deleted: usize,
    /// Rules that produced an outcome, in chain order.
    pub rules: Vec<Uuid>,
    /// Fingerprints of the writes recorded in the ledger.
    pub fingerprints_recorded: usize,
    /// Composite id attached to the source resource by this request.
    pub system_id: Option<String>,
}

impl SaveOutcome {
    /// Nothing was written.
    pub fn not_applied() -> Self {
        Self::default()
    }

    /// Returns true if at least one write was applied.
    pub fn is_applied(&self) -> bool {
        self.persisted > 0
    }
}

/// Converts one change into writes on the opposite side.
///
/// The transform service is asked for a first step; each outcome is
/// persisted through the target repository and its `next` link followed
/// until the chain ends. The whole chain runs under the lock of the
/// configured scope.
pub struct TransformChainOrchestrator {
    transform: Arc<dyn TransformService>,
    target: Arc<dyn ResourceRepository>,
    ledger: Arc<dyn DedupLedger>,
    locks: Arc<LockManager>,
    direction: Direction,
}

impl TransformChainOrchestrator {
    /// Creates an orchestrator persisting to `target`.
    pub fn new(
        direction: Direction,
        transform: Arc<dyn TransformService>,
        target: Arc<dyn ResourceRepository>,
        ledger: Arc<dyn DedupLedger>,
        locks: Arc<LockManager>,
    ) -> Self {
        Self {
            transform,
            target,
            ledger,
            locks,
            direction,
        }
    }

    /// Returns the direction.
    pub fn direction(&self) -> Direction {
        self.direction
    }

    /// Returns the lock manager writes run under.
    pub fn locks(&self) -> &Arc<LockManager> {
        &self.locks
    }

    /// Runs the chain for `resource`.
    ///
    /// On the first applied write, the composite id of the registry-side
    /// record is attached to `resource` unless it already carries one.
    pub fn run(
        &self,
        ctx: &SyncContext,
        config: &Arc<SyncConfiguration>,
        resource: &mut ExternalResource,
        rules: &RuleContext,
    ) -> SyncResult<SaveOutcome> {
        let identity = resource.identity();
        let label = match &identity {
            Some(identity) => identity.to_string(),
            None => resource.resource_type().to_string(),
        };
        let span = debug_span!(
            "transform_chain",
            direction = %self.direction,
            config = %config.code,
            resource = %label,
        );
        let _enter = span.enter();
        let _guard = self.locks.lock(config, identity.as_ref());

        let Some(mut step) =
            self.transform
                .create_step(ctx, config, resource, rules, self.direction)?
        else {
            debug!("no rule applies");
            return Ok(SaveOutcome::not_applied());
        };

        let mut outcome = SaveOutcome::default();
        loop {
            let Some(result) = self.transform.transform(ctx, &step)? else {
                debug!(cursor = step.cursor, "rule did not apply");
                break;
            };
            if let Some(rule) = &result.rule {
                outcome.rules.push(rule.id);
            }

            if let Some(mut produced) = result.resource {
                if self.direction == Direction::Export && produced.system_id().is_none() {
                    if let Some(system_id) = identity
                        .as_ref()
                        .and_then(|i| composite_id(i, result.rule.as_ref()))
                    {
                        produced.set_system_id(system_id);
                    }
                }

                let write = self.persist(ctx, &result.target, &produced, result.delete)?;
                if write.applied {
                    outcome.persisted += 1;
                    if write.deleted {
                        outcome.deleted += 1;
                    }
                    if self.record_fingerprint(&result.target, &write) {
                        outcome.fingerprints_recorded += 1;
                    }
                    if resource.system_id().is_none() {
                        let registry_identity = match self.direction {
                            Direction::Import => write.identity.as_ref(),
                            Direction::Export => identity.as_ref(),
                        };
                        if let Some(system_id) =
                            registry_identity.and_then(|i| composite_id(i, result.rule.as_ref()))
                        {
                            debug!(system_id = %system_id, "attaching composite id");
                            resource.set_system_id(system_id.clone());
                            outcome.system_id = Some(system_id);
                        }
                    }
                }
            }

            if rules.first_rule_only {
                break;
            }
            match result.next {
                Some(next) => step = next,
                None => break,
            }
        }

        if outcome.is_applied() {
            info!(
                persisted = outcome.persisted,
                deleted = outcome.deleted,
                "transform chain applied"
            );
        }
        Ok(outcome)
    }

    fn persist(
        &self,
        ctx: &SyncContext,
        target: &SyncConfiguration,
        produced: &ExternalResource,
        delete: bool,
    ) -> SyncResult<WriteOutcome> {
        if !delete {
            return self.target.save(ctx, target, produced);
        }
        match produced.id() {
            Some(id) => self.target.delete(ctx, target, produced.resource_type(), id),
            None => {
                debug!(
                    resource_type = produced.resource_type(),
                    "nothing to delete without an id"
                );
                Ok(WriteOutcome::skipped())
            }
        }
    }

    /// Records the fingerprint of a write so its echo is skipped.
    fn record_fingerprint(&self, target: &SyncConfiguration, write: &WriteOutcome) -> bool {
        let Some(fingerprint) = write.fingerprint() else {
            if !write.deleted {
                warn!(
                    resource = ?write.identity,
                    "target reported no last-modified version; duplicate detection disabled"
                );
            }
            return false;
        };
        match self.ledger.record(target.client_id, &fingerprint) {
            Ok(_) => true,
            Err(e) => {
                warn!(fingerprint = %fingerprint, error = %e, "cannot record fingerprint");
                false
            }
        }
    }
}

/// Composite id of a registry-side record produced by `rule`.
fn composite_id(identity: &ResourceIdentity, rule: Option<&RuleInfo>) -> Option<String> {
    let kind = DhisResourceType::from_type_name(&identity.resource_type)?;
    CompositeResourceId::new(Some(kind), identity.id.clone(), rule.map(|r| r.id))
        .ok()
        .map(|id| id.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn composite_ids_only_for_registry_types() {
        let rule = RuleInfo::new(Uuid::nil(), "r");
        assert_eq!(
            composite_id(&ResourceIdentity::new("TrackedEntity", "abc123"), Some(&rule)).unwrap(),
            format!("te-abc123-{}", Uuid::nil().simple())
        );
        assert_eq!(
            composite_id(&ResourceIdentity::new("OrganizationUnit", "ou1"), None).unwrap(),
            "ou-ou1"
        );
        assert!(composite_id(&ResourceIdentity::new("Patient", "7"), None).is_none());
    }
}
