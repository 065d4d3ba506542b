//! Rule-list transform service for tests.

use fhirsync_engine::{
    Direction, RuleContext, RuleInfo, SyncConfiguration, SyncContext, SyncResult, TransformOutcome,
    TransformService, TransformStep,
};
use fhirsync_protocol::ExternalResource;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use uuid::Uuid;

/// Maps a source resource to the resource to persist, or `None` to skip.
///
/// The context is the one of the message being processed, so a rule can
/// read through the same request cache the engine uses.
pub type RuleFn =
    Arc<dyn Fn(&SyncContext, &ExternalResource) -> SyncResult<Option<ExternalResource>> + Send + Sync>;

/// One scripted rule.
#[derive(Clone)]
pub struct ScriptedRule {
    /// Rule id and name.
    pub info: RuleInfo,
    /// Direction the rule applies to.
    pub direction: Direction,
    /// Source resource type the rule applies to.
    pub source_type: String,
    /// Configuration outcomes are persisted under.
    pub target: Arc<SyncConfiguration>,
    map: RuleFn,
}

impl ScriptedRule {
    /// Creates a rule applying `map` to `source_type` resources.
    pub fn new<F>(
        name: &str,
        direction: Direction,
        source_type: &str,
        target: Arc<SyncConfiguration>,
        map: F,
    ) -> Self
    where
        F: Fn(&SyncContext, &ExternalResource) -> SyncResult<Option<ExternalResource>>
            + Send
            + Sync
            + 'static,
    {
        Self {
            info: RuleInfo::new(Uuid::new_v4(), name),
            direction,
            source_type: source_type.to_string(),
            target,
            map: Arc::new(map),
        }
    }

    /// A rule that copies the source body into a `target_type` resource with
    /// the same id.
    pub fn copy_to(
        name: &str,
        direction: Direction,
        source_type: &str,
        target_type: &str,
        target: Arc<SyncConfiguration>,
    ) -> Self {
        let target_type = target_type.to_string();
        Self::new(name, direction, source_type, target, move |_ctx, source| {
            let mut produced = ExternalResource::new(target_type.clone(), source.body().clone());
            if let Some(id) = source.id() {
                produced.set_id(id);
            }
            Ok(Some(produced.with_deleted(source.is_deleted())))
        })
    }

    fn applies(&self, resource: &ExternalResource, rules: &RuleContext, direction: Direction) -> bool {
        self.direction == direction
            && self.source_type == resource.resource_type()
            && rules.rule_id.map_or(true, |id| id == self.info.id)
    }
}

/// Transform service driven by a list of [`ScriptedRule`]s.
///
/// The step cursor indexes the rule list. Each applicable rule yields one
/// outcome, chained to the next applicable rule. A deleted source produces a
/// delete outcome.
#[derive(Default)]
pub struct ScriptedTransformService {
    rules: RwLock<Vec<ScriptedRule>>,
    transforms: AtomicU64,
}

impl ScriptedTransformService {
    /// Creates a service without rules.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a rule and returns its id.
    pub fn add_rule(&self, rule: ScriptedRule) -> Uuid {
        let id = rule.info.id;
        self.rules.write().push(rule);
        id
    }

    /// Number of `transform` calls.
    pub fn transforms(&self) -> u64 {
        self.transforms.load(Ordering::SeqCst)
    }

    fn next_applicable(&self, from: usize, step: &TransformStep) -> Option<usize> {
        let rules = self.rules.read();
        (from..rules.len()).find(|&i| rules[i].applies(&step.resource, &step.rules, step.direction))
    }
}

impl TransformService for ScriptedTransformService {
    fn create_step(
        &self,
        _ctx: &SyncContext,
        config: &Arc<SyncConfiguration>,
        resource: &ExternalResource,
        rules: &RuleContext,
        direction: Direction,
    ) -> SyncResult<Option<TransformStep>> {
        let step = TransformStep::new(Arc::clone(config), resource.clone(), rules.clone(), direction);
        Ok(self.next_applicable(0, &step).map(|cursor| step.advance(cursor)))
    }

    fn transform(&self, ctx: &SyncContext, step: &TransformStep) -> SyncResult<Option<TransformOutcome>> {
        self.transforms.fetch_add(1, Ordering::SeqCst);
        let Some(index) = self.next_applicable(step.cursor, step) else {
            return Ok(None);
        };
        let rule = self.rules.read()[index].clone();

        let mut outcome = match (rule.map)(ctx, &step.resource)? {
            Some(produced) if step.resource.is_deleted() => {
                TransformOutcome::delete(Arc::clone(&rule.target), produced)
            }
            Some(produced) => TransformOutcome::save(Arc::clone(&rule.target), produced),
            None => TransformOutcome::skip(Arc::clone(&rule.target)),
        }
        .with_rule(rule.info.clone());

        if let Some(next) = self.next_applicable(index + 1, step) {
            outcome = outcome.with_next(step.advance(next));
        }
        Ok(Some(outcome))
    }
}
