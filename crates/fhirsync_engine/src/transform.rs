//! Contract of the rule-driven transform service.
//!
//! The engine does not know how rules map fields. It asks the transform
//! service for a [`TransformStep`], submits it, and follows the `next` link
//! of every [`TransformOutcome`] until the chain ends.

use crate::context::SyncContext;
use crate::configuration::SyncConfiguration;
use crate::error::SyncResult;
use fhirsync_protocol::ExternalResource;
use std::fmt;
use std::sync::Arc;
use uuid::Uuid;

/// Direction a change flows in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// FHIR side to registry side.
    Import,
    /// Registry side to FHIR side.
    Export,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Direction::Import => "import",
            Direction::Export => "export",
        })
    }
}

/// Which rules a save request asks for.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RuleContext {
    /// Restrict evaluation to this rule.
    pub rule_id: Option<Uuid>,
    /// Stop after the first rule that produced an outcome.
    pub first_rule_only: bool,
    /// The resource was embedded in another one being saved.
    pub contained: bool,
}

impl RuleContext {
    /// Evaluates every applicable rule.
    pub fn all() -> Self {
        Self::default()
    }

    /// Forces a single rule.
    pub fn single(rule_id: Uuid) -> Self {
        Self {
            rule_id: Some(rule_id),
            first_rule_only: true,
            contained: false,
        }
    }

    /// Evaluates rules until the first one applies.
    pub fn first_only() -> Self {
        Self {
            first_rule_only: true,
            ..Self::default()
        }
    }

    /// Marks the request as coming from a contained-resource cascade.
    pub fn for_contained(mut self) -> Self {
        self.contained = true;
        self
    }
}

/// The rule an outcome was produced by.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleInfo {
    /// Rule id.
    pub id: Uuid,
    /// Rule name for logs.
    pub name: String,
}

impl RuleInfo {
    /// Creates rule info.
    pub fn new(id: Uuid, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
        }
    }
}

/// One unit of transform work: one resource under one candidate rule.
#[derive(Debug, Clone)]
pub struct TransformStep {
    /// Configuration the change arrived through.
    pub config: Arc<SyncConfiguration>,
    /// Resource to transform.
    pub resource: ExternalResource,
    /// Requested rules.
    pub rules: RuleContext,
    /// Flow direction.
    pub direction: Direction,
    /// Position in the candidate rule list, owned by the transform service.
    pub cursor: usize,
}

impl TransformStep {
    /// Creates the first step for `resource`.
    pub fn new(
        config: Arc<SyncConfiguration>,
        resource: ExternalResource,
        rules: RuleContext,
        direction: Direction,
    ) -> Self {
        Self {
            config,
            resource,
            rules,
            direction,
            cursor: 0,
        }
    }

    /// Returns the step after this one, at `cursor`.
    pub fn advance(&self, cursor: usize) -> Self {
        Self {
            cursor,
            ..self.clone()
        }
    }
}

/// Result of transforming one step.
#[derive(Debug, Clone)]
pub struct TransformOutcome {
    /// Resource to persist on the opposite side.
    pub resource: Option<ExternalResource>,
    /// Delete `resource` instead of creating or updating it.
    pub delete: bool,
    /// Rule that matched.
    pub rule: Option<RuleInfo>,
    /// Configuration the produced resource is persisted under.
    pub target: Arc<SyncConfiguration>,
    /// Next step of the chain.
    pub next: Option<TransformStep>,
}

impl TransformOutcome {
    /// An outcome that persists `resource` under `target`.
    pub fn save(target: Arc<SyncConfiguration>, resource: ExternalResource) -> Self {
        Self {
            resource: Some(resource),
            delete: false,
            rule: None,
            target,
            next: None,
        }
    }

    /// An outcome that deletes `resource` under `target`.
    pub fn delete(target: Arc<SyncConfiguration>, resource: ExternalResource) -> Self {
        Self {
            delete: true,
            ..Self::save(target, resource)
        }
    }

    /// An outcome that persists nothing but continues the chain.
    pub fn skip(target: Arc<SyncConfiguration>) -> Self {
        Self {
            resource: None,
            delete: false,
            rule: None,
            target,
            next: None,
        }
    }

    /// Sets the rule.
    pub fn with_rule(mut self, rule: RuleInfo) -> Self {
        self.rule = Some(rule);
        self
    }

    /// Sets the next step.
    pub fn with_next(mut self, next: TransformStep) -> Self {
        self.next = Some(next);
        self
    }
}

/// The rule-driven transform service.
///
/// Given identical inputs it must return identical outcomes, and it must not
/// have side effects beyond its outcome. A missing prerequisite is signalled
/// as [`SyncError::MissingDependency`](crate::SyncError) or
/// [`SyncError::PrerequisiteNotFound`](crate::SyncError).
pub trait TransformService: Send + Sync {
    /// Builds the first step, or `None` if no rule could apply.
    fn create_step(
        &self,
        ctx: &SyncContext,
        config: &Arc<SyncConfiguration>,
        resource: &ExternalResource,
        rules: &RuleContext,
        direction: Direction,
    ) -> SyncResult<Option<TransformStep>>;

    /// Transforms one step, or returns `None` if its rule does not apply.
    fn transform(&self, ctx: &SyncContext, step: &TransformStep) -> SyncResult<Option<TransformOutcome>>;
}
