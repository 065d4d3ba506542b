//! Queue listeners for both directions.
//!
//! Per message a listener:
//!
//! 1. resolves the owning configuration (gone means drop),
//! 2. resolves the current resource body (staged payload or fresh fetch),
//! 3. claims the change's fingerprint and skips the message if the
//!    fingerprint is already in the ledger,
//! 4. saves the resource through the resolver, restricted to the producing
//!    rule when the resource carries a composite id naming one,
//! 5. classifies a failure as drop, redeliver or fatal.
//!
//! Recording the fingerprint and deleting a staging record are deferred
//! through an [`Outbox`] and only happen once the message is finished for
//! good. A message handed back for redelivery leaves both untouched. The
//! claim is held until the outbox has run, so a concurrent delivery of the
//! same change waits and then finds the fingerprint recorded.

use crate::auth::SecurityContext;
use crate::configuration::{ConfigurationStore, SyncConfiguration};
use crate::context::SyncContext;
use crate::error::{FailureClass, SyncError, SyncResult};
use crate::ledger::DedupLedger;
use crate::lock::LockGuard;
use crate::outbox::Outbox;
use crate::repository::ResourceRepository;
use crate::resolver::SyncResolver;
use crate::staging::StagingStore;
use crate::transform::{Direction, RuleContext};
use fhirsync_protocol::{
    CompositeResourceId, ExportMessage, ExternalResource, ImportMessage, ProcessedItemFingerprint,
};
use parking_lot::RwLock;
use std::sync::Arc;
use tracing::{debug, error, info, info_span, warn};
use uuid::Uuid;

/// How a message was finished.
///
/// Fatal failures are returned as `Err` instead.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Delivery {
    /// At least one write was applied.
    Applied,
    /// Processed, but no rule produced a write.
    NotApplied,
    /// Already processed before.
    Duplicate,
    /// Dropped for good.
    Dropped(String),
    /// Hand the message back for later delivery.
    Redeliver(String),
}

impl Delivery {
    /// Returns true if the transport should acknowledge the message.
    pub fn is_final(&self) -> bool {
        !matches!(self, Delivery::Redeliver(_))
    }
}

/// Counters of a listener.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListenerStats {
    /// Messages handled.
    pub processed: u64,
    /// Messages that applied writes.
    pub applied: u64,
    /// Messages processed without writes.
    pub not_applied: u64,
    /// Duplicates skipped.
    pub duplicates: u64,
    /// Messages dropped.
    pub dropped: u64,
    /// Messages handed back.
    pub redelivered: u64,
    /// Fatal failures.
    pub failed: u64,
    /// Last fatal error.
    pub last_error: Option<String>,
}

/// Handles one message type.
pub trait MessageHandler<M>: Send + Sync {
    /// Processes `message`.
    fn handle(&self, message: &M) -> SyncResult<Delivery>;
}

/// What a listener needs to locate the resource a message announces.
struct Announcement<'a> {
    config_id: Uuid,
    resource_type: &'a str,
    resource_id: &'a str,
}

/// Shared processing of both listeners.
struct ListenerCore {
    direction: Direction,
    configurations: Arc<dyn ConfigurationStore>,
    ledger: Arc<dyn DedupLedger>,
    resolver: Arc<SyncResolver>,
    enabled: bool,
    stats: RwLock<ListenerStats>,
}

impl ListenerCore {
    fn security_for(config: &SyncConfiguration) -> SecurityContext {
        let security = SecurityContext::system();
        match &config.registry_credentials {
            Some(credentials) => security.with_authorization(credentials.authorization()),
            None => security,
        }
    }

    /// Processes one announcement. `load` resolves the resource body;
    /// `cleanup` runs once the message is finished for good.
    fn deliver<L>(
        &self,
        announcement: Announcement<'_>,
        load: L,
        cleanup: Option<Box<dyn FnOnce() -> SyncResult<()> + Send>>,
    ) -> SyncResult<Delivery>
    where
        L: FnOnce(&SyncContext, &SyncConfiguration) -> SyncResult<Option<ExternalResource>>,
    {
        let message_id = Uuid::new_v4();
        let span = info_span!(
            "sync_message",
            message = %message_id,
            direction = %self.direction,
            config = %announcement.config_id,
            resource = %format!("{}/{}", announcement.resource_type, announcement.resource_id),
        );
        let _enter = span.enter();

        let outbox = Outbox::new();
        let mut claim = None;
        let result = match self.apply(message_id, &announcement, load, &outbox, &mut claim) {
            Ok(delivery) => Ok(delivery),
            Err(e) => match e.classify() {
                FailureClass::Drop => {
                    warn!(error = %e, "dropping message");
                    Ok(Delivery::Dropped(e.to_string()))
                }
                FailureClass::Redeliver => {
                    info!(error = %e, "message will be redelivered");
                    Ok(Delivery::Redeliver(e.to_string()))
                }
                FailureClass::Fatal => {
                    error!(error = %e, "message failed");
                    Err(e)
                }
            },
        };

        match &result {
            Ok(delivery) if delivery.is_final() => {
                if let Some(cleanup) = cleanup {
                    outbox.defer("delete staging record", cleanup);
                }
                outbox.commit();
            }
            _ => {
                outbox.discard();
            }
        }
        drop(claim);
        self.count(&result);
        result
    }

    fn apply<'a, L>(
        &'a self,
        message_id: Uuid,
        announcement: &Announcement<'_>,
        load: L,
        outbox: &Outbox,
        claim: &mut Option<LockGuard<'a>>,
    ) -> SyncResult<Delivery>
    where
        L: FnOnce(&SyncContext, &SyncConfiguration) -> SyncResult<Option<ExternalResource>>,
    {
        if !self.enabled {
            debug!("direction is disabled");
            return Ok(Delivery::Dropped(format!("{} is disabled", self.direction)));
        }
        let Some(config) = self.configurations.find_by_id(announcement.config_id)? else {
            return Err(SyncError::ConfigurationGone(announcement.config_id));
        };
        let ctx = SyncContext::new(Self::security_for(&config)).with_message_id(message_id);

        let Some(mut resource) = load(&ctx, config.as_ref())? else {
            info!("resource no longer exists");
            return Ok(Delivery::Dropped("resource not found".into()));
        };

        let fingerprint = ProcessedItemFingerprint::from_resource(&resource);
        if let Some(fp) = &fingerprint {
            *claim = Some(self.resolver.orchestrator().locks().claim(config.client_id, fp));
        }
        match &fingerprint {
            Some(fp) if self.ledger.contains(config.client_id, fp)? => {
                debug!(fingerprint = %fp, "already processed");
                return Ok(Delivery::Duplicate);
            }
            Some(_) => {}
            None => warn!("resource has no last-modified version; duplicate detection disabled"),
        }

        let rules = producing_rule(&resource);
        let outcome = self.resolver.save(&ctx, &config, &mut resource, &rules)?;

        if let Some(fp) = fingerprint {
            let ledger = Arc::clone(&self.ledger);
            let group = config.client_id;
            outbox.defer("record fingerprint", move || {
                ledger.record(group, &fp).map(|_| ())
            });
        }
        if outcome.is_applied() {
            Ok(Delivery::Applied)
        } else {
            debug!("no write applied");
            Ok(Delivery::NotApplied)
        }
    }

    fn count(&self, result: &SyncResult<Delivery>) {
        let mut stats = self.stats.write();
        stats.processed += 1;
        match result {
            Ok(Delivery::Applied) => stats.applied += 1,
            Ok(Delivery::NotApplied) => stats.not_applied += 1,
            Ok(Delivery::Duplicate) => stats.duplicates += 1,
            Ok(Delivery::Dropped(_)) => stats.dropped += 1,
            Ok(Delivery::Redeliver(_)) => stats.redelivered += 1,
            Err(e) => {
                stats.failed += 1;
                stats.last_error = Some(e.to_string());
            }
        }
    }
}

/// Rules to evaluate for `resource`.
///
/// A resource whose system id (or, failing that, its own id) is a composite
/// id with a rule part was produced by that rule, and only that rule maps it
/// back.
fn producing_rule(resource: &ExternalResource) -> RuleContext {
    let rule = resource
        .system_id()
        .or_else(|| resource.id())
        .and_then(|id| CompositeResourceId::parse(id).ok())
        .and_then(|id| id.rule_id());
    match rule {
        Some(rule) => {
            debug!(rule = %rule, "composite id names the producing rule");
            RuleContext::single(rule)
        }
        None => RuleContext::all(),
    }
}

/// Imports FHIR-side changes into the registry.
pub struct ImportListener {
    core: ListenerCore,
    source: Arc<dyn ResourceRepository>,
    staging: Arc<dyn StagingStore>,
}

impl ImportListener {
    /// Creates an import listener.
    ///
    /// `source` is the FHIR-side repository; `resolver` persists to the
    /// registry side.
    pub fn new(
        configurations: Arc<dyn ConfigurationStore>,
        source: Arc<dyn ResourceRepository>,
        staging: Arc<dyn StagingStore>,
        ledger: Arc<dyn DedupLedger>,
        resolver: Arc<SyncResolver>,
    ) -> Self {
        Self {
            core: ListenerCore {
                direction: Direction::Import,
                configurations,
                ledger,
                resolver,
                enabled: true,
                stats: RwLock::new(ListenerStats::default()),
            },
            source,
            staging,
        }
    }

    /// Turns processing on or off. A disabled listener drops every message.
    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.core.enabled = enabled;
        self
    }

    /// Returns counters.
    pub fn stats(&self) -> ListenerStats {
        self.core.stats.read().clone()
    }
}

impl MessageHandler<ImportMessage> for ImportListener {
    fn handle(&self, message: &ImportMessage) -> SyncResult<Delivery> {
        let announcement = Announcement {
            config_id: message.config_id,
            resource_type: &message.resource_type,
            resource_id: &message.resource_id,
        };

        let cleanup: Option<Box<dyn FnOnce() -> SyncResult<()> + Send>> = if message.persisted {
            let staging = Arc::clone(&self.staging);
            let (config_id, resource_type, resource_id) = (
                message.config_id,
                message.resource_type.clone(),
                message.resource_id.clone(),
            );
            Some(Box::new(move || {
                staging
                    .delete(config_id, &resource_type, &resource_id)
                    .map(|_| ())
            }))
        } else {
            None
        };

        self.core.deliver(
            announcement,
            |ctx: &SyncContext, config: &SyncConfiguration| -> SyncResult<Option<ExternalResource>> {
                if message.persisted {
                    let staged =
                        self.staging
                            .find(config.id, &message.resource_type, &message.resource_id)?;
                    match staged {
                        Some(staged) => return staged.resource().map(Some),
                        None => debug!("staged payload is gone; fetching"),
                    }
                }
                self.source
                    .find_refreshed(ctx, config, &message.resource_type, &message.resource_id)
            },
            cleanup,
        )
    }
}

/// Exports registry-side changes to FHIR endpoints.
pub struct ExportListener {
    core: ListenerCore,
    source: Arc<dyn ResourceRepository>,
}

impl ExportListener {
    /// Creates an export listener.
    ///
    /// `source` is the registry-side repository; `resolver` persists to the
    /// FHIR side.
    pub fn new(
        configurations: Arc<dyn ConfigurationStore>,
        source: Arc<dyn ResourceRepository>,
        ledger: Arc<dyn DedupLedger>,
        resolver: Arc<SyncResolver>,
    ) -> Self {
        Self {
            core: ListenerCore {
                direction: Direction::Export,
                configurations,
                ledger,
                resolver,
                enabled: true,
                stats: RwLock::new(ListenerStats::default()),
            },
            source,
        }
    }

    /// Turns processing on or off. A disabled listener drops every message.
    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.core.enabled = enabled;
        self
    }

    /// Returns counters.
    pub fn stats(&self) -> ListenerStats {
        self.core.stats.read().clone()
    }
}

impl MessageHandler<ExportMessage> for ExportListener {
    fn handle(&self, message: &ExportMessage) -> SyncResult<Delivery> {
        let announcement = Announcement {
            config_id: message.config_id,
            resource_type: &message.resource_type,
            resource_id: &message.resource_id,
        };
        self.core.deliver(
            announcement,
            |ctx: &SyncContext, config: &SyncConfiguration| -> SyncResult<Option<ExternalResource>> {
                if message.deleted {
                    self.source
                        .find_deleted(ctx, config, &message.resource_type, &message.resource_id)
                } else {
                    self.source
                        .find_refreshed(ctx, config, &message.resource_type, &message.resource_id)
                }
            },
            None,
        )
    }
}
