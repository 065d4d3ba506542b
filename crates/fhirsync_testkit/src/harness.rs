//! Fully wired engine over in-memory collaborators.

use crate::configurations::StaticConfigurationStore;
use crate::fixtures::{fhir_config, registry_config};
use crate::registry::InMemoryDhisRepository;
use crate::server::InMemoryFhirServer;
use crate::transform::{ScriptedRule, ScriptedTransformService};
use fhirsync_engine::{
    CacheStore, ClientRegistry, ConfigurationStore, DedupLedger, Direction, EngineConfig,
    ExportListener, FhirResourceRepository, HierarchyResolver, ImportListener, LockManager,
    MemoryCacheStore, MemoryLedger, MemoryStagingStore, ResourceRepository, StagingStore,
    SyncConfiguration, SyncContext, SyncResolver, TransformChainOrchestrator, TransformService,
};
use fhirsync_protocol::FhirVersion;
use std::sync::Arc;
use uuid::Uuid;

/// Both synchronization directions wired over in-memory fakes.
///
/// Imports read from [`server`](Self::server) and write to
/// [`registry`](Self::registry); exports go the other way. Configurations
/// are added per test.
pub struct TestHarness {
    /// Remote client all configurations belong to.
    pub client_id: Uuid,
    /// Engine settings the harness was built with.
    pub config: EngineConfig,
    /// FHIR endpoint.
    pub server: InMemoryFhirServer,
    /// Registry side.
    pub registry: Arc<InMemoryDhisRepository>,
    /// Configurations.
    pub configurations: Arc<StaticConfigurationStore>,
    /// Shared resource cache.
    pub cache: Arc<MemoryCacheStore>,
    /// FHIR-side repository.
    pub fhir: Arc<FhirResourceRepository>,
    /// Dedup ledger.
    pub ledger: Arc<MemoryLedger>,
    /// Staging store.
    pub staging: Arc<MemoryStagingStore>,
    /// Transform rules.
    pub transforms: Arc<ScriptedTransformService>,
    /// Resolver of the import direction.
    pub import_resolver: Arc<SyncResolver>,
    /// Resolver of the export direction.
    pub export_resolver: Arc<SyncResolver>,
    /// Import listener.
    pub import_listener: ImportListener,
    /// Export listener.
    pub export_listener: ExportListener,
}

impl TestHarness {
    /// Creates a harness with default engine settings.
    pub fn new() -> Self {
        Self::with_config(EngineConfig::default())
    }

    /// Creates a harness with `config`.
    pub fn with_config(config: EngineConfig) -> Self {
        let server = InMemoryFhirServer::new();
        let registry = Arc::new(InMemoryDhisRepository::new());
        let configurations = Arc::new(StaticConfigurationStore::new());
        let cache = Arc::new(MemoryCacheStore::new(config.cache_capacity));
        let clients = Arc::new(ClientRegistry::new(Arc::new(server.clone())));
        let fhir = Arc::new(FhirResourceRepository::new(
            clients,
            Arc::clone(&cache) as Arc<dyn CacheStore>,
        ));
        let ledger = Arc::new(MemoryLedger::new());
        let staging = Arc::new(MemoryStagingStore::new());
        let transforms = Arc::new(ScriptedTransformService::new());
        let locks = Arc::new(LockManager::new(config.lock_scope, config.lock_stripes));

        let resolver = |direction: Direction,
                        target: Arc<dyn ResourceRepository>,
                        source: Arc<dyn ResourceRepository>| {
            Arc::new(SyncResolver::new(
                TransformChainOrchestrator::new(
                    direction,
                    Arc::clone(&transforms) as Arc<dyn TransformService>,
                    target,
                    Arc::clone(&ledger) as Arc<dyn DedupLedger>,
                    Arc::clone(&locks),
                ),
                source,
                Arc::clone(&configurations) as Arc<dyn ConfigurationStore>,
                config.conflict_retry.clone(),
            ))
        };
        let import_resolver = resolver(
            Direction::Import,
            Arc::clone(&registry) as Arc<dyn ResourceRepository>,
            Arc::clone(&fhir) as Arc<dyn ResourceRepository>,
        );
        let export_resolver = resolver(
            Direction::Export,
            Arc::clone(&fhir) as Arc<dyn ResourceRepository>,
            Arc::clone(&registry) as Arc<dyn ResourceRepository>,
        );

        let import_listener = ImportListener::new(
            Arc::clone(&configurations) as Arc<dyn ConfigurationStore>,
            Arc::clone(&fhir) as Arc<dyn ResourceRepository>,
            Arc::clone(&staging) as Arc<dyn StagingStore>,
            Arc::clone(&ledger) as Arc<dyn DedupLedger>,
            Arc::clone(&import_resolver),
        )
        .with_enabled(config.listener.import_enabled);
        let export_listener = ExportListener::new(
            Arc::clone(&configurations) as Arc<dyn ConfigurationStore>,
            Arc::clone(&registry) as Arc<dyn ResourceRepository>,
            Arc::clone(&ledger) as Arc<dyn DedupLedger>,
            Arc::clone(&export_resolver),
        )
        .with_enabled(config.listener.export_enabled);

        Self {
            client_id: Uuid::new_v4(),
            config,
            server,
            registry,
            configurations,
            cache,
            fhir,
            ledger,
            staging,
            transforms,
            import_resolver,
            export_resolver,
            import_listener,
            export_listener,
        }
    }

    /// Adds a FHIR-side configuration for `resource_type`.
    pub fn add_fhir_config(&self, resource_type: &str, version: FhirVersion) -> Arc<SyncConfiguration> {
        self.configurations
            .add(fhir_config(self.client_id, resource_type, version))
    }

    /// Adds a registry-side configuration for `resource_type`.
    pub fn add_registry_config(&self, resource_type: &str) -> Arc<SyncConfiguration> {
        self.configurations
            .add(registry_config(self.client_id, resource_type))
    }

    /// Adds a rule that imports `fhir_type` as `registry_type`, creating both
    /// configurations. Returns the FHIR-side configuration.
    pub fn import_rule(&self, fhir_type: &str, registry_type: &str) -> Arc<SyncConfiguration> {
        let source = self.add_fhir_config(fhir_type, FhirVersion::R4);
        let target = self.add_registry_config(registry_type);
        self.transforms.add_rule(ScriptedRule::copy_to(
            &format!("{fhir_type} to {registry_type}"),
            Direction::Import,
            fhir_type,
            registry_type,
            target,
        ));
        source
    }

    /// Adds a rule that exports `registry_type` as `fhir_type`, creating both
    /// configurations. Returns the registry-side configuration.
    pub fn export_rule(&self, registry_type: &str, fhir_type: &str) -> Arc<SyncConfiguration> {
        let source = self.add_registry_config(registry_type);
        let target = self.add_fhir_config(fhir_type, FhirVersion::R4);
        self.transforms.add_rule(ScriptedRule::copy_to(
            &format!("{registry_type} to {fhir_type}"),
            Direction::Export,
            registry_type,
            fhir_type,
            target,
        ));
        source
    }

    /// A hierarchy resolver over the FHIR-side repository.
    pub fn hierarchy(&self) -> HierarchyResolver {
        HierarchyResolver::new(Arc::clone(&self.fhir))
    }

    /// A fresh system context.
    pub fn ctx(&self) -> SyncContext {
        SyncContext::system()
    }
}

impl Default for TestHarness {
    fn default() -> Self {
        Self::new()
    }
}
