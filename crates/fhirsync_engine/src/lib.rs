//! # fhirsync Engine
//!
//! Bidirectional synchronization between a DHIS2 registry and FHIR
//! endpoints.
//!
//! This crate provides:
//! - FHIR client abstraction with a REST implementation
//! - Resource cache with a versioned payload codec
//! - Dedup ledger of processed item fingerprints
//! - Transform chain orchestration
//! - Dependency, prerequisite and conflict resolution
//! - Ancestor chains along parent references
//! - Import and export queue listeners with a worker pool
//!
//! ## Architecture
//!
//! A queue message announces a changed resource. A listener loads the
//! current body, skips it if its fingerprint was already processed, and
//! hands it to the [`SyncResolver`]. The resolver runs the
//! [`TransformChainOrchestrator`], which asks a [`TransformService`] for
//! outcomes and persists each through the opposite side's
//! [`ResourceRepository`]. Every applied write records its own fingerprint,
//! so the echo of a write is recognized when it comes back.
//!
//! ## Key Invariants
//!
//! - A message is acknowledged only when it is finished for good
//! - A message handed back for redelivery is not marked processed and keeps
//!   its staging record; fingerprints of writes it already applied stay in
//!   the ledger, since those writes happened
//! - Concurrent deliveries of one change apply it once
//! - Absent resources are never cached
//! - Every write evicts what it wrote from the caches
//! - Parent walks and dependency resolution terminate on cycles

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

mod auth;
mod cache;
mod client;
mod config;
mod configuration;
mod context;
mod error;
mod hierarchy;
mod http;
mod ledger;
mod listener;
mod lock;
mod orchestrator;
mod outbox;
mod repository;
mod request_cache;
mod resolver;
mod staging;
mod transform;
mod version_support;
mod worker;

pub use auth::{Authorization, Credentials, Principal, SecurityContext};
pub use cache::{ByteStore, CacheStats, CacheStore, CodecCacheStore, MemoryByteStore, MemoryCacheStore};
pub use client::{ClientRegistry, DisabledClient, FhirClient, FhirClientFactory, WriteOutcome};
pub use config::{EngineConfig, ListenerConfig, LockScope, RetryConfig};
pub use configuration::{CachedConfigurationStore, ConfigurationStore, EndpointConfig, SyncConfiguration};
pub use context::SyncContext;
pub use error::{FailureClass, SyncError, SyncResult};
pub use hierarchy::{parent_at, HierarchyResolver};
#[cfg(feature = "reqwest")]
pub use http::ReqwestHttpClient;
pub use http::{HttpClient, HttpMethod, HttpRequest, HttpResponse, RestClientFactory, RestFhirClient};
pub use ledger::{DedupLedger, DurableLedger, MemoryLedger};
pub use listener::{Delivery, ExportListener, ImportListener, ListenerStats, MessageHandler};
pub use lock::{LockGuard, LockManager};
pub use orchestrator::{SaveOutcome, TransformChainOrchestrator};
pub use outbox::Outbox;
pub use repository::{FhirResourceRepository, IdentityTransformer, ResourceRepository, ResourceTransformer};
pub use request_cache::RequestCache;
pub use resolver::SyncResolver;
pub use staging::{DurableStagingStore, MemoryStagingStore, StagedResource, StagingStore};
pub use transform::{Direction, RuleContext, RuleInfo, TransformOutcome, TransformService, TransformStep};
pub use version_support::{Dstu3Support, R4Support, VersionMap, VersionSupport};
pub use worker::{Envelope, MemoryQueue, MessageTransport, WorkerPool, WorkerReport};

/// Crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
