//! Test fixtures: resources, configurations and durable stores.

use chrono::{DateTime, Duration, TimeZone, Utc};
use fhirsync_engine::{DurableLedger, DurableStagingStore, EndpointConfig, SyncConfiguration};
use fhirsync_protocol::{ExternalResource, FhirVersion};
use fhirsync_storage::{FileBackend, InMemoryBackend};
use serde_json::{json, Value};
use std::path::PathBuf;
use tempfile::TempDir;
use uuid::Uuid;

/// Base URL used for test FHIR endpoints.
pub const TEST_BASE_URL: &str = "http://fhir.test/baseR4";

/// `2024-03-01T00:00:00Z` plus `seconds`.
pub fn instant(seconds: i64) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0)
        .single()
        .expect("valid base instant")
        + Duration::seconds(seconds)
}

fn with_meta(mut body: Value, version: &str, last_updated: DateTime<Utc>) -> ExternalResource {
    body["meta"] = json!({
        "versionId": version,
        "lastUpdated": last_updated.to_rfc3339_opts(chrono::SecondsFormat::Millis, true),
    });
    ExternalResource::from_fhir_json(body).expect("fixture is a resource")
}

/// A patient with version 1, last updated at `instant(updated)`.
pub fn patient(id: &str, updated: i64) -> ExternalResource {
    with_meta(
        json!({
            "resourceType": "Patient",
            "id": id,
            "active": true,
            "name": [{"family": "Doe", "given": ["Jane"]}],
            "identifier": [{"system": "urn:mrn", "value": format!("MRN-{id}")}]
        }),
        "1",
        instant(updated),
    )
}

/// An organization, optionally `partOf` another.
pub fn organization(id: &str, parent: Option<&str>) -> ExternalResource {
    let mut body = json!({"resourceType": "Organization", "id": id, "name": format!("Org {id}")});
    if let Some(parent) = parent {
        body["partOf"] = json!({"reference": format!("Organization/{parent}")});
    }
    with_meta(body, "1", instant(0))
}

/// A location, optionally `partOf` another.
pub fn location(id: &str, parent: Option<&str>) -> ExternalResource {
    let mut body = json!({"resourceType": "Location", "id": id, "name": format!("Location {id}")});
    if let Some(parent) = parent {
        body["partOf"] = json!({"reference": format!("Location/{parent}")});
    }
    with_meta(body, "1", instant(0))
}

/// A registry tracked entity, last updated at `instant(updated)`.
pub fn tracked_entity(id: &str, updated: i64) -> ExternalResource {
    ExternalResource::new(
        "TrackedEntity",
        json!({"trackedEntityType": "person", "orgUnit": "ou1", "attributes": []}),
    )
    .with_id(id)
    .with_last_updated(instant(updated))
}

/// A registry organisation unit.
pub fn organisation_unit(id: &str, updated: i64) -> ExternalResource {
    ExternalResource::new("OrganizationUnit", json!({"name": format!("Unit {id}")}))
        .with_id(id)
        .with_last_updated(instant(updated))
}

/// A FHIR-side configuration for `resource_type` against [`TEST_BASE_URL`].
pub fn fhir_config(client_id: Uuid, resource_type: &str, version: FhirVersion) -> SyncConfiguration {
    SyncConfiguration::new(
        client_id,
        resource_type.to_lowercase(),
        version,
        resource_type,
        EndpointConfig::new(TEST_BASE_URL),
    )
}

/// A registry-side configuration for `resource_type`.
pub fn registry_config(client_id: Uuid, resource_type: &str) -> SyncConfiguration {
    SyncConfiguration::new(
        client_id,
        format!("dhis-{}", resource_type.to_lowercase()),
        FhirVersion::R4,
        resource_type,
        EndpointConfig::local(),
    )
}

/// Durable ledger and staging store with automatic cleanup.
pub struct DurableStores {
    /// The ledger.
    pub ledger: DurableLedger,
    /// The staging store.
    pub staging: DurableStagingStore,
    /// The temporary directory (kept alive to prevent cleanup).
    _temp_dir: Option<TempDir>,
}

impl DurableStores {
    /// Creates stores on in-memory backends.
    pub fn memory() -> Self {
        Self {
            ledger: DurableLedger::open(Box::new(InMemoryBackend::new()))
                .expect("Failed to open ledger"),
            staging: DurableStagingStore::open(Box::new(InMemoryBackend::new()))
                .expect("Failed to open staging store"),
            _temp_dir: None,
        }
    }

    /// Creates stores on files in a temporary directory.
    pub fn file() -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let ledger = FileBackend::open_with_create_dirs(&temp_dir.path().join("ledger.log"))
            .expect("Failed to create ledger backend");
        let staging = FileBackend::open_with_create_dirs(&temp_dir.path().join("staging.log"))
            .expect("Failed to create staging backend");
        Self {
            ledger: DurableLedger::open(Box::new(ledger)).expect("Failed to open ledger"),
            staging: DurableStagingStore::open(Box::new(staging))
                .expect("Failed to open staging store"),
            _temp_dir: Some(temp_dir),
        }
    }

    /// Directory holding the log files, if file-based.
    pub fn path(&self) -> Option<PathBuf> {
        self._temp_dir.as_ref().map(|d| d.path().to_path_buf())
    }
}
