//! Per-FHIR-version behavior selected through a version map.

use crate::error::{SyncError, SyncResult};
use fhirsync_protocol::{ExternalResource, FhirVersion, ProtocolError};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;

/// What differs between FHIR versions as far as the engine is concerned.
pub trait VersionSupport: Send + Sync {
    /// The version handled.
    fn version(&self) -> FhirVersion;

    /// Media type sent in `Accept` and `Content-Type`.
    fn media_type(&self) -> &'static str;

    /// Wraps resources into a bundle of type `bundle_type`.
    fn create_bundle(&self, bundle_type: &str, resources: &[ExternalResource]) -> Value;

    /// Reads every resource out of a bundle.
    ///
    /// # Errors
    ///
    /// Returns an error if the value is not a bundle or an entry is not a
    /// resource.
    fn bundle_entries(&self, bundle: &Value) -> SyncResult<Vec<ExternalResource>> {
        if bundle.get("resourceType").and_then(Value::as_str) != Some("Bundle") {
            return Err(ProtocolError::MalformedResource("not a Bundle".into()).into());
        }
        let Some(entries) = bundle.get("entry") else {
            return Ok(Vec::new());
        };
        let entries = entries
            .as_array()
            .ok_or_else(|| ProtocolError::MalformedResource("Bundle.entry is not an array".into()))?;
        entries
            .iter()
            .filter(|entry| self.is_match(entry))
            .filter_map(|entry| entry.get("resource").cloned())
            .map(|resource| ExternalResource::from_fhir_json(resource).map_err(SyncError::from))
            .collect()
    }

    /// Reads the first resource out of a search bundle.
    ///
    /// # Errors
    ///
    /// Same as [`VersionSupport::bundle_entries`].
    fn first_entry(&self, bundle: &Value) -> SyncResult<Option<ExternalResource>> {
        Ok(self.bundle_entries(bundle)?.into_iter().next())
    }

    /// Returns false for bundle entries that are not search matches, such as
    /// included resources or operation outcomes.
    fn is_match(&self, entry: &Value) -> bool {
        match entry.pointer("/search/mode").and_then(Value::as_str) {
            Some(mode) => mode == "match",
            None => true,
        }
    }
}

/// FHIR DSTU3.
#[derive(Debug, Default, Clone, Copy)]
pub struct Dstu3Support;

impl VersionSupport for Dstu3Support {
    fn version(&self) -> FhirVersion {
        FhirVersion::Dstu3
    }

    fn media_type(&self) -> &'static str {
        "application/fhir+json;fhirVersion=3.0"
    }

    fn create_bundle(&self, bundle_type: &str, resources: &[ExternalResource]) -> Value {
        let entries: Vec<Value> = resources
            .iter()
            .map(|r| json!({ "resource": r.to_fhir_json() }))
            .collect();
        json!({
            "resourceType": "Bundle",
            "type": bundle_type,
            "total": entries.len(),
            "entry": entries,
        })
    }
}

/// FHIR R4.
#[derive(Debug, Default, Clone, Copy)]
pub struct R4Support;

impl VersionSupport for R4Support {
    fn version(&self) -> FhirVersion {
        FhirVersion::R4
    }

    fn media_type(&self) -> &'static str {
        "application/fhir+json;fhirVersion=4.0"
    }

    fn create_bundle(&self, bundle_type: &str, resources: &[ExternalResource]) -> Value {
        // R4 requires fullUrl on entries that carry a resource with an id.
        let entries: Vec<Value> = resources
            .iter()
            .map(|r| match r.identity() {
                Some(identity) => json!({
                    "fullUrl": identity.unversioned(),
                    "resource": r.to_fhir_json(),
                }),
                None => json!({ "resource": r.to_fhir_json() }),
            })
            .collect();
        json!({
            "resourceType": "Bundle",
            "type": bundle_type,
            "total": entries.len(),
            "entry": entries,
        })
    }
}

/// Maps each FHIR version to its implementation.
#[derive(Clone)]
pub struct VersionMap {
    supports: HashMap<FhirVersion, Arc<dyn VersionSupport>>,
}

impl VersionMap {
    /// An empty map.
    pub fn empty() -> Self {
        Self {
            supports: HashMap::new(),
        }
    }

    /// The map with every built-in version.
    pub fn standard() -> Self {
        Self::empty()
            .with(Arc::new(Dstu3Support))
            .with(Arc::new(R4Support))
    }

    /// Registers an implementation, replacing any for the same version.
    pub fn with(mut self, support: Arc<dyn VersionSupport>) -> Self {
        self.supports.insert(support.version(), support);
        self
    }

    /// Returns the implementation for `version`.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::InvalidConfiguration`] if none is registered.
    pub fn get(&self, version: FhirVersion) -> SyncResult<Arc<dyn VersionSupport>> {
        self.supports.get(&version).cloned().ok_or_else(|| {
            SyncError::InvalidConfiguration(format!("FHIR version {version} is not supported"))
        })
    }

    /// Versions with an implementation.
    pub fn versions(&self) -> Vec<FhirVersion> {
        let mut versions: Vec<_> = self.supports.keys().copied().collect();
        versions.sort();
        versions
    }
}

impl Default for VersionMap {
    fn default() -> Self {
        Self::standard()
    }
}

impl std::fmt::Debug for VersionMap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VersionMap")
            .field("versions", &self.versions())
            .finish()
    }
}
