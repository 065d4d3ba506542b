//! Idempotency fingerprints for applied changes.

use crate::resource::ExternalResource;
use chrono::{DateTime, SecondsFormat, Utc};
use std::fmt;

/// Identifies one observed state of a resource.
///
/// Two deliveries of the same change produce the same fingerprint, so the
/// ledger can tell a redelivery (or the echo of a write the engine made
/// itself) from a new change. The change marker is the last-modified instant
/// when the owning system reports one, else its version id.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ProcessedItemFingerprint {
    source_id: String,
    last_modified: Option<DateTime<Utc>>,
    version: Option<String>,
    deleted: bool,
}

impl ProcessedItemFingerprint {
    /// Creates a fingerprint from a last-modified instant.
    pub fn new(source_id: impl Into<String>, last_modified: DateTime<Utc>, deleted: bool) -> Self {
        Self {
            source_id: source_id.into(),
            last_modified: Some(last_modified),
            version: None,
            deleted,
        }
    }

    /// Computes the fingerprint of `resource`.
    ///
    /// Returns `None` when the resource has no id, or neither a last-modified
    /// instant nor a version. Duplicate detection cannot work for such a
    /// resource.
    #[must_use]
    pub fn from_resource(resource: &ExternalResource) -> Option<Self> {
        let id = resource.id()?;
        let last_modified = resource.last_updated();
        let version = resource.version().map(str::to_string);
        if last_modified.is_none() && version.is_none() {
            return None;
        }
        Some(Self {
            source_id: format!("{}/{}", resource.resource_type(), id),
            last_modified,
            version: if last_modified.is_some() { None } else { version },
            deleted: resource.is_deleted(),
        })
    }

    /// Returns the `Type/id` of the fingerprinted resource.
    #[must_use]
    pub fn source_id(&self) -> &str {
        &self.source_id
    }

    /// Returns true if the fingerprint describes a deletion.
    #[must_use]
    pub fn is_deleted(&self) -> bool {
        self.deleted
    }

    /// Returns the string stored in the ledger.
    #[must_use]
    pub fn to_id_string(&self) -> String {
        let marker = match (&self.last_modified, &self.version) {
            (Some(t), _) => t.to_rfc3339_opts(SecondsFormat::Millis, true),
            (None, Some(v)) => format!("v{v}"),
            (None, None) => String::new(),
        };
        if self.deleted {
            format!("{}|{}|deleted", self.source_id, marker)
        } else {
            format!("{}|{}", self.source_id, marker)
        }
    }
}

impl fmt::Display for ProcessedItemFingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_id_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    fn instant() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, 0).unwrap()
    }

    #[test]
    fn string_form() {
        let fp = ProcessedItemFingerprint::new("Patient/7", instant(), false);
        assert_eq!(fp.to_id_string(), "Patient/7|2024-05-01T10:00:00.000Z");

        let deleted = ProcessedItemFingerprint::new("Patient/7", instant(), true);
        assert_eq!(deleted.to_id_string(), "Patient/7|2024-05-01T10:00:00.000Z|deleted");
        assert_ne!(fp, deleted);
    }

    #[test]
    fn from_resource_prefers_last_modified() {
        let resource = ExternalResource::new("Patient", json!({}))
            .with_id("7")
            .with_version("4")
            .with_last_updated(instant());
        let fp = ProcessedItemFingerprint::from_resource(&resource).unwrap();
        assert_eq!(fp, ProcessedItemFingerprint::new("Patient/7", instant(), false));
    }

    #[test]
    fn from_resource_falls_back_to_version() {
        let resource = ExternalResource::new("Patient", json!({}))
            .with_id("7")
            .with_version("4");
        let fp = ProcessedItemFingerprint::from_resource(&resource).unwrap();
        assert_eq!(fp.to_id_string(), "Patient/7|v4");
    }

    #[test]
    fn no_marker_no_fingerprint() {
        let resource = ExternalResource::new("Patient", json!({})).with_id("7");
        assert!(ProcessedItemFingerprint::from_resource(&resource).is_none());

        let anonymous = ExternalResource::new("Patient", json!({})).with_version("1");
        assert!(ProcessedItemFingerprint::from_resource(&anonymous).is_none());
    }
}
