//! The resource value that flows through fetch, cache, transform and persist.

use crate::error::{ProtocolError, ProtocolResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

/// Type, id and optional version of a resource.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ResourceIdentity {
    /// Resource type, e.g. `Patient` or `TrackedEntity`.
    pub resource_type: String,
    /// Logical id.
    pub id: String,
    /// Version id assigned by the owning server.
    pub version: Option<String>,
}

impl ResourceIdentity {
    /// Creates an unversioned identity.
    pub fn new(resource_type: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            resource_type: resource_type.into(),
            id: id.into(),
            version: None,
        }
    }

    /// Sets the version id.
    #[must_use]
    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = Some(version.into());
        self
    }

    /// Returns `Type/id` without the version, used as cycle-detection key.
    #[must_use]
    pub fn unversioned(&self) -> String {
        format!("{}/{}", self.resource_type, self.id)
    }
}

impl fmt::Display for ResourceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.version {
            Some(v) => write!(f, "{}/{}/_history/{}", self.resource_type, self.id, v),
            None => write!(f, "{}/{}", self.resource_type, self.id),
        }
    }
}

/// A pointer from one resource to another.
///
/// A reference may carry the target inline (a contained resource) in which
/// case no fetch is needed to follow it.
#[derive(Debug, Clone, PartialEq)]
pub struct Reference {
    /// Target type. Absent for relative references that omit it.
    pub resource_type: Option<String>,
    /// Target id.
    pub id: Option<String>,
    /// Target resource when it travels with the referencing resource.
    pub inline: Option<Box<ExternalResource>>,
}

impl Reference {
    /// Creates a reference to `resource_type/id`.
    pub fn to(resource_type: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            resource_type: Some(resource_type.into()),
            id: Some(id.into()),
            inline: None,
        }
    }

    /// Creates a reference carrying its target.
    #[must_use]
    pub fn inline(resource: ExternalResource) -> Self {
        Self {
            resource_type: Some(resource.resource_type().to_string()),
            id: resource.id().map(str::to_string),
            inline: Some(Box::new(resource)),
        }
    }

    /// Returns true if the reference points nowhere.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inline.is_none() && self.id.as_deref().map_or(true, str::is_empty)
    }

    /// Parses `Type/id` or a bare id.
    #[must_use]
    pub fn parse(value: &str) -> Self {
        let value = value.trim();
        let path = value.split("/_history/").next().unwrap_or(value);
        let mut segments = path.rsplitn(3, '/');
        let id = segments.next().filter(|s| !s.is_empty()).map(str::to_string);
        let resource_type = segments.next().filter(|s| !s.is_empty()).map(str::to_string);
        Self {
            resource_type,
            id,
            inline: None,
        }
    }
}

/// A resource from either side of the synchronization.
///
/// The JSON body is kept as received. Identity and metadata are lifted out of
/// it so the engine never has to understand the payload itself.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExternalResource {
    resource_type: String,
    id: Option<String>,
    version: Option<String>,
    last_updated: Option<DateTime<Utc>>,
    #[serde(default)]
    deleted: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    system_id: Option<String>,
    body: Value,
}

impl ExternalResource {
    /// Creates a resource of `resource_type` with the given body.
    pub fn new(resource_type: impl Into<String>, body: Value) -> Self {
        Self {
            resource_type: resource_type.into(),
            id: None,
            version: None,
            last_updated: None,
            deleted: false,
            system_id: None,
            body,
        }
    }

    /// Creates a deleted marker for `resource_type/id`.
    pub fn tombstone(resource_type: impl Into<String>, id: impl Into<String>) -> Self {
        let mut resource = Self::new(resource_type, Value::Object(Map::new()));
        resource.id = Some(id.into());
        resource.deleted = true;
        resource
    }

    /// Sets the id.
    #[must_use]
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    /// Sets the version id.
    #[must_use]
    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = Some(version.into());
        self
    }

    /// Sets the last-modified instant.
    #[must_use]
    pub fn with_last_updated(mut self, instant: DateTime<Utc>) -> Self {
        self.last_updated = Some(instant);
        self
    }

    /// Marks the resource as deleted.
    #[must_use]
    pub fn with_deleted(mut self, deleted: bool) -> Self {
        self.deleted = deleted;
        self
    }

    /// Reads a FHIR JSON resource, lifting `resourceType`, `id` and `meta`.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::MalformedResource`] if the value is not an
    /// object, has no `resourceType`, or carries an unparseable
    /// `meta.lastUpdated`.
    pub fn from_fhir_json(body: Value) -> ProtocolResult<Self> {
        let object = body
            .as_object()
            .ok_or_else(|| ProtocolError::MalformedResource("expected a JSON object".into()))?;
        let resource_type = object
            .get("resourceType")
            .and_then(Value::as_str)
            .ok_or_else(|| ProtocolError::MalformedResource("missing resourceType".into()))?
            .to_string();
        let id = object.get("id").and_then(Value::as_str).map(str::to_string);
        let meta = object.get("meta");
        let version = meta
            .and_then(|m| m.get("versionId"))
            .and_then(Value::as_str)
            .map(str::to_string);
        let last_updated = match meta.and_then(|m| m.get("lastUpdated")).and_then(Value::as_str) {
            Some(raw) => Some(
                DateTime::parse_from_rfc3339(raw)
                    .map_err(|e| {
                        ProtocolError::MalformedResource(format!("meta.lastUpdated {raw:?}: {e}"))
                    })?
                    .with_timezone(&Utc),
            ),
            None => None,
        };

        Ok(Self {
            resource_type,
            id,
            version,
            last_updated,
            deleted: false,
            system_id: None,
            body,
        })
    }

    /// Parses FHIR JSON text.
    ///
    /// # Errors
    ///
    /// Returns an error if the text is not JSON or not a resource.
    pub fn from_fhir_str(text: &str) -> ProtocolResult<Self> {
        Self::from_fhir_json(serde_json::from_str(text)?)
    }

    /// Returns the body with `resourceType`, `id` and `meta` written back.
    #[must_use]
    pub fn to_fhir_json(&self) -> Value {
        let mut body = match &self.body {
            Value::Object(map) => map.clone(),
            _ => Map::new(),
        };
        body.insert("resourceType".into(), Value::String(self.resource_type.clone()));
        match &self.id {
            Some(id) => body.insert("id".into(), Value::String(id.clone())),
            None => body.remove("id"),
        };
        if self.version.is_some() || self.last_updated.is_some() {
            let meta = body
                .entry("meta")
                .or_insert_with(|| Value::Object(Map::new()));
            if let Value::Object(meta) = meta {
                if let Some(v) = &self.version {
                    meta.insert("versionId".into(), Value::String(v.clone()));
                }
                if let Some(t) = &self.last_updated {
                    meta.insert(
                        "lastUpdated".into(),
                        Value::String(t.to_rfc3339_opts(chrono::SecondsFormat::Millis, true)),
                    );
                }
            }
        }
        Value::Object(body)
    }

    /// Returns the resource type.
    #[must_use]
    pub fn resource_type(&self) -> &str {
        &self.resource_type
    }

    /// Returns the logical id, if assigned.
    #[must_use]
    pub fn id(&self) -> Option<&str> {
        self.id.as_deref()
    }

    /// Returns the version id, if assigned.
    #[must_use]
    pub fn version(&self) -> Option<&str> {
        self.version.as_deref()
    }

    /// Returns the last-modified instant, if known.
    #[must_use]
    pub fn last_updated(&self) -> Option<DateTime<Utc>> {
        self.last_updated
    }

    /// Returns true if this resource represents a deletion.
    #[must_use]
    pub fn is_deleted(&self) -> bool {
        self.deleted
    }

    /// Returns the id this resource is known by on the other system.
    #[must_use]
    pub fn system_id(&self) -> Option<&str> {
        self.system_id.as_deref()
    }

    /// Attaches the id this resource is known by on the other system.
    pub fn set_system_id(&mut self, system_id: impl Into<String>) {
        self.system_id = Some(system_id.into());
    }

    /// Assigns the logical id.
    pub fn set_id(&mut self, id: impl Into<String>) {
        self.id = Some(id.into());
    }

    /// Returns the JSON body.
    #[must_use]
    pub fn body(&self) -> &Value {
        &self.body
    }

    /// Returns the JSON body for modification.
    pub fn body_mut(&mut self) -> &mut Value {
        &mut self.body
    }

    /// Returns the identity if the resource has an id.
    #[must_use]
    pub fn identity(&self) -> Option<ResourceIdentity> {
        self.id.as_ref().map(|id| ResourceIdentity {
            resource_type: self.resource_type.clone(),
            id: id.clone(),
            version: self.version.clone(),
        })
    }

    /// Returns the embedded `contained` resources.
    ///
    /// # Errors
    ///
    /// Returns an error if a contained entry is not a resource.
    pub fn contained(&self) -> ProtocolResult<Vec<ExternalResource>> {
        match self.body.get("contained") {
            Some(Value::Array(items)) => items
                .iter()
                .cloned()
                .map(Self::from_fhir_json)
                .collect(),
            Some(_) => Err(ProtocolError::MalformedResource(
                "contained is not an array".into(),
            )),
            None => Ok(Vec::new()),
        }
    }

    /// Reads the reference stored at JSON pointer `pointer`.
    ///
    /// Both `{"reference": "Type/id"}` objects and plain strings are accepted.
    /// A local reference `#x` resolves to the contained resource with id `x`.
    #[must_use]
    pub fn reference_at(&self, pointer: &str) -> Option<Reference> {
        let raw = match self.body.pointer(pointer)? {
            Value::String(s) => s.as_str(),
            Value::Object(o) => o.get("reference")?.as_str()?,
            _ => return None,
        };

        if let Some(local) = raw.strip_prefix('#') {
            return self
                .contained()
                .ok()?
                .into_iter()
                .find(|c| c.id() == Some(local))
                .map(Reference::inline);
        }
        Some(Reference::parse(raw))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn lifts_identity_from_fhir_json() {
        let resource = ExternalResource::from_fhir_json(json!({
            "resourceType": "Patient",
            "id": "7",
            "meta": {"versionId": "3", "lastUpdated": "2024-05-01T10:00:00.000Z"},
        }))
        .unwrap();

        assert_eq!(resource.resource_type(), "Patient");
        assert_eq!(resource.identity().unwrap().to_string(), "Patient/7/_history/3");
        assert_eq!(
            resource.last_updated().unwrap().to_rfc3339(),
            "2024-05-01T10:00:00+00:00"
        );
    }

    #[test]
    fn rejects_missing_resource_type() {
        assert!(ExternalResource::from_fhir_json(json!({"id": "1"})).is_err());
        assert!(ExternalResource::from_fhir_json(json!([1, 2])).is_err());
    }

    #[test]
    fn to_fhir_json_writes_meta_back() {
        let resource = ExternalResource::new("Observation", json!({"status": "final"}))
            .with_id("o1")
            .with_version("2");
        let json = resource.to_fhir_json();
        assert_eq!(json["resourceType"], "Observation");
        assert_eq!(json["id"], "o1");
        assert_eq!(json["meta"]["versionId"], "2");
        assert_eq!(json["status"], "final");
    }

    #[test]
    fn reference_parsing() {
        let r = Reference::parse("Organization/ou1/_history/4");
        assert_eq!(r.resource_type.as_deref(), Some("Organization"));
        assert_eq!(r.id.as_deref(), Some("ou1"));

        let bare = Reference::parse("ou2");
        assert!(bare.resource_type.is_none());
        assert!(!bare.is_empty());
        assert!(Reference::parse("").is_empty());
    }

    #[test]
    fn local_reference_resolves_to_contained() {
        let resource = ExternalResource::from_fhir_json(json!({
            "resourceType": "Organization",
            "id": "child",
            "contained": [{"resourceType": "Organization", "id": "p", "name": "Parent"}],
            "partOf": {"reference": "#p"},
        }))
        .unwrap();

        let parent = resource.reference_at("/partOf").unwrap();
        assert_eq!(parent.inline.unwrap().body()["name"], "Parent");
        assert!(resource.reference_at("/missing").is_none());
    }

    #[test]
    fn tombstone_is_deleted() {
        let t = ExternalResource::tombstone("TrackedEntity", "abc");
        assert!(t.is_deleted());
        assert_eq!(t.id(), Some("abc"));
    }
}
