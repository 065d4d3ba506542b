//! Queue messages that announce changed resources.

use crate::error::ProtocolResult;
use crate::resource::ResourceIdentity;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A FHIR-side change to import into the registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportMessage {
    /// Configuration the change was received for.
    pub config_id: Uuid,
    /// FHIR resource type.
    pub resource_type: String,
    /// FHIR logical id.
    pub resource_id: String,
    /// True when the notification carried the payload and it was staged
    /// locally, so it can be processed without a re-fetch.
    #[serde(default)]
    pub persisted: bool,
}

impl ImportMessage {
    /// Creates a message for a change that must be re-fetched.
    pub fn new(config_id: Uuid, resource_type: impl Into<String>, resource_id: impl Into<String>) -> Self {
        Self {
            config_id,
            resource_type: resource_type.into(),
            resource_id: resource_id.into(),
            persisted: false,
        }
    }

    /// Marks the payload as staged.
    #[must_use]
    pub fn persisted(mut self) -> Self {
        self.persisted = true;
        self
    }

    /// Returns the identity of the announced resource.
    #[must_use]
    pub fn identity(&self) -> ResourceIdentity {
        ResourceIdentity::new(&self.resource_type, &self.resource_id)
    }

    /// Encodes as JSON.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn encode(&self) -> ProtocolResult<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Decodes from JSON.
    ///
    /// # Errors
    ///
    /// Returns an error if the bytes are not a valid message.
    pub fn decode(bytes: &[u8]) -> ProtocolResult<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

/// A registry-side change to export to a FHIR server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportMessage {
    /// Configuration that polled the change.
    pub config_id: Uuid,
    /// Registry resource type, e.g. `TrackedEntity`.
    pub resource_type: String,
    /// Registry id.
    pub resource_id: String,
    /// True if the registry reported the resource as deleted.
    #[serde(default)]
    pub deleted: bool,
}

impl ExportMessage {
    /// Creates a message for a changed resource.
    pub fn new(config_id: Uuid, resource_type: impl Into<String>, resource_id: impl Into<String>) -> Self {
        Self {
            config_id,
            resource_type: resource_type.into(),
            resource_id: resource_id.into(),
            deleted: false,
        }
    }

    /// Marks the change as a deletion.
    #[must_use]
    pub fn deleted(mut self) -> Self {
        self.deleted = true;
        self
    }

    /// Returns the identity of the announced resource.
    #[must_use]
    pub fn identity(&self) -> ResourceIdentity {
        ResourceIdentity::new(&self.resource_type, &self.resource_id)
    }

    /// Encodes as JSON.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn encode(&self) -> ProtocolResult<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Decodes from JSON.
    ///
    /// # Errors
    ///
    /// Returns an error if the bytes are not a valid message.
    pub fn decode(bytes: &[u8]) -> ProtocolResult<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn import_message_wire_form() {
        let cfg = Uuid::nil();
        let msg = ImportMessage::new(cfg, "Patient", "7").persisted();
        let json: serde_json::Value = serde_json::from_slice(&msg.encode().unwrap()).unwrap();
        assert_eq!(json["resourceType"], "Patient");
        assert_eq!(json["persisted"], true);
        assert_eq!(ImportMessage::decode(&msg.encode().unwrap()).unwrap(), msg);
    }

    #[test]
    fn export_message_defaults_to_not_deleted() {
        let raw = format!(
            r#"{{"configId":"{}","resourceType":"TrackedEntity","resourceId":"abc"}}"#,
            Uuid::nil()
        );
        let msg = ExportMessage::decode(raw.as_bytes()).unwrap();
        assert!(!msg.deleted);
        assert_eq!(msg.identity().unversioned(), "TrackedEntity/abc");
    }
}
