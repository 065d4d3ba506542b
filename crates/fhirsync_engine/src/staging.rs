//! Staging records of inbound payloads.
//!
//! A subscription notification may carry the changed resource. The receiver
//! stages it here and enqueues an import message marked as persisted, so the
//! import listener can process the payload without fetching it again. The
//! record stays until the message is finished (applied, duplicate or
//! permanently dropped); a redelivered message needs it again.

use crate::error::{SyncError, SyncResult};
use chrono::{DateTime, Utc};
use fhirsync_protocol::{ExternalResource, FhirVersion};
use fhirsync_storage::{RecordLog, StorageBackend};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// A staged payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StagedResource {
    /// FHIR version of the payload.
    pub version: FhirVersion,
    /// Payload as received.
    pub payload: String,
    /// When it was received.
    pub received_at: DateTime<Utc>,
}

impl StagedResource {
    /// Stages `resource` as received now.
    pub fn new(version: FhirVersion, resource: &ExternalResource) -> SyncResult<Self> {
        let payload = serde_json::to_string(&resource.to_fhir_json())
            .map_err(fhirsync_protocol::ProtocolError::from)?;
        Ok(Self {
            version,
            payload,
            received_at: Utc::now(),
        })
    }

    /// Parses the payload.
    pub fn resource(&self) -> SyncResult<ExternalResource> {
        Ok(ExternalResource::from_fhir_str(&self.payload)?)
    }
}

/// Staging storage addressed by (configuration, resource type, resource id).
pub trait StagingStore: Send + Sync {
    /// Stores or replaces a staged payload.
    fn stage(
        &self,
        config_id: Uuid,
        resource_type: &str,
        resource_id: &str,
        staged: StagedResource,
    ) -> SyncResult<()>;

    /// Returns the staged payload.
    fn find(
        &self,
        config_id: Uuid,
        resource_type: &str,
        resource_id: &str,
    ) -> SyncResult<Option<StagedResource>>;

    /// Deletes the staged payload. Returns true if there was one.
    fn delete(&self, config_id: Uuid, resource_type: &str, resource_id: &str) -> SyncResult<bool>;
}

fn staging_key(config_id: Uuid, resource_type: &str, resource_id: &str) -> String {
    format!("{config_id}/{resource_type}/{resource_id}")
}

/// Volatile staging store.
#[derive(Debug, Default)]
pub struct MemoryStagingStore {
    records: RwLock<HashMap<String, StagedResource>>,
}

impl MemoryStagingStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of staged payloads.
    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    /// Returns true if nothing is staged.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl StagingStore for MemoryStagingStore {
    fn stage(
        &self,
        config_id: Uuid,
        resource_type: &str,
        resource_id: &str,
        staged: StagedResource,
    ) -> SyncResult<()> {
        self.records
            .write()
            .insert(staging_key(config_id, resource_type, resource_id), staged);
        Ok(())
    }

    fn find(
        &self,
        config_id: Uuid,
        resource_type: &str,
        resource_id: &str,
    ) -> SyncResult<Option<StagedResource>> {
        Ok(self
            .records
            .read()
            .get(&staging_key(config_id, resource_type, resource_id))
            .cloned())
    }

    fn delete(&self, config_id: Uuid, resource_type: &str, resource_id: &str) -> SyncResult<bool> {
        Ok(self
            .records
            .write()
            .remove(&staging_key(config_id, resource_type, resource_id))
            .is_some())
    }
}

/// Staging store persisted in a [`RecordLog`] as JSON values.
#[derive(Debug)]
pub struct DurableStagingStore {
    log: RecordLog,
}

impl DurableStagingStore {
    /// Opens the store kept in `backend`.
    pub fn open(backend: Box<dyn StorageBackend>) -> SyncResult<Self> {
        Ok(Self {
            log: RecordLog::open(backend)?,
        })
    }

    /// Returns the underlying log.
    pub fn log(&self) -> &RecordLog {
        &self.log
    }
}

impl StagingStore for DurableStagingStore {
    fn stage(
        &self,
        config_id: Uuid,
        resource_type: &str,
        resource_id: &str,
        staged: StagedResource,
    ) -> SyncResult<()> {
        let value = serde_json::to_vec(&staged)
            .map_err(|e| SyncError::Fatal(format!("cannot serialize staged payload: {e}")))?;
        self.log
            .put(&staging_key(config_id, resource_type, resource_id), &value)?;
        self.log.sync()?;
        Ok(())
    }

    fn find(
        &self,
        config_id: Uuid,
        resource_type: &str,
        resource_id: &str,
    ) -> SyncResult<Option<StagedResource>> {
        match self.log.get(&staging_key(config_id, resource_type, resource_id)) {
            Some(raw) => Ok(Some(
                serde_json::from_slice(&raw).map_err(fhirsync_protocol::ProtocolError::from)?,
            )),
            None => Ok(None),
        }
    }

    fn delete(&self, config_id: Uuid, resource_type: &str, resource_id: &str) -> SyncResult<bool> {
        let removed = self
            .log
            .delete(&staging_key(config_id, resource_type, resource_id))?;
        if removed {
            self.log.sync()?;
        }
        Ok(removed)
    }
}
