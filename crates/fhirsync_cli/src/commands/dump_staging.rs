//! Dump-staging command implementation.

use super::{existing_log, take_limit, STAGING_FILE};
use fhirsync_engine::{DurableStagingStore, StagedResource};
use fhirsync_storage::FileBackend;
use serde::Serialize;
use std::path::Path;

/// One staged payload.
#[derive(Debug, Serialize)]
pub struct StagedEntryInfo {
    /// Staging key, `<configuration>/<type>/<id>`.
    pub key: String,
    /// FHIR version of the payload.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    /// When the payload was received.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub received_at: Option<String>,
    /// Payload size in bytes.
    pub payload_size: usize,
    /// Why the record could not be read, if it could not.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Lists the staged payloads of `store` whose key starts with `prefix`.
pub fn entries(store: &DurableStagingStore, prefix: &str) -> Vec<StagedEntryInfo> {
    store
        .log()
        .entries_with_prefix(prefix)
        .into_iter()
        .map(|(key, value)| match serde_json::from_slice::<StagedResource>(&value) {
            Ok(staged) => StagedEntryInfo {
                key,
                version: Some(staged.version.to_string()),
                received_at: Some(staged.received_at.to_rfc3339()),
                payload_size: staged.payload.len(),
                error: staged.resource().err().map(|e| e.to_string()),
            },
            Err(e) => StagedEntryInfo {
                key,
                version: None,
                received_at: None,
                payload_size: value.len(),
                error: Some(e.to_string()),
            },
        })
        .collect()
}

/// Runs the dump-staging command.
pub fn run(
    path: &Path,
    limit: Option<usize>,
    prefix: &str,
    format: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    let staging_path = existing_log(path, STAGING_FILE)?;
    let store = DurableStagingStore::open(Box::new(FileBackend::open(&staging_path)?))?;
    let entries = take_limit(entries(&store, prefix), limit);

    match format {
        "json" => {
            println!("{}", serde_json::to_string_pretty(&entries)?);
        }
        _ => {
            println!("Staging ({} of {} records)", entries.len(), store.log().len());
            println!();
            for entry in &entries {
                print!(
                    "{}  {}  {} bytes  {}",
                    entry.received_at.as_deref().unwrap_or("-"),
                    entry.version.as_deref().unwrap_or("-"),
                    entry.payload_size,
                    entry.key
                );
                match &entry.error {
                    Some(error) => println!("  (unreadable: {error})"),
                    None => println!(),
                }
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use fhirsync_engine::StagingStore;
    use fhirsync_protocol::{ExternalResource, FhirVersion};
    use fhirsync_storage::InMemoryBackend;
    use serde_json::json;
    use uuid::Uuid;

    #[test]
    fn lists_staged_payloads() {
        let store = DurableStagingStore::open(Box::new(InMemoryBackend::new())).unwrap();
        let config = Uuid::from_u128(9);
        let patient = ExternalResource::new("Patient", json!({"active": true})).with_id("7");
        store
            .stage(config, "Patient", "7", StagedResource::new(FhirVersion::R4, &patient).unwrap())
            .unwrap();
        store.log().put("broken", b"not json").unwrap();

        let listed = entries(&store, &format!("{config}/"));
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].key, format!("{config}/Patient/7"));
        assert_eq!(listed[0].version.as_deref(), Some("R4"));
        assert!(listed[0].error.is_none());

        let all = entries(&store, "");
        assert_eq!(all.len(), 2);
        assert!(all.iter().any(|e| e.key == "broken" && e.error.is_some()));
    }
}
