//! Inspect-cache command implementation.

use fhirsync_protocol::decode_payload;
use serde::Serialize;
use std::path::Path;

/// Decoded cache payload.
#[derive(Debug, Serialize)]
pub struct CachePayloadInfo {
    /// Size of the encoded payload in bytes.
    pub size: usize,
    /// FHIR version tag, absent for an empty payload.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    /// Resource type.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resource_type: Option<String>,
    /// Resource id.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// Resource in FHIR JSON form.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resource: Option<serde_json::Value>,
}

/// Decodes `bytes`.
pub fn describe(bytes: &[u8]) -> Result<CachePayloadInfo, Box<dyn std::error::Error>> {
    let mut info = CachePayloadInfo {
        size: bytes.len(),
        version: None,
        resource_type: None,
        id: None,
        resource: None,
    };
    if let Some((version, resource)) = decode_payload(bytes)? {
        info.version = Some(version.to_string());
        info.resource_type = Some(resource.resource_type().to_string());
        info.id = resource.id().map(str::to_string);
        info.resource = Some(resource.to_fhir_json());
    }
    Ok(info)
}

/// Runs the inspect-cache command.
pub fn run(file: &Path, format: &str) -> Result<(), Box<dyn std::error::Error>> {
    let bytes = std::fs::read(file)?;
    let info = describe(&bytes)?;

    match format {
        "json" => {
            println!("{}", serde_json::to_string_pretty(&info)?);
        }
        _ => print_text_output(&info),
    }

    Ok(())
}

fn print_text_output(info: &CachePayloadInfo) {
    println!("Cache Payload");
    println!("=============");
    println!();
    println!("Size: {} bytes", info.size);
    let Some(resource) = &info.resource else {
        println!("(empty payload, resource absent)");
        return;
    };
    println!("Version:  {}", info.version.as_deref().unwrap_or("-"));
    println!(
        "Resource: {}/{}",
        info.resource_type.as_deref().unwrap_or("-"),
        info.id.as_deref().unwrap_or("-")
    );
    println!();
    match serde_json::to_string_pretty(resource) {
        Ok(text) => println!("{text}"),
        Err(e) => println!("(unprintable resource: {e})"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fhirsync_protocol::{encode_payload, ExternalResource, FhirVersion};
    use serde_json::json;

    #[test]
    fn describes_encoded_resource() {
        let resource = ExternalResource::new("Patient", json!({"active": true})).with_id("7");
        let bytes = encode_payload(FhirVersion::Dstu3, &resource).unwrap();

        let info = describe(&bytes).unwrap();
        assert_eq!(info.version.as_deref(), Some("DSTU3"));
        assert_eq!(info.resource_type.as_deref(), Some("Patient"));
        assert_eq!(info.id.as_deref(), Some("7"));
        assert_eq!(info.resource.unwrap()["active"], true);
    }

    #[test]
    fn empty_payload_is_absent() {
        let info = describe(&[]).unwrap();
        assert_eq!(info.size, 0);
        assert!(info.resource.is_none());
    }

    #[test]
    fn garbage_is_an_error() {
        assert!(describe(&[0, 9, b'R']).is_err());
    }
}
