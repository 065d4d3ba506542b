//! Byte encoding of cached resources for out-of-process caches.
//!
//! ```text
//! | tag_len (u16, BE) | version tag (UTF-8) | resource (JSON) |
//! ```
//!
//! The version tag comes first so a reader knows which FHIR release the JSON
//! belongs to before parsing it. An empty input decodes to "absent".

use crate::error::{ProtocolError, ProtocolResult};
use crate::resource::ExternalResource;
use crate::version::FhirVersion;

/// Encodes `resource` tagged with `version`.
///
/// # Errors
///
/// Returns an error if JSON serialization fails.
pub fn encode_payload(version: FhirVersion, resource: &ExternalResource) -> ProtocolResult<Vec<u8>> {
    let tag = version.name().as_bytes();
    let json = serde_json::to_vec(resource)?;

    // Tags are short constants; the u16 prefix cannot overflow.
    let mut buf = Vec::with_capacity(2 + tag.len() + json.len());
    buf.extend_from_slice(&(tag.len() as u16).to_be_bytes());
    buf.extend_from_slice(tag);
    buf.extend_from_slice(&json);
    Ok(buf)
}

/// Decodes a payload written by [`encode_payload`].
///
/// # Errors
///
/// Returns an error if the frame is truncated, the tag names no supported
/// version, or the JSON does not describe a resource.
pub fn decode_payload(bytes: &[u8]) -> ProtocolResult<Option<(FhirVersion, ExternalResource)>> {
    if bytes.is_empty() {
        return Ok(None);
    }
    if bytes.len() < 2 {
        return Err(ProtocolError::InvalidPayload("truncated tag length".into()));
    }

    let tag_len = u16::from_be_bytes([bytes[0], bytes[1]]) as usize;
    let tag_end = 2 + tag_len;
    if bytes.len() < tag_end {
        return Err(ProtocolError::InvalidPayload(format!(
            "tag of {tag_len} bytes exceeds payload of {} bytes",
            bytes.len()
        )));
    }

    let tag = std::str::from_utf8(&bytes[2..tag_end])
        .map_err(|e| ProtocolError::InvalidPayload(format!("tag is not UTF-8: {e}")))?;
    let version: FhirVersion = tag.parse()?;
    let resource = serde_json::from_slice(&bytes[tag_end..])?;
    Ok(Some((version, resource)))
}
