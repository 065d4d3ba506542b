//! Error types for the protocol crate.

use thiserror::Error;

/// Result type for protocol operations.
pub type ProtocolResult<T> = Result<T, ProtocolError>;

/// Errors raised while parsing identifiers, resources or cache payloads.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// A composite resource id could not be parsed.
    #[error("invalid composite resource id: {0}")]
    InvalidResourceId(String),

    /// A `system|code` token could not be parsed.
    #[error("invalid token: {0}")]
    InvalidToken(String),

    /// A version tag names no supported FHIR version.
    #[error("unknown FHIR version: {0}")]
    UnknownVersion(String),

    /// A resource payload lacks required structure.
    #[error("malformed resource: {0}")]
    MalformedResource(String),

    /// A cache payload has a broken frame.
    #[error("invalid cache payload: {0}")]
    InvalidPayload(String),

    /// JSON encoding or decoding failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}
