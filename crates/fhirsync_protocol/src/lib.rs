//! # fhirsync Protocol
//!
//! Resource model and identifier formats shared by the fhirsync engine,
//! its test kit and its command line tool.
//!
//! This crate provides:
//! - [`ExternalResource`], the JSON payload plus identity that flows through
//!   every stage of a synchronization
//! - [`FhirVersion`] and [`DhisResourceType`]
//! - [`CompositeResourceId`] and [`SystemCodeValue`] string formats
//! - [`ProcessedItemFingerprint`] for duplicate detection
//! - [`ResourceEndpointKey`] for cache addressing
//! - queue messages ([`ImportMessage`], [`ExportMessage`])
//! - the cache payload codec ([`encode_payload`], [`decode_payload`])
//!
//! This is a pure data crate with no I/O operations.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod codec;
mod error;
mod fingerprint;
mod identifier;
mod key;
mod messages;
mod resource;
mod version;

pub use codec::{decode_payload, encode_payload};
pub use error::{ProtocolError, ProtocolResult};
pub use fingerprint::ProcessedItemFingerprint;
pub use identifier::{CompositeResourceId, DhisResourceType, SystemCodeValue};
pub use key::{CacheNamespace, ResourceEndpointKey, ResourceLookup};
pub use messages::{ExportMessage, ImportMessage};
pub use resource::{ExternalResource, Reference, ResourceIdentity};
pub use version::FhirVersion;
