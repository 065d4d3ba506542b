//! # fhirsync Testkit
//!
//! Test utilities for fhirsync.
//!
//! This crate provides:
//! - [`InMemoryFhirServer`], a FHIR endpoint with call counters and injected
//!   conflicts
//! - [`InMemoryDhisRepository`], a registry with injected missing
//!   dependencies, prerequisites and conflicts
//! - [`ScriptedTransformService`] driven by closures
//! - [`StaticConfigurationStore`] and [`RecordingTransport`]
//! - [`TestHarness`] wiring both directions
//! - Fixtures and property-based test generators using proptest
//!
//! ## Usage
//!
//! ```rust,ignore
//! use fhirsync_testkit::prelude::*;
//!
//! #[test]
//! fn imports_a_patient() {
//!     let harness = TestHarness::new();
//!     let config = harness.import_rule("Patient", "TrackedEntity");
//!     harness.server.seed(patient("7", 10));
//!     let delivery = harness
//!         .import_listener
//!         .handle(&ImportMessage::new(config.id, "Patient", "7"))
//!         .unwrap();
//!     assert_eq!(delivery, Delivery::Applied);
//! }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod configurations;
pub mod fixtures;
pub mod generators;
pub mod harness;
pub mod registry;
pub mod server;
pub mod transform;
pub mod transport;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::configurations::*;
    pub use crate::fixtures::*;
    pub use crate::generators::*;
    pub use crate::harness::*;
    pub use crate::registry::*;
    pub use crate::server::*;
    pub use crate::transform::*;
    pub use crate::transport::*;
    pub use fhirsync_engine::*;
    pub use fhirsync_protocol::*;
}

pub use configurations::*;
pub use fixtures::*;
pub use generators::*;
pub use harness::*;
pub use registry::*;
pub use server::*;
pub use transform::*;
pub use transport::*;
