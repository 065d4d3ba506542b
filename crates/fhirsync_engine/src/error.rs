//! Error types for the synchronization engine.
//!
//! Variants follow the order in which the engine tries to recover from them:
//! not-found is not an error at all (`Ok(None)`), a version conflict is
//! retried a bounded number of times, a missing dependency is resolved
//! recursively, and everything after that is classified by
//! [`SyncError::classify`] when it reaches a queue listener.

use fhirsync_protocol::ProtocolError;
use fhirsync_storage::StorageError;
use thiserror::Error;
use uuid::Uuid;

/// Result type for engine operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// What a queue listener does with a message whose processing failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    /// Expected domain condition. Log, acknowledge, never retry.
    Drop,
    /// Transient condition. Hand the message back for later delivery.
    Redeliver,
    /// Anything else. Propagate to the transport as a failure.
    Fatal,
}

/// Errors that can occur while synchronizing.
#[derive(Error, Debug)]
pub enum SyncError {
    /// The remote server rejected a write because the resource changed.
    #[error("version conflict on {resource}")]
    VersionConflict {
        /// `Type/id` of the conflicting resource.
        resource: String,
    },

    /// A write needs a resource that does not exist on the target yet.
    #[error("missing dependency {resource_type}/{id}")]
    MissingDependency {
        /// Type of the missing resource on the source side.
        resource_type: String,
        /// Id of the missing resource on the source side.
        id: String,
    },

    /// The record a write is linked to is absent on the target.
    #[error("linked prerequisite {resource_type}/{id} does not exist")]
    PrerequisiteNotFound {
        /// Type of the prerequisite on the source side.
        resource_type: String,
        /// Id of the prerequisite on the source side.
        id: String,
    },

    /// A missing dependency cannot be supplied from the source.
    #[error("unresolvable dependency {resource_type}/{id}: {reason}")]
    UnresolvableDependency {
        /// Dependency type.
        resource_type: String,
        /// Dependency id.
        id: String,
        /// Why it cannot be resolved.
        reason: String,
    },

    /// The same dependency was requested twice while saving one resource.
    #[error("dependency cycle through {resource_type}/{id}")]
    DependencyCycle {
        /// Dependency type.
        resource_type: String,
        /// Dependency id.
        id: String,
    },

    /// The transform service could not map the resource.
    #[error("mapping failed: {message}")]
    Mapping {
        /// What went wrong.
        message: String,
        /// True if the failure depends on data that may appear later.
        transient: bool,
    },

    /// The per-configuration resource transform rejected a fetched resource.
    #[error("resource transformation failed: {0}")]
    Transformation(String),

    /// Network or transport error.
    #[error("transport error: {message}")]
    Transport {
        /// Error message.
        message: String,
        /// Whether the operation can be retried.
        retryable: bool,
    },

    /// A remote call did not complete in time.
    #[error("operation timed out")]
    Timeout,

    /// The owning configuration no longer exists.
    #[error("configuration {0} no longer exists")]
    ConfigurationGone(Uuid),

    /// A configuration cannot be used as given.
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// Durable state could not be read or written.
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    /// A payload or identifier could not be parsed.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Unrecoverable failure.
    #[error("fatal: {0}")]
    Fatal(String),
}

impl SyncError {
    /// Creates a retryable transport error.
    pub fn transport_retryable(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            retryable: true,
        }
    }

    /// Creates a non-retryable transport error.
    pub fn transport_fatal(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            retryable: false,
        }
    }

    /// Creates a missing-dependency error.
    pub fn missing_dependency(resource_type: impl Into<String>, id: impl Into<String>) -> Self {
        Self::MissingDependency {
            resource_type: resource_type.into(),
            id: id.into(),
        }
    }

    /// Creates a prerequisite-not-found error.
    pub fn prerequisite_not_found(resource_type: impl Into<String>, id: impl Into<String>) -> Self {
        Self::PrerequisiteNotFound {
            resource_type: resource_type.into(),
            id: id.into(),
        }
    }

    /// Creates a mapping error for data that may appear later.
    pub fn mapping_transient(message: impl Into<String>) -> Self {
        Self::Mapping {
            message: message.into(),
            transient: true,
        }
    }

    /// Creates a mapping error for a structural problem.
    pub fn mapping_permanent(message: impl Into<String>) -> Self {
        Self::Mapping {
            message: message.into(),
            transient: false,
        }
    }

    /// Returns true if the same request may succeed when tried again.
    pub fn is_retryable(&self) -> bool {
        match self {
            SyncError::Transport { retryable, .. } => *retryable,
            SyncError::Timeout | SyncError::VersionConflict { .. } => true,
            SyncError::Mapping { transient, .. } => *transient,
            _ => false,
        }
    }

    /// Returns true for a version conflict.
    pub fn is_conflict(&self) -> bool {
        matches!(self, SyncError::VersionConflict { .. })
    }

    /// Decides what a queue listener does with this error.
    pub fn classify(&self) -> FailureClass {
        match self {
            SyncError::UnresolvableDependency { .. }
            | SyncError::PrerequisiteNotFound { .. }
            | SyncError::Mapping {
                transient: false, ..
            }
            | SyncError::Transformation(_)
            | SyncError::ConfigurationGone(_)
            | SyncError::Protocol(_) => FailureClass::Drop,
            e if e.is_retryable() => FailureClass::Redeliver,
            _ => FailureClass::Fatal,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_errors() {
        assert!(SyncError::transport_retryable("connection reset").is_retryable());
        assert!(!SyncError::transport_fatal("bad certificate").is_retryable());
        assert!(SyncError::Timeout.is_retryable());
        assert!(SyncError::VersionConflict {
            resource: "Patient/7".into()
        }
        .is_retryable());
        assert!(!SyncError::Fatal("boom".into()).is_retryable());
    }

    #[test]
    fn classification() {
        assert_eq!(
            SyncError::UnresolvableDependency {
                resource_type: "Patient".into(),
                id: "1".into(),
                reason: "gone".into(),
            }
            .classify(),
            FailureClass::Drop
        );
        assert_eq!(SyncError::mapping_permanent("no rule").classify(), FailureClass::Drop);
        assert_eq!(SyncError::mapping_transient("no org yet").classify(), FailureClass::Redeliver);
        assert_eq!(SyncError::ConfigurationGone(Uuid::nil()).classify(), FailureClass::Drop);
        assert_eq!(
            SyncError::VersionConflict {
                resource: "Patient/7".into()
            }
            .classify(),
            FailureClass::Redeliver
        );
        assert_eq!(SyncError::transport_retryable("503").classify(), FailureClass::Redeliver);
        assert_eq!(SyncError::transport_fatal("400").classify(), FailureClass::Fatal);
        assert_eq!(
            SyncError::DependencyCycle {
                resource_type: "Patient".into(),
                id: "1".into()
            }
            .classify(),
            FailureClass::Fatal
        );
        assert_eq!(
            SyncError::missing_dependency("Organization", "o1").classify(),
            FailureClass::Fatal
        );
    }

    #[test]
    fn error_display() {
        let err = SyncError::missing_dependency("Organization", "o1");
        assert_eq!(err.to_string(), "missing dependency Organization/o1");
    }
}
