//! Cache addressing for remote lookups.

use crate::identifier::SystemCodeValue;
use crate::version::FhirVersion;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Independently evictable partitions of the resource cache.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum CacheNamespace {
    /// Point lookups by id.
    Resource,
    /// Lookups by identifier token.
    Identifier,
    /// Lookups by code token.
    Code,
    /// Ancestor chains, one namespace per hierarchy kind.
    Hierarchy(String),
}

impl fmt::Display for CacheNamespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Resource => f.write_str("resource"),
            Self::Identifier => f.write_str("findByIdentifier"),
            Self::Code => f.write_str("findByCode"),
            Self::Hierarchy(kind) => write!(f, "hierarchy:{kind}"),
        }
    }
}

/// What a lookup is addressed by.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ResourceLookup {
    /// Logical id.
    Id(String),
    /// Business identifier token.
    Identifier(SystemCodeValue),
    /// Code token.
    Code(SystemCodeValue),
    /// Ancestor chain starting at `id` along `kind`.
    Hierarchy {
        /// Start resource id.
        id: String,
        /// Hierarchy kind, e.g. `partOf`.
        kind: String,
    },
}

impl fmt::Display for ResourceLookup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Id(id) => f.write_str(id),
            Self::Identifier(token) | Self::Code(token) => write!(f, "{token}"),
            Self::Hierarchy { id, kind } => write!(f, "{id}/{kind}"),
        }
    }
}

/// Addresses one remote lookup.
///
/// The refresh flag selects the lookup mode. It is not part of the cache
/// identity: a refreshed lookup overwrites the entry that a cached lookup
/// with otherwise equal fields reads.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ResourceEndpointKey {
    config_id: Uuid,
    version: FhirVersion,
    resource_type: String,
    lookup: ResourceLookup,
    refresh: bool,
}

impl ResourceEndpointKey {
    /// Creates a key.
    pub fn new(
        config_id: Uuid,
        version: FhirVersion,
        resource_type: impl Into<String>,
        lookup: ResourceLookup,
        refresh: bool,
    ) -> Self {
        Self {
            config_id,
            version,
            resource_type: resource_type.into(),
            lookup,
            refresh,
        }
    }

    /// Creates a point-lookup key.
    pub fn by_id(
        config_id: Uuid,
        version: FhirVersion,
        resource_type: impl Into<String>,
        id: impl Into<String>,
        refresh: bool,
    ) -> Self {
        Self::new(config_id, version, resource_type, ResourceLookup::Id(id.into()), refresh)
    }

    /// Returns the owning configuration.
    #[must_use]
    pub fn config_id(&self) -> Uuid {
        self.config_id
    }

    /// Returns the FHIR version.
    #[must_use]
    pub fn version(&self) -> FhirVersion {
        self.version
    }

    /// Returns the resource type.
    #[must_use]
    pub fn resource_type(&self) -> &str {
        &self.resource_type
    }

    /// Returns the lookup.
    #[must_use]
    pub fn lookup(&self) -> &ResourceLookup {
        &self.lookup
    }

    /// Returns true for refresh-mode lookups.
    #[must_use]
    pub fn is_refresh(&self) -> bool {
        self.refresh
    }

    /// Returns the same key in the other mode.
    #[must_use]
    pub fn with_refresh(mut self, refresh: bool) -> Self {
        self.refresh = refresh;
        self
    }

    /// Returns the namespace the key lives in.
    #[must_use]
    pub fn namespace(&self) -> CacheNamespace {
        match &self.lookup {
            ResourceLookup::Id(_) => CacheNamespace::Resource,
            ResourceLookup::Identifier(_) => CacheNamespace::Identifier,
            ResourceLookup::Code(_) => CacheNamespace::Code,
            ResourceLookup::Hierarchy { kind, .. } => CacheNamespace::Hierarchy(kind.clone()),
        }
    }

    /// Returns the cache identity within the namespace.
    #[must_use]
    pub fn cache_key(&self) -> String {
        format!(
            "{}:{}:{}:{}",
            self.config_id, self.version, self.resource_type, self.lookup
        )
    }
}

impl fmt::Display for ResourceEndpointKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}[{}{}]",
            self.namespace(),
            self.cache_key(),
            if self.refresh { ",refresh" } else { "" }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn refresh_flag_is_not_cache_identity() {
        let cfg = Uuid::new_v4();
        let cached = ResourceEndpointKey::by_id(cfg, FhirVersion::R4, "Patient", "7", false);
        let refreshed = cached.clone().with_refresh(true);

        assert_ne!(cached, refreshed);
        assert_eq!(cached.cache_key(), refreshed.cache_key());
        assert_eq!(cached.namespace(), refreshed.namespace());
    }

    #[test]
    fn namespaces_separate_lookups() {
        let cfg = Uuid::new_v4();
        let token = SystemCodeValue::with_system("urn:sys", "7");
        let by_identifier = ResourceEndpointKey::new(
            cfg,
            FhirVersion::R4,
            "Patient",
            ResourceLookup::Identifier(token.clone()),
            false,
        );
        let by_code =
            ResourceEndpointKey::new(cfg, FhirVersion::R4, "Patient", ResourceLookup::Code(token), false);

        assert_eq!(by_identifier.cache_key(), by_code.cache_key());
        assert_ne!(by_identifier.namespace(), by_code.namespace());
    }

    #[test]
    fn version_is_part_of_identity() {
        let cfg = Uuid::new_v4();
        let r4 = ResourceEndpointKey::by_id(cfg, FhirVersion::R4, "Patient", "7", false);
        let stu3 = ResourceEndpointKey::by_id(cfg, FhirVersion::Dstu3, "Patient", "7", false);
        assert_ne!(r4.cache_key(), stu3.cache_key());
    }
}
