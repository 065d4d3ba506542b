//! Supported FHIR versions.

use crate::error::ProtocolError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// A FHIR specification release the engine can talk to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum FhirVersion {
    /// STU 3.0.x
    Dstu3,
    /// Release 4
    R4,
}

impl FhirVersion {
    /// All supported versions, oldest first.
    pub const ALL: [FhirVersion; 2] = [FhirVersion::Dstu3, FhirVersion::R4];

    /// Returns the stable tag written into cache payloads.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Dstu3 => "DSTU3",
            Self::R4 => "R4",
        }
    }
}

impl fmt::Display for FhirVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for FhirVersion {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "DSTU3" => Ok(Self::Dstu3),
            "R4" => Ok(Self::R4),
            _ => Err(ProtocolError::UnknownVersion(s.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_parse_back() {
        for version in FhirVersion::ALL {
            assert_eq!(version.name().parse::<FhirVersion>().unwrap(), version);
        }
        assert_eq!("r4".parse::<FhirVersion>().unwrap(), FhirVersion::R4);
        assert!("R5".parse::<FhirVersion>().is_err());
    }

    #[test]
    fn serde_uses_tag() {
        assert_eq!(serde_json::to_string(&FhirVersion::Dstu3).unwrap(), "\"DSTU3\"");
    }
}
