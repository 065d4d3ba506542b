//! String identifier formats shared with the remote systems.

use crate::error::{ProtocolError, ProtocolResult};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Kind of record on the registry side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DhisResourceType {
    /// Tracked entity instance.
    TrackedEntity,
    /// Program enrollment.
    Enrollment,
    /// Event of a program stage.
    ProgramStageEvent,
    /// Organisation unit.
    OrganizationUnit,
    /// Aggregate data value set.
    DataValueSet,
    /// Program metadata.
    Program,
    /// Program stage metadata.
    ProgramStage,
}

impl DhisResourceType {
    /// All kinds.
    pub const ALL: [DhisResourceType; 7] = [
        Self::TrackedEntity,
        Self::Enrollment,
        Self::ProgramStageEvent,
        Self::OrganizationUnit,
        Self::DataValueSet,
        Self::Program,
        Self::ProgramStage,
    ];

    /// Two-letter prefix used in composite ids.
    #[must_use]
    pub const fn abbreviation(self) -> &'static str {
        match self {
            Self::TrackedEntity => "te",
            Self::Enrollment => "en",
            Self::ProgramStageEvent => "ps",
            Self::OrganizationUnit => "ou",
            Self::DataValueSet => "dv",
            Self::Program => "pr",
            Self::ProgramStage => "pt",
        }
    }

    /// Resource type name carried by [`crate::ExternalResource`].
    #[must_use]
    pub const fn type_name(self) -> &'static str {
        match self {
            Self::TrackedEntity => "TrackedEntity",
            Self::Enrollment => "Enrollment",
            Self::ProgramStageEvent => "ProgramStageEvent",
            Self::OrganizationUnit => "OrganizationUnit",
            Self::DataValueSet => "DataValueSet",
            Self::Program => "Program",
            Self::ProgramStage => "ProgramStage",
        }
    }

    /// Looks a kind up by its abbreviation.
    #[must_use]
    pub fn from_abbreviation(value: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|t| t.abbreviation() == value)
    }

    /// Looks a kind up by its resource type name.
    #[must_use]
    pub fn from_type_name(value: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|t| t.type_name() == value)
    }
}

impl fmt::Display for DhisResourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.type_name())
    }
}

/// Cross-system id: `<kind>-<id>-<rule uuid without dashes>`.
///
/// The kind and the rule are optional and omitted from the string when
/// absent. Internal ids are alphanumeric, so `-` only ever separates parts.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CompositeResourceId {
    kind: Option<DhisResourceType>,
    id: String,
    rule_id: Option<Uuid>,
}

fn invalid(value: &str) -> ProtocolError {
    ProtocolError::InvalidResourceId(value.to_string())
}

fn is_valid_id(id: &str) -> bool {
    !id.is_empty() && id.chars().all(|c| c.is_ascii_alphanumeric())
}

fn parse_rule(part: &str) -> Option<Uuid> {
    if part.len() != 32 || !part.chars().all(|c| c.is_ascii_hexdigit()) {
        return None;
    }
    Uuid::parse_str(part).ok()
}

impl CompositeResourceId {
    /// Creates a composite id.
    ///
    /// # Errors
    ///
    /// Returns an error if `id` is blank or not alphanumeric.
    pub fn new(
        kind: Option<DhisResourceType>,
        id: impl Into<String>,
        rule_id: Option<Uuid>,
    ) -> ProtocolResult<Self> {
        let id = id.into();
        if !is_valid_id(&id) {
            return Err(invalid(&id));
        }
        Ok(Self { kind, id, rule_id })
    }

    /// Returns the kind discriminator.
    #[must_use]
    pub fn kind(&self) -> Option<DhisResourceType> {
        self.kind
    }

    /// Returns the internal id.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Returns the owning rule.
    #[must_use]
    pub fn rule_id(&self) -> Option<Uuid> {
        self.rule_id
    }

    /// Parses the string form.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::InvalidResourceId`] when the value has more
    /// than three parts, an unknown kind prefix, a blank or non-alphanumeric
    /// id, or a rule part that is not 32 hex digits.
    pub fn parse(value: &str) -> ProtocolResult<Self> {
        let parts: Vec<&str> = value.split('-').collect();
        let (kind, id, rule_id) = match parts.as_slice() {
            [id] => (None, *id, None),
            [first, second] => match DhisResourceType::from_abbreviation(first) {
                Some(kind) => (Some(kind), *second, None),
                None => {
                    let rule = parse_rule(second).ok_or_else(|| invalid(value))?;
                    (None, *first, Some(rule))
                }
            },
            [kind, id, rule] => {
                let kind = DhisResourceType::from_abbreviation(kind).ok_or_else(|| invalid(value))?;
                let rule = parse_rule(rule).ok_or_else(|| invalid(value))?;
                (Some(kind), *id, Some(rule))
            }
            _ => return Err(invalid(value)),
        };

        if !is_valid_id(id) {
            return Err(invalid(value));
        }
        Ok(Self {
            kind,
            id: id.to_string(),
            rule_id,
        })
    }
}

impl fmt::Display for CompositeResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(kind) = self.kind {
            write!(f, "{}-", kind.abbreviation())?;
        }
        f.write_str(&self.id)?;
        if let Some(rule) = self.rule_id {
            write!(f, "-{}", rule.simple())?;
        }
        Ok(())
    }
}

impl FromStr for CompositeResourceId {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// A `system|code` token as used by identifier and code searches.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SystemCodeValue {
    system: Option<String>,
    code: String,
}

impl SystemCodeValue {
    /// Separator between system and code.
    pub const SEPARATOR: char = '|';

    /// Creates a token.
    pub fn new(system: Option<String>, code: impl Into<String>) -> Self {
        Self {
            system,
            code: code.into(),
        }
    }

    /// Creates a token with a system.
    pub fn with_system(system: impl Into<String>, code: impl Into<String>) -> Self {
        Self::new(Some(system.into()), code)
    }

    /// Returns the system URI.
    #[must_use]
    pub fn system(&self) -> Option<&str> {
        self.system.as_deref()
    }

    /// Returns the code.
    #[must_use]
    pub fn code(&self) -> &str {
        &self.code
    }

    /// Parses `system|code`, `|code` or `code`.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::InvalidToken`] when the separator is present
    /// but nothing follows it.
    pub fn parse(value: &str) -> ProtocolResult<Self> {
        match value.find(Self::SEPARATOR) {
            None => Ok(Self::new(None, value)),
            Some(0) => Ok(Self::new(None, &value[1..])),
            Some(i) if i + 1 == value.len() => Err(ProtocolError::InvalidToken(format!(
                "value does not include a code: {value}"
            ))),
            Some(i) => Ok(Self::with_system(&value[..i], &value[i + 1..])),
        }
    }
}

impl fmt::Display for SystemCodeValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.system {
            Some(system) => write!(f, "{system}|{}", self.code),
            None => f.write_str(&self.code),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const RULE: &str = "5f2a1a3c-0b8e-4e8e-9d7e-2a4b6c8d0e1f";

    #[test]
    fn full_composite_id() {
        let rule = Uuid::parse_str(RULE).unwrap();
        let id = CompositeResourceId::new(Some(DhisResourceType::TrackedEntity), "abc123", Some(rule))
            .unwrap();
        let text = id.to_string();
        assert_eq!(text, "te-abc123-5f2a1a3c0b8e4e8e9d7e2a4b6c8d0e1f");
        assert_eq!(CompositeResourceId::parse(&text).unwrap(), id);
    }

    #[test]
    fn optional_parts_are_omitted() {
        let bare = CompositeResourceId::parse("abc123").unwrap();
        assert!(bare.kind().is_none() && bare.rule_id().is_none());

        let kinded = CompositeResourceId::parse("ou-xyz").unwrap();
        assert_eq!(kinded.kind(), Some(DhisResourceType::OrganizationUnit));
        assert_eq!(kinded.to_string(), "ou-xyz");

        let ruled = CompositeResourceId::parse("xyz-5f2a1a3c0b8e4e8e9d7e2a4b6c8d0e1f").unwrap();
        assert!(ruled.kind().is_none());
        assert!(ruled.rule_id().is_some());
    }

    #[test]
    fn invalid_composite_ids() {
        for value in [
            "",
            "zz-abc-5f2a1a3c0b8e4e8e9d7e2a4b6c8d0e1f",
            "te--5f2a1a3c0b8e4e8e9d7e2a4b6c8d0e1f",
            "te-a_b-5f2a1a3c0b8e4e8e9d7e2a4b6c8d0e1f",
            "te-abc-5f2a",
            "te-abc-zzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzz",
            "a-b-c-d",
            "nope-xyz",
        ] {
            assert!(CompositeResourceId::parse(value).is_err(), "{value}");
        }
    }

    #[test]
    fn token_parsing() {
        let t = SystemCodeValue::parse("http://loinc.org|8867-4").unwrap();
        assert_eq!(t.system(), Some("http://loinc.org"));
        assert_eq!(t.code(), "8867-4");
        assert_eq!(t.to_string(), "http://loinc.org|8867-4");

        assert_eq!(SystemCodeValue::parse("|abc").unwrap(), SystemCodeValue::new(None, "abc"));
        assert_eq!(SystemCodeValue::parse("abc").unwrap().to_string(), "abc");
        assert!(SystemCodeValue::parse("http://x|").is_err());
    }

    #[test]
    fn kinds_round_trip_names() {
        for kind in DhisResourceType::ALL {
            assert_eq!(DhisResourceType::from_abbreviation(kind.abbreviation()), Some(kind));
            assert_eq!(DhisResourceType::from_type_name(kind.type_name()), Some(kind));
        }
    }
}
