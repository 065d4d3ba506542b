//! Parse-id command implementation.

use fhirsync_protocol::CompositeResourceId;
use serde::Serialize;

/// Parts of a composite id.
#[derive(Debug, Serialize)]
pub struct ParsedId {
    /// Value as given.
    pub input: String,
    /// Registry resource type, if the id carries a kind prefix.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    /// Internal id.
    pub id: String,
    /// Owning rule, if present.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rule_id: Option<String>,
    /// Canonical string form.
    pub canonical: String,
}

/// Parses `value` into its parts.
pub fn parse(value: &str) -> Result<ParsedId, Box<dyn std::error::Error>> {
    let parsed = CompositeResourceId::parse(value)?;
    Ok(ParsedId {
        input: value.to_string(),
        kind: parsed.kind().map(|k| k.type_name().to_string()),
        id: parsed.id().to_string(),
        rule_id: parsed.rule_id().map(|r| r.to_string()),
        canonical: parsed.to_string(),
    })
}

/// Runs the parse-id command.
pub fn run(value: &str, format: &str) -> Result<(), Box<dyn std::error::Error>> {
    let parsed = parse(value)?;

    match format {
        "json" => {
            println!("{}", serde_json::to_string_pretty(&parsed)?);
        }
        _ => {
            println!("Kind:      {}", parsed.kind.as_deref().unwrap_or("-"));
            println!("Id:        {}", parsed.id);
            println!("Rule:      {}", parsed.rule_id.as_deref().unwrap_or("-"));
            println!("Canonical: {}", parsed.canonical);
        }
    }

    Ok(())
}
