//! Check-config command implementation.

use fhirsync_engine::EngineConfig;
use std::path::Path;

/// Runs the check-config command.
pub fn run(file: &Path) -> Result<(), Box<dyn std::error::Error>> {
    let config = EngineConfig::from_json_file(file)?;
    tracing::debug!(file = %file.display(), "configuration loaded");

    println!("✓ {} is valid", file.display());
    println!();
    println!("{}", serde_json::to_string_pretty(&config)?);
    Ok(())
}
