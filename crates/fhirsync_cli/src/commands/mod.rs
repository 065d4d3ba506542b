//! CLI command implementations.

pub mod check_config;
pub mod compact;
pub mod dump_ledger;
pub mod dump_staging;
pub mod inspect_cache;
pub mod parse_id;
pub mod verify;

use std::path::{Path, PathBuf};

/// File name of the dedup ledger inside a state directory.
pub const LEDGER_FILE: &str = "ledger.log";

/// File name of the staging log inside a state directory.
pub const STAGING_FILE: &str = "staging.log";

/// Returns `dir/name`, failing if the file does not exist.
///
/// Opening a missing log would create it, which an inspection tool must not do.
pub fn existing_log(dir: &Path, name: &str) -> Result<PathBuf, Box<dyn std::error::Error>> {
    let path = dir.join(name);
    if !path.exists() {
        return Err(format!("{} not found in {}", name, dir.display()).into());
    }
    Ok(path)
}

/// Applies an optional entry limit.
pub fn take_limit<T>(items: Vec<T>, limit: Option<usize>) -> Vec<T> {
    match limit {
        Some(limit) => items.into_iter().take(limit).collect(),
        None => items,
    }
}
