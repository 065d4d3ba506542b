//! Dump-ledger command implementation.

use super::{existing_log, take_limit, LEDGER_FILE};
use fhirsync_engine::DurableLedger;
use fhirsync_storage::FileBackend;
use serde::Serialize;
use std::path::Path;

/// One ledger entry.
#[derive(Debug, Serialize)]
pub struct LedgerEntryInfo {
    /// Group the fingerprint was recorded under.
    pub group: String,
    /// Fingerprint string.
    pub fingerprint: String,
    /// When it was recorded.
    pub recorded_at: String,
}

/// Lists the entries of `ledger` whose key starts with `prefix`.
pub fn entries(ledger: &DurableLedger, prefix: &str) -> Vec<LedgerEntryInfo> {
    ledger
        .log()
        .entries_with_prefix(prefix)
        .into_iter()
        .map(|(key, value)| {
            let (group, fingerprint) = key.split_once('/').unwrap_or(("", key.as_str()));
            LedgerEntryInfo {
                group: group.to_string(),
                fingerprint: fingerprint.to_string(),
                recorded_at: String::from_utf8_lossy(&value).into_owned(),
            }
        })
        .collect()
}

/// Runs the dump-ledger command.
pub fn run(
    path: &Path,
    limit: Option<usize>,
    prefix: &str,
    format: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    let ledger_path = existing_log(path, LEDGER_FILE)?;
    let ledger = DurableLedger::open(Box::new(FileBackend::open(&ledger_path)?))?;
    let entries = take_limit(entries(&ledger, prefix), limit);

    match format {
        "json" => {
            println!("{}", serde_json::to_string_pretty(&entries)?);
        }
        _ => {
            println!("Dedup Ledger ({} of {} entries)", entries.len(), ledger.log().len());
            println!();
            for entry in &entries {
                println!("{}  {}  {}", entry.recorded_at, entry.group, entry.fingerprint);
            }
        }
    }

    Ok(())
}
