//! Compact command implementation.

use super::{LEDGER_FILE, STAGING_FILE};
use fhirsync_storage::{FileBackend, RecordLog, StorageBackend};
use std::path::Path;

/// Compaction statistics for one log.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct CompactStats {
    /// Records in the log before compaction.
    pub input_records: usize,
    /// Records after compaction.
    pub output_records: usize,
    /// Bytes before compaction.
    pub bytes_before: u64,
    /// Bytes after compaction. Equal to `bytes_before` on a dry run.
    pub bytes_after: u64,
}

/// Runs the compact command.
pub fn run(path: &Path, dry_run: bool) -> Result<(), Box<dyn std::error::Error>> {
    println!("Compacting engine state at {:?}", path);
    if dry_run {
        println!("(dry run - no changes will be made)");
    }
    println!();

    for name in [LEDGER_FILE, STAGING_FILE] {
        let log_path = path.join(name);
        if !log_path.exists() {
            println!("{name}: not found, skipped");
            continue;
        }
        let stats = compact_file(&log_path, dry_run)?;
        println!("{name}:");
        println!("  Input records:  {}", stats.input_records);
        println!("  Output records: {}", stats.output_records);
        println!("  Size before:    {} bytes", stats.bytes_before);
        if !dry_run {
            println!("  Size after:     {} bytes", stats.bytes_after);
        }
        println!();
    }

    if !dry_run {
        println!("✓ Compaction complete");
    }
    Ok(())
}

/// Rewrites the log at `log_path` keeping one record per live key.
///
/// The compacted log is written next to the original and renamed over it.
pub fn compact_file(log_path: &Path, dry_run: bool) -> Result<CompactStats, Box<dyn std::error::Error>> {
    let backend = FileBackend::open(log_path)?;
    let report = RecordLog::verify(&backend)?;
    let mut stats = CompactStats {
        input_records: report.records,
        output_records: report.live_keys,
        bytes_before: report.total_bytes,
        bytes_after: report.total_bytes,
    };
    if dry_run || (report.records == report.live_keys && report.is_clean()) {
        return Ok(stats);
    }

    let mut file_name = log_path.as_os_str().to_os_string();
    file_name.push(".compact");
    let temp_path = std::path::PathBuf::from(file_name);
    if temp_path.exists() {
        std::fs::remove_file(&temp_path)?;
    }

    {
        let log = RecordLog::open(Box::new(backend))?;
        let mut target = FileBackend::open(&temp_path)?;
        stats.output_records = log.compact_into(&mut target)?;
        stats.bytes_after = target.size()?;
    }
    std::fs::rename(&temp_path, log_path)?;
    Ok(stats)
}
