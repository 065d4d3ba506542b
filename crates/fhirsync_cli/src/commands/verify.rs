//! Verify command implementation.

use super::{LEDGER_FILE, STAGING_FILE};
use fhirsync_storage::{FileBackend, RecordLog, StorageBackend, VerifyReport};
use std::path::Path;

/// Runs the verify command.
pub fn run(path: &Path, check_ledger: bool, check_staging: bool) -> Result<(), Box<dyn std::error::Error>> {
    println!("Verifying engine state at {:?}", path);
    println!();

    let mut ok = true;
    for (enabled, label, name) in [
        (check_ledger, "Ledger", LEDGER_FILE),
        (check_staging, "Staging", STAGING_FILE),
    ] {
        if !enabled {
            continue;
        }
        let log_path = path.join(name);
        if !log_path.exists() {
            println!("{label} log not found (this may be normal for a new engine)");
            continue;
        }
        println!("Checking {label}...");
        let backend = FileBackend::open(&log_path)?;
        let report = verify_backend(&backend)?;
        print_result(label, &report);
        ok &= report.is_clean();
    }

    println!();
    if ok {
        println!("✓ State verification passed");
        Ok(())
    } else {
        println!("✗ State verification failed");
        Err("Verification failed".into())
    }
}

/// Scans `backend` without modifying it.
pub fn verify_backend(backend: &dyn StorageBackend) -> Result<VerifyReport, Box<dyn std::error::Error>> {
    Ok(RecordLog::verify(backend)?)
}

fn print_result(label: &str, report: &VerifyReport) {
    println!("  {label} records: {}", report.records);
    println!("  Live keys:       {}", report.live_keys);
    println!("  Valid bytes:     {} of {}", report.valid_bytes, report.total_bytes);
    if let Some(problem) = &report.problem {
        println!("  Problem:         {problem}");
    }
    println!();
}

#[cfg(test)]
mod tests {
    use super::*;
    use fhirsync_storage::InMemoryBackend;

    fn written_log() -> Vec<u8> {
        let backend = InMemoryBackend::new();
        let log = RecordLog::open(Box::new(backend.clone())).unwrap();
        log.put("a", b"1").unwrap();
        log.put("b", b"2").unwrap();
        log.delete("a").unwrap();
        backend.data()
    }

    #[test]
    fn clean_log_passes() {
        let report = verify_backend(&InMemoryBackend::with_data(written_log())).unwrap();
        assert!(report.is_clean());
        assert_eq!(report.records, 3);
        assert_eq!(report.live_keys, 1);
    }

    #[test]
    fn torn_tail_is_reported() {
        let mut data = written_log();
        data.truncate(data.len() - 3);
        let report = verify_backend(&InMemoryBackend::with_data(data)).unwrap();
        assert!(!report.is_clean());
        assert_eq!(report.records, 2);
        assert!(report.problem.is_some());
    }
}
