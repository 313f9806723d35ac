//! Retention cleanup of old recordings and logs.

use std::path::PathBuf;
use std::time::{Duration, SystemTime};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

/// Files removed and files that could not be removed in one sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CleanupReport {
    pub removed: Vec<PathBuf>,
    pub failed: Vec<PathBuf>,
}

/// Retention period from the configured number of days.
pub fn retention_period(days: u32) -> Duration {
    Duration::from_secs(u64::from(days) * 24 * 60 * 60)
}

/// Remove every regular file under `roots` last modified before `now - max_age`.
///
/// Missing roots are skipped. Hidden directories below a root are not entered.
/// Directories themselves are left in place.
pub fn remove_older_than(roots: &[PathBuf], max_age: Duration, now: SystemTime) -> CleanupReport {
    let mut report = CleanupReport::default();
    let Some(cutoff) = now.checked_sub(max_age) else {
        return report;
    };

    for root in roots {
        if !root.exists() {
            continue;
        }

        let walker = WalkDir::new(root).into_iter().filter_entry(|entry| {
            if entry.file_type().is_dir() && entry.depth() > 0 {
                if let Some(name) = entry.file_name().to_str() {
                    return !name.starts_with('.');
                }
            }
            true
        });

        for entry in walker {
            let entry = match entry {
                Ok(e) => e,
                Err(e) => {
                    warn!(error = %e, "Error walking retention directory");
                    continue;
                }
            };
            if !entry.file_type().is_file() {
                continue;
            }

            let modified = match entry.metadata().ok().and_then(|m| m.modified().ok()) {
                Some(t) => t,
                None => continue,
            };
            if modified >= cutoff {
                continue;
            }

            let path = entry.into_path();
            match std::fs::remove_file(&path) {
                Ok(()) => {
                    debug!(path = %path.display(), "Removed expired file");
                    report.removed.push(path);
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Failed to remove expired file");
                    report.failed.push(path);
                }
            }
        }
    }

    if !report.removed.is_empty() {
        info!(removed = report.removed.len(), "Retention cleanup removed files");
    }
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    const DAY: Duration = Duration::from_secs(24 * 60 * 60);

    #[test]
    fn test_retention_period() {
        assert_eq!(retention_period(0), Duration::ZERO);
        assert_eq!(retention_period(2), DAY * 2);
    }

    #[test]
    fn test_removes_only_expired_files() {
        let dir = TempDir::new().unwrap();
        let nested = dir.path().join("Soccer");
        fs::create_dir_all(&nested).unwrap();
        let a = dir.path().join("a.mp4");
        let b = nested.join("b.mp4");
        fs::write(&a, b"x").unwrap();
        fs::write(&b, b"x").unwrap();

        // Nothing is older than a day yet
        let report = remove_older_than(&[dir.path().to_path_buf()], DAY, SystemTime::now());
        assert!(report.removed.is_empty());
        assert!(a.exists());

        // Two days from now both files have expired
        let later = SystemTime::now() + DAY * 2;
        let report = remove_older_than(&[dir.path().to_path_buf()], DAY, later);
        assert_eq!(report.removed.len(), 2);
        assert!(report.failed.is_empty());
        assert!(!a.exists());
        assert!(!b.exists());
        assert!(nested.exists());
    }

    #[test]
    fn test_skips_hidden_directories_and_missing_roots() {
        let dir = TempDir::new().unwrap();
        let hidden = dir.path().join(".partial");
        fs::create_dir_all(&hidden).unwrap();
        let kept = hidden.join("keep.ts");
        fs::write(&kept, b"x").unwrap();

        let roots = vec![dir.path().to_path_buf(), dir.path().join("does-not-exist")];
        let report = remove_older_than(&roots, DAY, SystemTime::now() + DAY * 2);
        assert!(report.removed.is_empty());
        assert!(kept.exists());
    }
}
