//! Liveness checking for capture output.
//!
//! A capture subprocess can hang without exiting, so health is judged by
//! how much its output file grows between samples.

use crate::history::smooth;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Result of comparing two samples of the output file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LivenessVerdict {
    /// Output grew by at least the acceptable amount.
    Growing { grew_by: u64 },
    /// Output grew by less than the acceptable amount (or shrank).
    Stalled { grew_by: u64 },
    /// Output file does not exist.
    Missing,
}

impl LivenessVerdict {
    pub fn is_alive(&self) -> bool {
        matches!(self, LivenessVerdict::Growing { .. })
    }
}

/// Compare the previous size with the current one.
///
/// This is a pure function extracted for property testing.
#[inline]
pub fn assess_growth(previous: u64, current: Option<u64>, acceptable_bytes: u64) -> LivenessVerdict {
    match current {
        None => LivenessVerdict::Missing,
        Some(size) => {
            let grew_by = size.saturating_sub(previous);
            if grew_by >= acceptable_bytes {
                LivenessVerdict::Growing { grew_by }
            } else {
                LivenessVerdict::Stalled { grew_by }
            }
        }
    }
}

/// KB/s for `bytes` written over `interval`.
pub fn interval_kbps(bytes: u64, interval: Duration) -> u64 {
    let secs = interval.as_secs_f64();
    if secs <= 0.0 {
        return 0;
    }
    (bytes as f64 / 1024.0 / secs) as u64
}

/// Liveness thresholds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LivenessSettings {
    pub interval: Duration,
    pub acceptable_bytes: u64,
}

/// Tracks one capture attempt's output file.
#[derive(Debug)]
pub struct LivenessMonitor {
    path: PathBuf,
    settings: LivenessSettings,
    last_size: u64,
    avg_kbps: u64,
    samples: u32,
}

impl LivenessMonitor {
    pub fn new(path: &Path, settings: LivenessSettings) -> Self {
        Self {
            path: path.to_path_buf(),
            settings,
            last_size: 0,
            avg_kbps: 0,
            samples: 0,
        }
    }

    /// Take one sample and fold its throughput into the running average.
    pub async fn sample(&mut self) -> LivenessVerdict {
        let current = tokio::fs::metadata(&self.path).await.ok().map(|m| m.len());
        self.record(current)
    }

    /// Fold a size observation into the monitor.
    pub fn record(&mut self, current: Option<u64>) -> LivenessVerdict {
        let verdict = assess_growth(self.last_size, current, self.settings.acceptable_bytes);
        let grew_by = match verdict {
            LivenessVerdict::Growing { grew_by } | LivenessVerdict::Stalled { grew_by } => grew_by,
            LivenessVerdict::Missing => 0,
        };
        self.avg_kbps = smooth(self.avg_kbps, interval_kbps(grew_by, self.settings.interval));
        self.samples += 1;
        if let Some(size) = current {
            self.last_size = size;
        }
        verdict
    }

    pub fn avg_kbps(&self) -> u64 {
        self.avg_kbps
    }

    pub fn last_size(&self) -> u64 {
        self.last_size
    }

    pub fn samples(&self) -> u32 {
        self.samples
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn settings(acceptable_bytes: u64) -> LivenessSettings {
        LivenessSettings {
            interval: Duration::from_secs(10),
            acceptable_bytes,
        }
    }

    proptest! {
        #[test]
        fn prop_growth_threshold(previous in 0u64..1_000_000, current in 0u64..2_000_000, acceptable in 0u64..100_000) {
            let verdict = assess_growth(previous, Some(current), acceptable);
            let grew = current.saturating_sub(previous);
            if grew >= acceptable {
                prop_assert_eq!(verdict, LivenessVerdict::Growing { grew_by: grew });
            } else {
                prop_assert_eq!(verdict, LivenessVerdict::Stalled { grew_by: grew });
            }
        }
    }

    #[test]
    fn test_slow_growth_is_stalled() {
        // 500 bytes in an interval where 1000 are required
        let verdict = assess_growth(10_000, Some(10_500), 1000);
        assert_eq!(verdict, LivenessVerdict::Stalled { grew_by: 500 });
        assert!(!verdict.is_alive());
    }

    #[test]
    fn test_missing_file() {
        assert_eq!(assess_growth(0, None, 1000), LivenessVerdict::Missing);
    }

    #[test]
    fn test_shrinking_file_is_stalled() {
        assert_eq!(
            assess_growth(5000, Some(100), 1),
            LivenessVerdict::Stalled { grew_by: 0 }
        );
    }

    #[test]
    fn test_interval_kbps() {
        assert_eq!(interval_kbps(1024 * 100, Duration::from_secs(10)), 10);
        assert_eq!(interval_kbps(1024, Duration::ZERO), 0);
    }

    #[test]
    fn test_monitor_tracks_average() {
        let mut monitor = LivenessMonitor::new(Path::new("/nonexistent"), settings(1000));
        assert!(monitor.record(Some(1024 * 200)).is_alive()); // 20 KB/s
        assert_eq!(monitor.avg_kbps(), 10);
        assert!(monitor.record(Some(1024 * 400)).is_alive()); // 20 KB/s
        assert_eq!(monitor.avg_kbps(), 15);
        assert!(!monitor.record(None).is_alive());
        assert_eq!(monitor.last_size(), 1024 * 400);
        assert_eq!(monitor.samples(), 3);
    }

    #[tokio::test]
    async fn test_sample_reads_file_size() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.ts");
        let mut monitor = LivenessMonitor::new(&path, settings(100));

        assert_eq!(monitor.sample().await, LivenessVerdict::Missing);
        std::fs::write(&path, vec![0u8; 150]).unwrap();
        assert_eq!(monitor.sample().await, LivenessVerdict::Growing { grew_by: 150 });
        assert_eq!(monitor.sample().await, LivenessVerdict::Stalled { grew_by: 0 });
    }
}
