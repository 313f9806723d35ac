//! Persisted throughput history per (channel, server) pair.
//!
//! The store is shared by every running capture. Mutations take one
//! short-lived lock; `save` snapshots under that lock and writes the
//! snapshot afterwards, so a write never observes a half-applied update.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

/// Error type for history persistence
#[derive(Debug, Error)]
pub enum HistoryError {
    #[error("History IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse history file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },

    #[error("Failed to serialize history: {0}")]
    Serialize(serde_json::Error),

    #[error("History save task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

/// Observed statistics for one (channel, server) pair.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct HistoryRecord {
    pub channel: String,
    pub server: String,
    /// Smoothed throughput in KB/s
    pub avg_kbps: u64,
    pub attempts: u64,
    pub errors: u64,
    pub hours_recorded: f64,
    pub last_attempt: Option<DateTime<Utc>>,
    pub last_success: Option<DateTime<Utc>>,
}

/// Report for one finished capture attempt.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AttemptReport {
    /// Average throughput observed during the attempt
    pub kbps: u64,
    /// The attempt ended before the job's target end
    pub failed: bool,
    pub hours: f64,
    pub at: DateTime<Utc>,
}

/// Smoothing rule shared by the store and the ranker.
#[inline]
pub fn smooth(avg: u64, observed: u64) -> u64 {
    ((avg as u128 + observed as u128) / 2) as u64
}

/// Composite key of a pair.
pub fn history_key(channel: &str, server: &str) -> String {
    format!("{}@{}", channel, server)
}

/// Throughput history, optionally backed by a JSON file.
#[derive(Debug, Default)]
pub struct HistoryStore {
    path: Option<PathBuf>,
    records: Mutex<BTreeMap<String, HistoryRecord>>,
    save_lock: Mutex<()>,
}

impl HistoryStore {
    /// Store that is never written to disk.
    pub fn in_memory() -> Self {
        Self::default()
    }

    /// Load the store from `path`.
    ///
    /// A missing file yields an empty store; a corrupt file is an error,
    /// history is never silently discarded.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, HistoryError> {
        let path = path.as_ref().to_path_buf();
        let records = if path.exists() {
            let content = fs::read_to_string(&path)?;
            if content.trim().is_empty() {
                BTreeMap::new()
            } else {
                serde_json::from_str(&content).map_err(|source| HistoryError::Parse {
                    path: path.clone(),
                    source,
                })?
            }
        } else {
            BTreeMap::new()
        };
        debug!(path = %path.display(), entries = records.len(), "Loaded channel history");
        Ok(Self {
            path: Some(path),
            records: Mutex::new(records),
            save_lock: Mutex::new(()),
        })
    }

    /// Smoothed throughput of a pair, 0 when unseen.
    pub fn avg_kbps(&self, channel: &str, server: &str) -> u64 {
        self.records
            .lock()
            .get(&history_key(channel, server))
            .map(|r| r.avg_kbps)
            .unwrap_or(0)
    }

    pub fn get(&self, channel: &str, server: &str) -> Option<HistoryRecord> {
        self.records.lock().get(&history_key(channel, server)).cloned()
    }

    /// Fold one attempt into the pair's record, creating it if needed.
    pub fn record_attempt(&self, channel: &str, server: &str, report: AttemptReport) {
        let mut records = self.records.lock();
        let record = records
            .entry(history_key(channel, server))
            .or_insert_with(|| HistoryRecord {
                channel: channel.to_string(),
                server: server.to_string(),
                ..HistoryRecord::default()
            });
        record.attempts += 1;
        if report.failed {
            record.errors += 1;
        }
        record.hours_recorded += report.hours.max(0.0);
        record.avg_kbps = smooth(record.avg_kbps, report.kbps);
        record.last_attempt = Some(report.at);
    }

    /// Mark the pair that carried a job to its end.
    pub fn record_success(&self, channel: &str, server: &str, at: DateTime<Utc>) {
        let mut records = self.records.lock();
        let record = records
            .entry(history_key(channel, server))
            .or_insert_with(|| HistoryRecord {
                channel: channel.to_string(),
                server: server.to_string(),
                ..HistoryRecord::default()
            });
        record.last_success = Some(at);
    }

    /// Operator reset. With both `channel` and `server` only that pair is
    /// removed, otherwise every record matching the given parts is.
    ///
    /// Returns the number of records removed.
    pub fn reset(&self, channel: Option<&str>, server: Option<&str>) -> usize {
        let mut records = self.records.lock();
        let before = records.len();
        records.retain(|_, r| {
            let channel_hit = channel.map_or(true, |c| r.channel == c);
            let server_hit = server.map_or(true, |s| r.server == s);
            !(channel_hit && server_hit)
        });
        before - records.len()
    }

    /// Copy of every record.
    pub fn snapshot(&self) -> Vec<HistoryRecord> {
        self.records.lock().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.lock().is_empty()
    }

    /// Persist the store (no-op for in-memory stores).
    ///
    /// Writes to a temporary file and renames it over the target.
    pub fn save(&self) -> Result<(), HistoryError> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let _guard = self.save_lock.lock();
        let snapshot = self.records.lock().clone();
        let json = serde_json::to_string_pretty(&snapshot).map_err(HistoryError::Serialize)?;

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, json)?;
        fs::rename(&tmp, path)?;
        Ok(())
    }

    /// `save` on the blocking pool, for callers on the async runtime.
    pub async fn persist(self: &Arc<Self>) -> Result<(), HistoryError> {
        let store = Arc::clone(self);
        tokio::task::spawn_blocking(move || store.save()).await?
    }
}
