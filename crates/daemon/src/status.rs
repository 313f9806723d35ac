//! Live job state shared between supervisors and the control surface.

use crate::jobs::{ChannelCandidate, JobFlags, JobStatus, RecordingJob};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Where a job is in its lifecycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobPhase {
    #[default]
    Queued,
    Waiting,
    Authenticating,
    Capturing,
    Retrying,
    PostProcessing,
    Completed,
    Partial,
    Cancelled,
}

impl JobPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobPhase::Queued => "queued",
            JobPhase::Waiting => "waiting",
            JobPhase::Authenticating => "authenticating",
            JobPhase::Capturing => "capturing",
            JobPhase::Retrying => "retrying",
            JobPhase::PostProcessing => "post_processing",
            JobPhase::Completed => "completed",
            JobPhase::Partial => "partial",
            JobPhase::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobPhase::Completed | JobPhase::Partial | JobPhase::Cancelled)
    }
}

impl From<JobStatus> for JobPhase {
    fn from(status: JobStatus) -> Self {
        match status {
            JobStatus::Completed => JobPhase::Completed,
            JobStatus::Partial => JobPhase::Partial,
            JobStatus::Cancelled => JobPhase::Cancelled,
        }
    }
}

/// Per-job state written by its supervisor.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct LiveJobState {
    pub phase: JobPhase,
    pub server: Option<String>,
    pub channel: Option<String>,
    pub attempts: u32,
    pub segments: usize,
    pub error: Option<String>,
    pub published: Option<bool>,
    pub updated_at: Option<DateTime<Utc>>,
}

/// All live job states, keyed by job id.
#[derive(Debug, Clone, Default)]
pub struct StatusBoard {
    jobs: BTreeMap<String, LiveJobState>,
}

impl StatusBoard {
    pub fn get(&self, id: &str) -> Option<&LiveJobState> {
        self.jobs.get(id)
    }

    /// Apply `f` to the job's state, creating it if needed.
    pub fn update(&mut self, id: &str, f: impl FnOnce(&mut LiveJobState)) {
        let state = self.jobs.entry(id.to_string()).or_default();
        f(state);
        state.updated_at = Some(Utc::now());
    }

    /// Drop states of jobs not in `keep`.
    pub fn retain_ids(&mut self, keep: &[&str]) {
        self.jobs.retain(|id, _| keep.contains(&id.as_str()));
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }
}

/// Shared live state for concurrent access across daemon components
pub type SharedStatus = Arc<RwLock<StatusBoard>>;

pub fn new_shared_status() -> SharedStatus {
    Arc::new(RwLock::new(StatusBoard::default()))
}

/// A job as reported by the control surface.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JobView {
    pub id: String,
    pub description: String,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub priority: usize,
    pub channels: Vec<ChannelCandidate>,
    pub flags: JobFlags,
    pub state: JobPhase,
    pub current_server: Option<String>,
    pub current_channel: Option<String>,
    pub attempts: u32,
    pub error: Option<String>,
    /// `Some(false)` when the job finished but post-processing did not publish it
    #[serde(default)]
    pub published: Option<bool>,
}

impl JobView {
    pub fn new(job: &RecordingJob, live: Option<&LiveJobState>) -> Self {
        let state = match live {
            Some(live) => live.phase,
            None if job.flags.completed => JobPhase::Completed,
            None if job.flags.partial => JobPhase::Partial,
            None if job.flags.cancelled => JobPhase::Cancelled,
            None => JobPhase::Queued,
        };
        Self {
            id: job.id.clone(),
            description: job.description.clone(),
            start: job.start,
            end: job.end,
            priority: job.priority,
            channels: job.channels.clone(),
            flags: job.flags,
            state,
            current_server: live.and_then(|l| l.server.clone()),
            current_channel: live.and_then(|l| l.channel.clone()),
            attempts: live.map_or(0, |l| l.attempts),
            error: live.and_then(|l| l.error.clone()),
            published: live.and_then(|l| l.published),
        }
    }
}
