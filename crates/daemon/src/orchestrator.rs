//! Orchestrator loop.
//!
//! Runs planning cycles at the configured check hours (or on demand),
//! dispatches admitted jobs to their own supervisor tasks and tracks them
//! until they finish. A supervisor task that panics is contained at its
//! `JoinHandle` and recorded as a partial recording.

use crate::cleanup::{remove_older_than, retention_period};
use crate::history::HistoryStore;
use crate::jobs::{JobStatus, RecordingJob, ShowCandidate};
use crate::keywords::KeywordMatcher;
use crate::notify::scheduled_summary;
use crate::planner::{IngestSummary, RecordingPlanner};
use crate::schedule::{fetch_with_retry, ScheduleError, ScheduleSource};
use crate::status::{JobPhase, JobView, SharedStatus};
use crate::supervisor::{CaptureSupervisor, SupervisorContext};
use chrono::{DateTime, Duration as ChronoDuration, Local, NaiveDateTime, NaiveTime, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use stream_capture_config::Config;
use thiserror::Error;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Error type for planning cycles
#[derive(Debug, Error)]
pub enum OrchestratorError {
    /// The schedule could not be fetched; the previous job set is kept
    #[error("Schedule unavailable: {0}")]
    Schedule(#[from] ScheduleError),
}

/// Loop parameters
#[derive(Debug, Clone, PartialEq)]
pub struct OrchestratorSettings {
    /// Hours of the day at which the schedule is checked
    pub check_hours: Vec<u32>,
    pub fetch_attempts: u32,
    pub fetch_retry_delay: Duration,
    pub retention: Option<Duration>,
    /// Directories swept by retention cleanup
    pub retention_roots: Vec<PathBuf>,
}

impl OrchestratorSettings {
    pub fn from_config(config: &Config) -> Self {
        let mut retention_roots = vec![config.paths.output_dir.clone(), config.paths.log_dir.clone()];
        if let Some(publish) = &config.paths.publish_dir {
            retention_roots.push(publish.clone());
        }
        Self {
            check_hours: config.sorted_check_hours(),
            fetch_attempts: config.schedule.fetch_attempts,
            fetch_retry_delay: Duration::from_secs(config.schedule.fetch_retry_delay_secs),
            retention: config.paths.retention_days.map(retention_period),
            retention_roots,
        }
    }
}

/// What one planning cycle did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub fetched: usize,
    pub ingest: IngestSummary,
    /// Ids of jobs dispatched this cycle
    pub dispatched: Vec<String>,
    /// Jobs currently held back by the concurrency ceiling
    pub too_many: usize,
    pub removed_files: usize,
}

struct ActiveJob {
    cancel: CancellationToken,
    monitor: Option<JoinHandle<()>>,
}

/// Owns the job set and the running supervisors.
pub struct Orchestrator {
    settings: OrchestratorSettings,
    planner: Mutex<RecordingPlanner>,
    source: Arc<dyn ScheduleSource>,
    matcher: Arc<dyn KeywordMatcher>,
    ctx: SupervisorContext,
    active: Mutex<HashMap<String, ActiveJob>>,
    trigger: Notify,
    shutdown: CancellationToken,
}

impl Orchestrator {
    pub fn new(
        settings: OrchestratorSettings,
        planner: RecordingPlanner,
        source: Arc<dyn ScheduleSource>,
        matcher: Arc<dyn KeywordMatcher>,
        ctx: SupervisorContext,
    ) -> Self {
        Self {
            settings,
            planner: Mutex::new(planner),
            source,
            matcher,
            ctx,
            active: Mutex::new(HashMap::new()),
            trigger: Notify::new(),
            shutdown: CancellationToken::new(),
        }
    }

    /// Run one planning cycle at `now`.
    pub async fn run_cycle(self: &Arc<Self>, now: DateTime<Utc>) -> Result<CycleReport, OrchestratorError> {
        let mut report = CycleReport::default();

        if let Some(retention) = self.settings.retention {
            let cleaned = remove_older_than(&self.settings.retention_roots, retention, SystemTime::now());
            report.removed_files = cleaned.removed.len();
        }

        let shows = match fetch_with_retry(
            self.source.as_ref(),
            self.settings.fetch_attempts,
            self.settings.fetch_retry_delay,
        )
        .await
        {
            Ok(shows) => shows,
            Err(e) => {
                warn!(error = %e, "Schedule fetch failed, keeping previous jobs");
                self.ctx
                    .notifier
                    .send("Schedule fetch failed", &e.to_string())
                    .await;
                return Err(e.into());
            }
        };
        report.fetched = shows.len();

        let (claimed, scheduled) = self.claim_jobs(&shows, now, &mut report);
        for (supervisor, cancel) in claimed {
            report.dispatched.push(self.dispatch(supervisor, cancel));
        }
        self.prune_status().await;

        if !scheduled.is_empty() {
            self.ctx
                .notifier
                .send("New shows scheduled", &scheduled_summary(&scheduled))
                .await;
        }

        info!(
            fetched = report.fetched,
            created = report.ingest.created,
            updated = report.ingest.updated,
            dispatched = report.dispatched.len(),
            too_many = report.too_many,
            "Planning cycle finished"
        );
        Ok(report)
    }

    /// Merge the fetched shows, plan, and claim every eligible job.
    ///
    /// A claimed job is marked dispatched and registered as active under the
    /// planner lock, so `cancel` always finds either the queued job or its
    /// token.
    fn claim_jobs(
        &self,
        shows: &[ShowCandidate],
        now: DateTime<Utc>,
        report: &mut CycleReport,
    ) -> (Vec<(CaptureSupervisor, CancellationToken)>, Vec<RecordingJob>) {
        let mut claimed = Vec::new();
        let mut scheduled = Vec::new();
        let mut planner = self.planner.lock();
        report.ingest = planner.ingest(shows, self.matcher.as_ref());
        let eligible = planner.plan(now);
        report.too_many = planner.jobs().iter().filter(|j| j.flags.too_many).count();

        for job in eligible {
            match CaptureSupervisor::new(self.ctx.clone(), job.clone()) {
                Ok(supervisor) => {
                    planner.mark_dispatched(&job.id);
                    let cancel = self.shutdown.child_token();
                    self.active.lock().insert(
                        job.id.clone(),
                        ActiveJob {
                            cancel: cancel.clone(),
                            monitor: None,
                        },
                    );
                    scheduled.push(job);
                    claimed.push((supervisor, cancel));
                }
                Err(e) => {
                    warn!(show = %job.description, error = %e, "Job cannot be dispatched");
                    planner.mark_finished(&job.id, JobStatus::Partial);
                }
            }
        }
        (claimed, scheduled)
    }

    /// Spawn a claimed supervisor and a monitor task that records its outcome.
    fn dispatch(self: &Arc<Self>, supervisor: CaptureSupervisor, cancel: CancellationToken) -> String {
        let id = supervisor.job().id.clone();
        let description = supervisor.job().description.clone();

        let task = tokio::spawn(supervisor.run(cancel));
        let this = Arc::clone(self);
        let job_id = id.clone();
        let monitor = tokio::spawn(async move {
            let status = match task.await {
                Ok(outcome) => outcome.status,
                Err(e) => {
                    error!(id = %job_id, show = %description, error = %e, "Supervisor task failed");
                    let message = e.to_string();
                    this.ctx.status.write().await.update(&job_id, |s| {
                        s.phase = JobPhase::Partial;
                        s.error = Some(message.clone());
                    });
                    this.ctx
                        .notifier
                        .send(&format!("Recording crashed: {}", description), &message)
                        .await;
                    JobStatus::Partial
                }
            };
            this.planner.lock().mark_finished(&job_id, status);
            this.active.lock().remove(&job_id);
            debug!(id = %job_id, %status, "Job released");
        });

        if let Some(active) = self.active.lock().get_mut(&id) {
            active.monitor = Some(monitor);
        }
        id
    }

    async fn prune_status(&self) {
        let mut keep: Vec<String> = self.planner.lock().jobs().iter().map(|j| j.id.clone()).collect();
        keep.extend(self.active.lock().keys().cloned());
        let keep: Vec<&str> = keep.iter().map(String::as_str).collect();
        self.ctx.status.write().await.retain_ids(&keep);
    }

    /// Run planning cycles until shutdown.
    pub async fn run(self: Arc<Self>) {
        info!(check_hours = ?self.settings.check_hours, "Orchestrator started");
        loop {
            if let Err(e) = self.run_cycle(Utc::now()).await {
                warn!(error = %e, "Planning cycle skipped");
            }

            let now = Local::now().naive_local();
            let next = next_check_time(now, &self.settings.check_hours);
            let wait = (next - now).to_std().unwrap_or(Duration::ZERO);
            info!(next = %next, "Next schedule check");

            tokio::select! {
                _ = tokio::time::sleep(wait) => {}
                _ = self.trigger.notified() => info!("Reload requested"),
                _ = self.shutdown.cancelled() => break,
            }
        }
        self.wait_for_jobs().await;
        info!("Orchestrator stopped");
    }

    /// Request an immediate planning cycle.
    pub fn trigger(&self) {
        self.trigger.notify_one();
    }

    /// Cancel a job by id. Returns `false` for unknown or finished jobs.
    pub fn cancel(&self, id: &str) -> bool {
        if let Some(active) = self.active.lock().get(id) {
            info!(%id, "Cancelling running job");
            active.cancel.cancel();
            return true;
        }
        let mut planner = self.planner.lock();
        match planner.job(id) {
            Some(job) if !job.flags.is_finished() => {
                info!(%id, "Cancelling queued job");
                planner.mark_cancelled(id)
            }
            _ => false,
        }
    }

    /// Current jobs with their live state.
    pub async fn jobs(&self) -> Vec<JobView> {
        let jobs = self.planner.lock().jobs().to_vec();
        let board = self.ctx.status.read().await;
        jobs.iter().map(|job| JobView::new(job, board.get(&job.id))).collect()
    }

    pub fn active_count(&self) -> usize {
        self.active.lock().len()
    }

    /// Cancel every running job and stop the loop.
    pub fn shutdown(&self) {
        info!("Shutting down, cancelling running jobs");
        self.shutdown.cancel();
    }

    pub fn is_shut_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Wait for every dispatched job's monitor to finish.
    pub async fn wait_for_jobs(&self) {
        let monitors: Vec<JoinHandle<()>> = self
            .active
            .lock()
            .values_mut()
            .filter_map(|a| a.monitor.take())
            .collect();
        for monitor in monitors {
            let _ = monitor.await;
        }
    }

    pub fn context(&self) -> &SupervisorContext {
        &self.ctx
    }

    pub fn status(&self) -> SharedStatus {
        self.ctx.status.clone()
    }

    pub fn history(&self) -> Arc<HistoryStore> {
        self.ctx.history.clone()
    }
}

/// First check time strictly after `now`, wrapping to tomorrow.
///
/// `hours` must be sorted; out-of-range hours are skipped.
pub fn next_check_time(now: NaiveDateTime, hours: &[u32]) -> NaiveDateTime {
    let times: Vec<NaiveTime> = hours
        .iter()
        .filter_map(|&h| NaiveTime::from_hms_opt(h, 0, 0))
        .collect();
    let Some(first) = times.first() else {
        return now + ChronoDuration::hours(1);
    };
    let today = now.date();
    match times.iter().find(|t| today.and_time(**t) > now) {
        Some(t) => today.and_time(*t),
        None => today.and_time(*first) + ChronoDuration::days(1),
    }
}
