//! Capture supervisor.
//!
//! Runs one recording job from dispatch to hand-off: waits for the start
//! time, authenticates, then captures segment after segment until the
//! job's end time, failing over between ranked (server, channel) pairs
//! when a capture ends early.
//!
//! # Pipeline
//! 1. Wait for the derived start time (cancellable)
//! 2. Obtain a session token
//! 3. Capture with a time budget equal to the time left
//! 4. On an early end: record history, then reset the retry window or fail over
//! 5. Stop at the end time (Completed) or when retries run out (Partial)
//! 6. Hand produced segments to post-processing

use crate::auth::{AuthProvider, AuthSession};
use crate::capture::{CaptureCommand, ExitInfo, ProcessRunner};
use crate::files::{segment_path, set_aside};
use crate::history::{AttemptReport, HistoryStore};
use crate::jobs::{JobStatus, RecordingJob};
use crate::notify::Notifier;
use crate::postprocess::{FinishRequest, VideoFilePostProcessor};
use crate::ranker::{RankedCandidate, RankerError, ServerChannelRanker};
use crate::status::{JobPhase, LiveJobState, SharedStatus};
use chrono::Utc;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use stream_capture_config::Config;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};

/// Error type for supervisor construction
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SupervisorError {
    /// The job cannot be ranked (no channels or no servers)
    #[error("Job cannot be captured: {0}")]
    Ranker(#[from] RankerError),
}

/// Per-job capture parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct SupervisorSettings {
    pub servers: Vec<String>,
    pub capture_program: PathBuf,
    pub capture_args: Vec<String>,
    pub output_dir: PathBuf,
    /// Attempts allowed inside one retry window
    pub max_retries: u32,
    /// An attempt that ran longer than this resets the retry counter
    pub retry_window: Duration,
    pub auth_validity: Duration,
}

impl SupervisorSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            servers: config.servers.clone(),
            capture_program: config.capture.ffmpeg_path.clone(),
            capture_args: config.capture.capture_args.clone(),
            output_dir: config.paths.output_dir.clone(),
            max_retries: config.capture.max_retries,
            retry_window: Duration::from_secs(config.capture.retry_window_minutes * 60),
            auth_validity: Duration::from_secs(config.auth.validity_minutes * 60),
        }
    }
}

/// Everything a supervisor shares with the rest of the daemon.
#[derive(Clone)]
pub struct SupervisorContext {
    pub settings: Arc<SupervisorSettings>,
    pub history: Arc<HistoryStore>,
    pub auth: Arc<dyn AuthProvider>,
    pub runner: Arc<dyn ProcessRunner>,
    pub post: Arc<dyn VideoFilePostProcessor>,
    pub notifier: Arc<dyn Notifier>,
    pub status: SharedStatus,
}

/// How a job ended.
#[derive(Debug, Clone, PartialEq)]
pub struct JobOutcome {
    pub status: JobStatus,
    pub error: Option<String>,
    /// Segment paths produced, in order
    pub segments: Vec<PathBuf>,
    /// Capture attempts started
    pub attempts: u32,
    pub published: bool,
    pub final_path: Option<PathBuf>,
}

impl JobOutcome {
    fn new(status: JobStatus) -> Self {
        Self {
            status,
            error: None,
            segments: Vec::new(),
            attempts: 0,
            published: false,
            final_path: None,
        }
    }

    fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }
}

/// Drives one job through its capture lifecycle.
pub struct CaptureSupervisor {
    ctx: SupervisorContext,
    job: RecordingJob,
    ranker: ServerChannelRanker,
}

impl CaptureSupervisor {
    /// Build the supervisor. Fails before any waiting when the job has
    /// no channels or no servers are configured.
    pub fn new(ctx: SupervisorContext, job: RecordingJob) -> Result<Self, SupervisorError> {
        let ranker = ServerChannelRanker::new(&ctx.history, &ctx.settings.servers, &job)?;
        Ok(Self { ctx, job, ranker })
    }

    pub fn job(&self) -> &RecordingJob {
        &self.job
    }

    /// Run to completion. Never fails: every fault ends up in the outcome.
    pub async fn run(self, cancel: CancellationToken) -> JobOutcome {
        let span = info_span!("job", id = %self.job.id, show = %self.job.description);
        self.run_inner(cancel).instrument(span).await
    }

    async fn run_inner(mut self, cancel: CancellationToken) -> JobOutcome {
        info!(
            start = %self.job.start,
            duration_mins = self.job.duration().num_minutes(),
            "Job dispatched"
        );
        if !self.wait_for_start(&cancel).await {
            info!("Cancelled before start");
            return self.finish(JobOutcome::new(JobStatus::Cancelled)).await;
        }

        self.set_state(|s| s.phase = JobPhase::Authenticating).await;
        let mut session = match self.ctx.auth.get_token().await {
            Ok(token) => AuthSession::new(token),
            Err(e) => {
                warn!(error = %e, "Authentication failed");
                let outcome = JobOutcome::new(JobStatus::Partial)
                    .with_error(format!("Authentication failed: {}", e));
                return self.finish(outcome).await;
            }
        };

        let mut outcome = self.capture_loop(&mut session, &cancel).await;

        if outcome.status != JobStatus::Cancelled && !outcome.segments.is_empty() {
            self.post_process(&mut outcome, &cancel).await;
        }
        self.finish(outcome).await
    }

    /// Returns `false` when cancelled while waiting.
    async fn wait_for_start(&self, cancel: &CancellationToken) -> bool {
        let Ok(wait) = (self.job.start - Utc::now()).to_std() else {
            return !cancel.is_cancelled();
        };
        self.set_state(|s| s.phase = JobPhase::Waiting).await;
        debug!(wait_secs = wait.as_secs(), "Waiting for start time");
        tokio::select! {
            _ = tokio::time::sleep(wait) => true,
            _ = cancel.cancelled() => false,
        }
    }

    async fn capture_loop(
        &mut self,
        session: &mut AuthSession,
        cancel: &CancellationToken,
    ) -> JobOutcome {
        let settings = Arc::clone(&self.ctx.settings);
        let mut outcome = JobOutcome::new(JobStatus::Partial);
        let mut window_attempts = 0u32;

        loop {
            if cancel.is_cancelled() {
                outcome.status = JobStatus::Cancelled;
                return outcome;
            }

            let remaining = match (self.job.end - Utc::now()).to_std() {
                Ok(d) if !d.is_zero() => d,
                // the previous attempt ended early, so nothing was live at the end
                _ if outcome.attempts > 0 => {
                    warn!("End time passed while retrying");
                    outcome.status = JobStatus::Partial;
                    return outcome.with_error("End time passed while retrying");
                }
                _ => return outcome.with_error("End time passed before capture started"),
            };

            let candidate = self.ranker.current().clone();
            let path = segment_path(&settings.output_dir, &self.job.file_base, outcome.segments.len());
            if let Err(e) = set_aside(&path) {
                warn!(path = %path.display(), error = %e, "Failed to move existing segment aside");
            }
            let command = CaptureCommand::capture(
                &settings.capture_program,
                &settings.capture_args,
                &candidate.server,
                &candidate.channel,
                &session.token,
                &path,
                &self.job.description,
            );

            outcome.attempts += 1;
            window_attempts += 1;
            let attempts = outcome.attempts;
            self.set_state(|s| {
                s.phase = JobPhase::Capturing;
                s.server = Some(candidate.server.clone());
                s.channel = Some(candidate.channel.clone());
                s.attempts = attempts;
                s.segments = attempts as usize;
            })
            .await;
            info!(
                server = %candidate.server,
                channel = %candidate.channel,
                attempt = attempts,
                remaining_secs = remaining.as_secs(),
                "Starting capture"
            );
            debug!(command = %command.redacted(&session.token), "Capture command");

            let started = Instant::now();
            let result = self
                .ctx
                .runner
                .run(&command, remaining, &path, cancel)
                .await;
            let elapsed = started.elapsed();
            outcome.segments.push(path);

            let (exit, kbps) = match result {
                Ok(o) => {
                    debug!(bytes = o.bytes_written, elapsed_secs = elapsed.as_secs(), "Segment written");
                    (Some(o.exit), o.avg_kbps)
                }
                Err(e) => {
                    warn!(error = %e, "Capture attempt could not run");
                    outcome.error = Some(e.to_string());
                    (None, 0)
                }
            };
            let reached_end = exit == Some(ExitInfo::TimedOut) || Utc::now() >= self.job.end;
            let cancelled = exit == Some(ExitInfo::Cancelled) || cancel.is_cancelled();

            self.record_attempt(&candidate, kbps, !reached_end && !cancelled, elapsed).await;

            if cancelled {
                outcome.status = JobStatus::Cancelled;
                return outcome;
            }
            if reached_end {
                self.ctx
                    .history
                    .record_success(&candidate.channel, &candidate.server, Utc::now());
                self.save_history().await;
                outcome.status = JobStatus::Completed;
                outcome.error = None;
                return outcome;
            }

            if elapsed > settings.retry_window {
                debug!(elapsed_secs = elapsed.as_secs(), "Capture ran past the retry window, resetting retries");
                window_attempts = 0;
            } else if window_attempts >= settings.max_retries {
                warn!(attempts = window_attempts, "Retry limit reached");
                outcome.status = JobStatus::Partial;
                outcome.error = Some(format!("Retry limit of {} reached", settings.max_retries));
                return outcome;
            } else {
                self.ranker.observe_rate(kbps);
                let next = self.ranker.advance().clone();
                info!(
                    server = %next.server,
                    channel = %next.channel,
                    pinned = self.ranker.is_pinned(),
                    "Failing over"
                );
            }

            self.set_state(|s| s.phase = JobPhase::Retrying).await;

            if session.is_expired(settings.auth_validity) {
                self.set_state(|s| s.phase = JobPhase::Authenticating).await;
                match self.ctx.auth.get_token().await {
                    Ok(token) => *session = AuthSession::new(token),
                    Err(e) => {
                        warn!(error = %e, "Re-authentication failed");
                        outcome.status = JobStatus::Partial;
                        outcome.error = Some(format!("Re-authentication failed: {}", e));
                        return outcome;
                    }
                }
            }
        }
    }

    async fn record_attempt(&self, candidate: &RankedCandidate, kbps: u64, failed: bool, elapsed: Duration) {
        self.ctx.history.record_attempt(
            &candidate.channel,
            &candidate.server,
            AttemptReport {
                kbps,
                failed,
                hours: elapsed.as_secs_f64() / 3600.0,
                at: Utc::now(),
            },
        );
        self.save_history().await;
    }

    async fn save_history(&self) {
        if let Err(e) = self.ctx.history.persist().await {
            warn!(error = %e, "Failed to save channel history");
        }
    }

    async fn post_process(&self, outcome: &mut JobOutcome, cancel: &CancellationToken) {
        self.set_state(|s| s.phase = JobPhase::PostProcessing).await;
        let request = FinishRequest {
            segments: outcome.segments.clone(),
            output_dir: self.ctx.settings.output_dir.clone(),
            file_base: self.job.file_base.clone(),
            description: self.job.description.clone(),
            category: self.job.category.clone(),
        };
        match self.ctx.post.finish(&request, cancel).await {
            Ok(path) => {
                info!(path = %path.display(), "Recording published");
                self.ctx
                    .notifier
                    .send(
                        &format!("Published: {}", self.job.description),
                        &path.display().to_string(),
                    )
                    .await;
                outcome.published = true;
                outcome.final_path = Some(path);
            }
            Err(e) => {
                warn!(error = %e, "Post-processing failed");
                self.ctx
                    .notifier
                    .send(
                        &format!("Post-processing failed: {}", self.job.description),
                        &e.to_string(),
                    )
                    .await;
                outcome.published = false;
            }
        }
    }

    async fn finish(&self, outcome: JobOutcome) -> JobOutcome {
        if outcome.status == JobStatus::Partial {
            let body = outcome.error.clone().unwrap_or_default();
            self.ctx
                .notifier
                .send(&format!("Recording incomplete: {}", self.job.description), &body)
                .await;
        }
        let phase = JobPhase::from(outcome.status);
        let error = outcome.error.clone();
        let published = outcome.published;
        self.set_state(|s| {
            s.phase = phase;
            s.error = error;
            s.published = Some(published);
        })
        .await;
        info!(
            status = %outcome.status,
            attempts = outcome.attempts,
            segments = outcome.segments.len(),
            published = outcome.published,
            "Job finished"
        );
        outcome
    }

    async fn set_state(&self, f: impl FnOnce(&mut LiveJobState)) {
        self.ctx.status.write().await.update(&self.job.id, f);
    }
}
