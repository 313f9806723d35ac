//! Daemon startup and main loop
//!
//! Builds every component from the configuration, runs the startup checks,
//! then serves the control API next to the orchestrator loop until Ctrl-C.

use crate::auth::HttpAuthProvider;
use crate::capture::{LivenessSettings, TokioProcessRunner};
use crate::config::{Config, ConfigError};
use crate::control_server::{run_control_server, ServerError};
use crate::history::{HistoryError, HistoryStore};
use crate::jobs::RecordingJob;
use crate::keywords::{KeywordRules, KeywordsError};
use crate::notify::{LogNotifier, Notifier, WebhookNotifier};
use crate::orchestrator::{Orchestrator, OrchestratorSettings};
use crate::planner::{PlannerSettings, RecordingPlanner};
use crate::postprocess::FfmpegPostProcessor;
use crate::schedule::{JsonFeedSource, ScheduleError};
use crate::startup::{check_capture_tool, ensure_directories, run_startup_checks, verify_auth, StartupError};
use crate::status::new_shared_status;
use crate::supervisor::{CaptureSupervisor, JobOutcome, SupervisorContext, SupervisorError, SupervisorSettings};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Error type for daemon operations
#[derive(Debug, Error)]
pub enum DaemonError {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Startup check failed
    #[error("Startup check failed: {0}")]
    Startup(#[from] StartupError),

    #[error("Channel history error: {0}")]
    History(#[from] HistoryError),

    #[error("Keyword rules error: {0}")]
    Keywords(#[from] KeywordsError),

    #[error("Schedule source error: {0}")]
    Schedule(#[from] ScheduleError),

    #[error("Job rejected: {0}")]
    Supervisor(#[from] SupervisorError),

    #[error("HTTP client error: {0}")]
    Http(#[from] reqwest::Error),

    /// Control server error
    #[error("Server error: {0}")]
    Server(#[from] ServerError),
}

/// Build the shared capture context from configuration.
///
/// Loads the channel history file; a corrupt file is an error.
pub fn build_context(config: &Config, client: &reqwest::Client) -> Result<SupervisorContext, DaemonError> {
    let history = HistoryStore::load(&config.paths.history_file)?;
    info!(
        path = %config.paths.history_file.display(),
        entries = history.len(),
        "Channel history loaded"
    );

    let notifier: Arc<dyn Notifier> = match &config.notify.webhook_url {
        Some(url) => Arc::new(WebhookNotifier::new(client.clone(), url.clone())),
        None => Arc::new(LogNotifier),
    };

    Ok(SupervisorContext {
        settings: Arc::new(SupervisorSettings::from_config(config)),
        history: Arc::new(history),
        auth: Arc::new(HttpAuthProvider::new(client.clone(), &config.auth)),
        runner: Arc::new(TokioProcessRunner::new(LivenessSettings {
            interval: Duration::from_secs(config.capture.liveness_interval_secs),
            acceptable_bytes: config.capture.acceptable_bytes_per_interval,
        })),
        post: Arc::new(FfmpegPostProcessor::from_config(config)),
        notifier,
        status: new_shared_status(),
    })
}

/// Daemon state containing all runtime components
pub struct Daemon {
    /// Configuration loaded from file and environment
    pub config: Config,
    orchestrator: Arc<Orchestrator>,
}

impl Daemon {
    /// Initialize the daemon with configuration from file
    ///
    /// 1. Load config from file and apply environment overrides
    /// 2. Build components (history, collaborators, planner)
    /// 3. Run startup checks
    pub async fn new<P: AsRef<Path>>(config_path: P) -> Result<Self, DaemonError> {
        let config = Config::load(config_path)?;
        Self::with_config(config).await
    }

    /// Initialize the daemon with an existing configuration
    pub async fn with_config(config: Config) -> Result<Self, DaemonError> {
        let daemon = Self::new_without_checks(config)?;
        let auth = daemon.orchestrator.context().auth.clone();
        run_startup_checks(&daemon.config, auth.as_ref()).await?;
        Ok(daemon)
    }

    /// Initialize the daemon without running startup checks
    ///
    /// Useful for testing when the capture tool or auth endpoint are not available.
    pub fn new_without_checks(config: Config) -> Result<Self, DaemonError> {
        let client = reqwest::Client::builder().build()?;
        let ctx = build_context(&config, &client)?;
        let source = JsonFeedSource::from_config(client, &config.schedule)?;
        let rules = KeywordRules::load(&config.schedule.keywords_file)?;
        info!(rules = rules.len(), "Keyword rules loaded");

        let orchestrator = Orchestrator::new(
            OrchestratorSettings::from_config(&config),
            RecordingPlanner::new(PlannerSettings::from_config(&config)),
            Arc::new(source),
            Arc::new(rules),
            ctx,
        );

        Ok(Self {
            config,
            orchestrator: Arc::new(orchestrator),
        })
    }

    pub fn orchestrator(&self) -> Arc<Orchestrator> {
        self.orchestrator.clone()
    }

    /// Run the orchestrator and the control server until Ctrl-C.
    ///
    /// Shutdown cancels every running job and waits for them to wind down.
    pub async fn run_with_server(&self) -> Result<(), DaemonError> {
        let orchestrator = self.orchestrator.clone();
        let server_shutdown = CancellationToken::new();

        let bind = self.config.control.bind.clone();
        let server_orchestrator = orchestrator.clone();
        let server_token = server_shutdown.clone();
        let mut server = tokio::spawn(async move {
            run_control_server(server_orchestrator, &bind, server_token).await
        });
        let mut main_loop = tokio::spawn(orchestrator.clone().run());

        let mut result = Ok(());
        let mut server_done = false;
        let mut loop_done = false;
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupt received");
            }
            res = &mut server => {
                server_done = true;
                match res {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => result = Err(e.into()),
                    Err(e) => error!(error = %e, "Control server task failed"),
                }
            }
            res = &mut main_loop => {
                loop_done = true;
                if let Err(e) = res {
                    error!(error = %e, "Orchestrator task failed");
                }
            }
        }

        orchestrator.shutdown();
        server_shutdown.cancel();
        if !loop_done {
            if let Err(e) = main_loop.await {
                warn!(error = %e, "Orchestrator task failed");
            }
        }
        if !server_done {
            if let Ok(Err(e)) = server.await {
                warn!(error = %e, "Control server stopped with an error");
            }
        }
        result
    }
}

/// Record a single job to completion without the planner.
///
/// The schedule settings are not needed here, so only the directory,
/// capture tool and authentication checks run. Ctrl-C cancels the recording.
pub async fn record_once(config: &Config, job: RecordingJob, skip_checks: bool) -> Result<JobOutcome, DaemonError> {
    let client = reqwest::Client::builder().build()?;
    let ctx = build_context(config, &client)?;
    if !skip_checks {
        ensure_directories(config)?;
        check_capture_tool(&config.capture.ffmpeg_path)?;
        verify_auth(ctx.auth.as_ref()).await?;
    }

    let supervisor = CaptureSupervisor::new(ctx, job)?;
    let cancel = CancellationToken::new();
    let on_interrupt = cancel.clone();
    let watcher = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupt received, stopping recording");
            on_interrupt.cancel();
        }
    });

    let outcome = supervisor.run(cancel).await;
    watcher.abort();
    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration as ChronoDuration, Utc};

    fn create_test_config(dir: &Path) -> Config {
        let feed = dir.join("feed.json");
        std::fs::write(&feed, "{}").unwrap();
        let keywords = dir.join("keywords.toml");
        std::fs::write(&keywords, "[[rules]]\nkeywords = [\"Final\"]\n").unwrap();

        let mut config = Config::default();
        config.servers = vec!["s1.example.net".to_string()];
        config.schedule.file = Some(feed);
        config.schedule.keywords_file = keywords;
        config.paths.output_dir = dir.join("rec");
        config.paths.log_dir = dir.join("logs");
        config.paths.history_file = dir.join("history.json");
        config
    }

    #[tokio::test]
    async fn test_daemon_initialization_without_checks() {
        let dir = tempfile::tempdir().unwrap();
        let config = create_test_config(dir.path());
        let daemon = Daemon::new_without_checks(config.clone()).unwrap();

        assert_eq!(daemon.config, config);
        assert!(daemon.orchestrator().jobs().await.is_empty());
        assert!(daemon.orchestrator().history().is_empty());
    }

    #[tokio::test]
    async fn test_empty_feed_cycle() {
        let dir = tempfile::tempdir().unwrap();
        let daemon = Daemon::new_without_checks(create_test_config(dir.path())).unwrap();
        let report = daemon.orchestrator().run_cycle(Utc::now()).await.unwrap();
        assert_eq!(report.fetched, 0);
        assert!(report.dispatched.is_empty());
    }

    #[test]
    fn test_missing_schedule_source_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = create_test_config(dir.path());
        config.schedule.file = None;
        config.schedule.url = None;
        assert!(matches!(
            Daemon::new_without_checks(config),
            Err(DaemonError::Schedule(ScheduleError::NotConfigured))
        ));
    }

    #[test]
    fn test_corrupt_history_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let config = create_test_config(dir.path());
        std::fs::write(&config.paths.history_file, "{ not json").unwrap();
        assert!(matches!(
            Daemon::new_without_checks(config),
            Err(DaemonError::History(_))
        ));
    }

    #[test]
    fn test_missing_keywords_file_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = create_test_config(dir.path());
        config.schedule.keywords_file = dir.path().join("none.toml");
        assert!(matches!(
            Daemon::new_without_checks(config),
            Err(DaemonError::Keywords(_))
        ));
    }

    #[tokio::test]
    async fn test_record_once_rejects_job_without_channels() {
        let dir = tempfile::tempdir().unwrap();
        let config = create_test_config(dir.path());
        let job = RecordingJob::single_shot("Clip", &[], Utc::now(), ChronoDuration::minutes(1));
        let result = record_once(&config, job, true).await;
        assert!(matches!(result, Err(DaemonError::Supervisor(_))));
    }
}
