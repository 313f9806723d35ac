//! Stream Capture
//!
//! Background service that plans recordings from a schedule feed, captures
//! them from ranked stream sources and hands the results to post-processing.

pub mod auth;
pub mod capture;
pub mod cleanup;
pub mod concurrency;
pub mod control_server;
pub mod daemon;
pub mod files;
pub mod history;
pub mod jobs;
pub mod keywords;
pub mod notify;
pub mod orchestrator;
pub mod planner;
pub mod postprocess;
pub mod ranker;
pub mod schedule;
pub mod startup;
pub mod status;
pub mod supervisor;

pub use stream_capture_config as config;
pub use stream_capture_config::Config;
pub use auth::{AuthError, AuthProvider, HttpAuthProvider};
pub use capture::{CaptureCommand, CaptureError, CaptureOutcome, ExitInfo, ProcessRunner, TokioProcessRunner};
pub use concurrency::{admission_sweep, admit_by_priority};
pub use control_server::{create_control_router, run_control_server, ServerError};
pub use daemon::{record_once, Daemon, DaemonError};
pub use history::{HistoryError, HistoryRecord, HistoryStore};
pub use jobs::{ChannelCandidate, JobFlags, JobStatus, RecordingJob, ShowCandidate};
pub use keywords::{KeywordMatcher, KeywordRules, PreferenceRule};
pub use notify::{LogNotifier, Notifier, WebhookNotifier};
pub use orchestrator::{next_check_time, CycleReport, Orchestrator, OrchestratorError};
pub use planner::{PlannerSettings, RecordingPlanner};
pub use postprocess::{FfmpegPostProcessor, FinishRequest, PostProcessError, VideoFilePostProcessor};
pub use ranker::{RankedCandidate, RankerError, ServerChannelRanker};
pub use schedule::{JsonFeedSource, ScheduleError, ScheduleSource};
pub use startup::{run_startup_checks, StartupError};
pub use status::{new_shared_status, JobPhase, JobView, LiveJobState, SharedStatus};
pub use supervisor::{CaptureSupervisor, JobOutcome, SupervisorContext, SupervisorError, SupervisorSettings};
