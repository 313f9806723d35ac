//! CLI entry point for the stream capture daemon
//!
//! Runs the daemon, records a single show on demand, or talks to a running
//! daemon's control API.

use chrono::{DateTime, Duration, Local, NaiveDateTime, TimeZone, Utc};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use stream_capture::{record_once, Config, Daemon, JobStatus, JobView, RecordingJob};
use tracing::{error, info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

/// Stream Capture - scheduled recording of live streams
#[derive(Parser, Debug)]
#[command(name = "stream-capture")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the configuration file (config.toml)
    #[arg(short, long, default_value = "config.toml")]
    config: PathBuf,

    /// Log at debug level unless RUST_LOG is set
    #[arg(short, long)]
    verbose: bool,

    /// Control API of a running daemon, for the client commands
    #[arg(long, default_value = "http://127.0.0.1:7878")]
    server: String,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the daemon (default)
    Run {
        /// Skip startup checks (capture tool, authentication). For testing only.
        #[arg(long)]
        skip_checks: bool,
    },
    /// Record channels for a fixed time, without the schedule
    Record {
        /// Channel numbers joined with '+', e.g. 01+02
        #[arg(long)]
        channels: String,
        /// Minutes to record
        #[arg(long)]
        duration: i64,
        /// Base name of the output file
        #[arg(long)]
        filename: String,
        /// Local start time "YYYY-MM-DD HH:MM", default now
        #[arg(long)]
        start: Option<String>,
        #[arg(long)]
        skip_checks: bool,
    },
    /// List the daemon's jobs
    Jobs,
    /// Ask the daemon to re-read the schedule now
    Reload,
    /// Cancel a job by id
    Cancel { id: String },
}

/// Console logging, plus a daily log file in `log_dir` when given.
///
/// The returned guard flushes the file writer on drop.
fn init_logging(verbose: bool, log_dir: Option<&Path>) -> Option<WorkerGuard> {
    let default_filter = if verbose { "debug" } else { "info" };
    let make_filter =
        || EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    let mut guard = None;
    let file_layer = log_dir.and_then(|dir| match std::fs::create_dir_all(dir) {
        Ok(()) => {
            let appender = tracing_appender::rolling::daily(dir, "stream-capture.log");
            let (writer, file_guard) = tracing_appender::non_blocking(appender);
            guard = Some(file_guard);
            Some(
                tracing_subscriber::fmt::layer()
                    .with_writer(writer)
                    .with_ansi(false)
                    .with_filter(make_filter()),
            )
        }
        Err(e) => {
            eprintln!("Warning: cannot create log directory {}: {}", dir.display(), e);
            None
        }
    });

    tracing_subscriber::registry()
        .with(file_layer)
        .with(tracing_subscriber::fmt::layer().with_filter(make_filter()))
        .init();
    guard
}

fn parse_channels(raw: &str) -> Vec<String> {
    raw.split('+')
        .map(str::trim)
        .filter(|c| !c.is_empty())
        .map(str::to_string)
        .collect()
}

fn parse_start(raw: Option<&str>) -> Result<DateTime<Utc>, String> {
    let Some(raw) = raw else {
        return Ok(Utc::now());
    };
    let naive = NaiveDateTime::parse_from_str(raw.trim(), "%Y-%m-%d %H:%M")
        .map_err(|e| format!("Invalid start time '{}': {}", raw, e))?;
    Local
        .from_local_datetime(&naive)
        .single()
        .map(|t| t.with_timezone(&Utc))
        .ok_or_else(|| format!("Ambiguous local start time '{}'", raw))
}

/// One line of the `jobs` listing.
fn format_job_line(job: &JobView) -> String {
    let channels: Vec<&str> = job.channels.iter().map(|c| c.number.as_str()).collect();
    let mut line = format!(
        "{}  {:<15}  {} - {}  [{}]  {}",
        job.id,
        job.state.as_str(),
        job.start.with_timezone(&Local).format("%Y-%m-%d %H:%M"),
        job.end.with_timezone(&Local).format("%H:%M"),
        channels.join("+"),
        job.description
    );
    if job.state.is_terminal() && job.published == Some(false) {
        line.push_str("  (not published)");
    }
    if let Some(error) = &job.error {
        line.push_str(&format!("  error: {}", error));
    }
    line
}

async fn run_daemon(config_path: &Path, skip_checks: bool) -> ExitCode {
    info!(config = %config_path.display(), "Stream capture daemon starting");

    let daemon_result = if skip_checks {
        warn!("Skipping startup checks (--skip-checks enabled)");
        Config::load(config_path)
            .map_err(Into::into)
            .and_then(Daemon::new_without_checks)
    } else {
        Daemon::new(config_path).await
    };

    match daemon_result {
        Ok(daemon) => {
            info!(
                servers = daemon.config.servers.len(),
                concurrent_captures = daemon.config.planner.concurrent_captures,
                control = %daemon.config.control.bind,
                "Daemon initialized"
            );
            if let Err(e) = daemon.run_with_server().await {
                error!(error = %e, "Daemon error");
                return ExitCode::FAILURE;
            }
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!(error = %e, "Failed to initialize daemon");
            ExitCode::FAILURE
        }
    }
}

async fn run_record(
    config_path: &Path,
    channels: &str,
    duration: i64,
    filename: &str,
    start: Option<&str>,
    skip_checks: bool,
) -> ExitCode {
    let config = match Config::load(config_path) {
        Ok(c) => c,
        Err(e) => {
            error!(error = %e, "Failed to load configuration");
            return ExitCode::FAILURE;
        }
    };
    let start = match parse_start(start) {
        Ok(s) => s,
        Err(e) => {
            error!("{}", e);
            return ExitCode::FAILURE;
        }
    };
    if duration <= 0 {
        error!(duration, "Duration must be a positive number of minutes");
        return ExitCode::FAILURE;
    }

    let job = RecordingJob::single_shot(filename, &parse_channels(channels), start, Duration::minutes(duration));
    info!(
        show = %job.description,
        start = %job.start,
        duration_mins = job.duration().num_minutes(),
        "Recording"
    );

    match record_once(&config, job, skip_checks).await {
        Ok(outcome) => {
            info!(
                status = %outcome.status,
                attempts = outcome.attempts,
                published = outcome.published,
                "Recording finished"
            );
            if let Some(path) = outcome.final_path {
                println!("{}", path.display());
            }
            if outcome.status == JobStatus::Completed {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            }
        }
        Err(e) => {
            error!(error = %e, "Recording failed");
            ExitCode::FAILURE
        }
    }
}

async fn client_request(server: &str, command: &Command) -> Result<(), String> {
    let client = reqwest::Client::new();
    let base = server.trim_end_matches('/');
    match command {
        Command::Jobs => {
            let jobs: Vec<JobView> = client
                .get(format!("{}/api/jobs", base))
                .send()
                .await
                .map_err(|e| e.to_string())?
                .error_for_status()
                .map_err(|e| e.to_string())?
                .json()
                .await
                .map_err(|e| e.to_string())?;
            if jobs.is_empty() {
                println!("No jobs");
            }
            for job in &jobs {
                println!("{}", format_job_line(job));
            }
        }
        Command::Reload => {
            client
                .post(format!("{}/api/reload", base))
                .send()
                .await
                .map_err(|e| e.to_string())?
                .error_for_status()
                .map_err(|e| e.to_string())?;
            println!("Reload requested");
        }
        Command::Cancel { id } => {
            let response = client
                .post(format!("{}/api/jobs/{}/cancel", base, id))
                .send()
                .await
                .map_err(|e| e.to_string())?;
            if response.status() == reqwest::StatusCode::NOT_FOUND {
                return Err(format!("No active job {}", id));
            }
            response.error_for_status().map_err(|e| e.to_string())?;
            println!("Cancelled {}", id);
        }
        Command::Run { .. } | Command::Record { .. } => {}
    }
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    let command = args.command.unwrap_or(Command::Run { skip_checks: false });

    // client commands only log to the console
    let log_dir = match &command {
        Command::Run { .. } | Command::Record { .. } => {
            Config::load(&args.config).ok().map(|c| c.paths.log_dir)
        }
        _ => None,
    };
    let _log_guard = init_logging(args.verbose, log_dir.as_deref());
    match &command {
        Command::Run { skip_checks } => run_daemon(&args.config, *skip_checks).await,
        Command::Record {
            channels,
            duration,
            filename,
            start,
            skip_checks,
        } => {
            run_record(
                &args.config,
                channels,
                *duration,
                filename,
                start.as_deref(),
                *skip_checks,
            )
            .await
        }
        client_command => match client_request(&args.server, client_command).await {
            Ok(()) => ExitCode::SUCCESS,
            Err(e) => {
                eprintln!("{}", e);
                ExitCode::FAILURE
            }
        },
    }
}
