//! Capture subprocess execution.
//!
//! One capture attempt runs the configured tool until it exits, its time
//! budget runs out, its output stops growing, or the job is cancelled.
//! Every kill reason cancels one per-attempt token and goes through the
//! same idempotent termination path.

use super::command::CaptureCommand;
use super::liveness::{LivenessMonitor, LivenessSettings};
use async_trait::async_trait;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Error type for capture process operations
#[derive(Debug, Error)]
pub enum CaptureError {
    /// The tool could not be started
    #[error("Failed to start {program}: {source}")]
    Spawn {
        program: String,
        source: std::io::Error,
    },

    /// Waiting on the process failed
    #[error("Failed waiting for capture process: {0}")]
    Wait(std::io::Error),
}

/// Why a capture attempt ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitInfo {
    /// The process exited by itself
    Exited(Option<i32>),
    /// The time budget ran out and the process was killed
    TimedOut,
    /// The liveness check killed the process
    Stalled,
    /// The job was cancelled and the process was killed
    Cancelled,
}

impl ExitInfo {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExitInfo::Exited(_) => "exited",
            ExitInfo::TimedOut => "timed_out",
            ExitInfo::Stalled => "stalled",
            ExitInfo::Cancelled => "cancelled",
        }
    }
}

/// Result of one capture attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CaptureOutcome {
    pub exit: ExitInfo,
    /// Average throughput seen by the liveness check
    pub avg_kbps: u64,
    /// Output size at the last sample
    pub bytes_written: u64,
}

/// Runs capture subprocesses.
#[async_trait]
pub trait ProcessRunner: Send + Sync {
    /// Run `command` writing to `output_path` for at most `timeout`.
    ///
    /// Cancelling `cancel` must terminate a running process.
    async fn run(
        &self,
        command: &CaptureCommand,
        timeout: Duration,
        output_path: &Path,
        cancel: &CancellationToken,
    ) -> Result<CaptureOutcome, CaptureError>;
}

/// Runs the capture tool with tokio's process support.
#[derive(Debug, Clone)]
pub struct TokioProcessRunner {
    liveness: LivenessSettings,
}

impl TokioProcessRunner {
    pub fn new(liveness: LivenessSettings) -> Self {
        Self { liveness }
    }
}

#[async_trait]
impl ProcessRunner for TokioProcessRunner {
    async fn run(
        &self,
        command: &CaptureCommand,
        timeout: Duration,
        output_path: &Path,
        cancel: &CancellationToken,
    ) -> Result<CaptureOutcome, CaptureError> {
        let mut child = spawn_logged(command)?;

        let kill = cancel.child_token();
        let mut stalled = false;
        let mut timed_out = false;
        let mut monitor = LivenessMonitor::new(output_path, self.liveness);
        let mut ticker = tokio::time::interval_at(
            tokio::time::Instant::now() + self.liveness.interval,
            self.liveness.interval,
        );
        let deadline = tokio::time::sleep(timeout);
        tokio::pin!(deadline);

        let exit = loop {
            tokio::select! {
                status = child.wait() => {
                    let status = status.map_err(CaptureError::Wait)?;
                    break ExitInfo::Exited(status.code());
                }
                _ = kill.cancelled() => {
                    terminate(&mut child).await;
                    break if stalled {
                        ExitInfo::Stalled
                    } else if timed_out {
                        ExitInfo::TimedOut
                    } else {
                        ExitInfo::Cancelled
                    };
                }
                _ = &mut deadline, if !timed_out => {
                    debug!("Capture reached its end time");
                    timed_out = true;
                    kill.cancel();
                }
                _ = ticker.tick(), if !kill.is_cancelled() => {
                    let verdict = monitor.sample().await;
                    if !verdict.is_alive() {
                        warn!(
                            ?verdict,
                            output = %output_path.display(),
                            "Capture output is not growing, killing process"
                        );
                        stalled = true;
                        kill.cancel();
                    }
                }
            }
        };

        info!(
            exit = exit.as_str(),
            avg_kbps = monitor.avg_kbps(),
            bytes = monitor.last_size(),
            samples = monitor.samples(),
            "Capture attempt ended"
        );

        Ok(CaptureOutcome {
            exit,
            avg_kbps: monitor.avg_kbps(),
            bytes_written: monitor.last_size(),
        })
    }
}

/// Spawn `command` with stderr forwarded to the log at debug level.
pub(crate) fn spawn_logged(command: &CaptureCommand) -> Result<Child, CaptureError> {
    let mut child = Command::new(&command.program)
        .args(&command.args)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|source| CaptureError::Spawn {
            program: command.program.display().to_string(),
            source,
        })?;

    if let Some(stderr) = child.stderr.take() {
        let program = command.program.display().to_string();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                debug!(target: "stream_capture::subprocess", %program, "{}", line);
            }
        });
    }

    Ok(child)
}

/// Stop a child process. Terminating an already exited process is a no-op.
pub(crate) async fn terminate(child: &mut Child) {
    if let Ok(Some(_)) = child.try_wait() {
        return;
    }
    let _ = child.start_kill();
    let _ = child.wait().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn create_test_runner(interval_ms: u64, acceptable_bytes: u64) -> TokioProcessRunner {
        TokioProcessRunner::new(LivenessSettings {
            interval: Duration::from_millis(interval_ms),
            acceptable_bytes,
        })
    }

    fn shell(script: &str) -> CaptureCommand {
        CaptureCommand {
            program: PathBuf::from("sh"),
            args: vec!["-c".to_string(), script.to_string()],
        }
    }

    #[test]
    fn test_exit_info_as_str() {
        assert_eq!(ExitInfo::Exited(Some(0)).as_str(), "exited");
        assert_eq!(ExitInfo::TimedOut.as_str(), "timed_out");
        assert_eq!(ExitInfo::Stalled.as_str(), "stalled");
        assert_eq!(ExitInfo::Cancelled.as_str(), "cancelled");
    }

    #[tokio::test]
    async fn test_spawn_failure_is_error() {
        let runner = create_test_runner(1000, 0);
        let cmd = CaptureCommand {
            program: PathBuf::from("/definitely/not/a/binary"),
            args: vec![],
        };
        let result = runner
            .run(&cmd, Duration::from_secs(1), Path::new("/tmp/x.ts"), &CancellationToken::new())
            .await;
        assert!(matches!(result, Err(CaptureError::Spawn { .. })));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_early_exit_is_reported() {
        let runner = create_test_runner(1000, 0);
        let outcome = runner
            .run(&shell("exit 3"), Duration::from_secs(5), Path::new("/tmp/none.ts"), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(outcome.exit, ExitInfo::Exited(Some(3)));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_missing_output_is_killed_as_stalled() {
        let dir = tempfile::tempdir().unwrap();
        let runner = create_test_runner(100, 1);
        let outcome = runner
            .run(&shell("sleep 30"), Duration::from_secs(20), &dir.path().join("never.ts"), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(outcome.exit, ExitInfo::Stalled);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_timeout_kills_process() {
        let dir = tempfile::tempdir().unwrap();
        let runner = create_test_runner(10_000, 0);
        let start = std::time::Instant::now();
        let outcome = runner
            .run(&shell("sleep 30"), Duration::from_millis(200), &dir.path().join("o.ts"), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(outcome.exit, ExitInfo::TimedOut);
        assert!(start.elapsed() < Duration::from_secs(10));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_cancel_terminates_running_process() {
        let dir = tempfile::tempdir().unwrap();
        let runner = create_test_runner(10_000, 0);
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            trigger.cancel();
        });
        let outcome = runner
            .run(&shell("sleep 30"), Duration::from_secs(20), &dir.path().join("o.ts"), &cancel)
            .await
            .unwrap();
        assert_eq!(outcome.exit, ExitInfo::Cancelled);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_terminate_is_idempotent() {
        let mut child = Command::new("sh").args(["-c", "exit 0"]).spawn().unwrap();
        let _ = child.wait().await;
        terminate(&mut child).await;
        terminate(&mut child).await;
    }
}
