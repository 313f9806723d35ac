//! Startup checks module
//!
//! Preflight checks run before the daemon starts. Any failure halts startup:
//! - Configuration is valid
//! - Output, log and publish directories exist or can be created
//! - The capture tool can be executed
//! - An initial authentication succeeds

use crate::auth::{AuthError, AuthProvider};
use std::path::{Path, PathBuf};
use std::process::Command;
use stream_capture_config::{Config, ConfigError};
use thiserror::Error;
use tracing::info;

/// Error types for startup checks
#[derive(Debug, Error)]
pub enum StartupError {
    #[error("Invalid configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("Capture tool not available: {0}")]
    ToolUnavailable(String),

    #[error("Cannot create directory {path}: {source}")]
    Directory {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Initial authentication failed: {0}")]
    Auth(#[from] AuthError),
}

/// Check that the capture tool runs by executing `<program> -version`.
///
/// Returns the first line of its output, which names the build.
pub fn check_capture_tool(program: &Path) -> Result<String, StartupError> {
    let output = Command::new(program).arg("-version").output().map_err(|e| {
        StartupError::ToolUnavailable(format!(
            "{} -version failed; is it installed and in PATH? Error: {}",
            program.display(),
            e
        ))
    })?;

    if !output.status.success() {
        return Err(StartupError::ToolUnavailable(format!(
            "{} -version exited with {}",
            program.display(),
            output.status
        )));
    }

    let banner = String::from_utf8_lossy(&output.stdout)
        .lines()
        .next()
        .unwrap_or_default()
        .trim()
        .to_string();
    info!(program = %program.display(), %banner, "Capture tool available");
    Ok(banner)
}

/// Create the output, log and publish directories.
pub fn ensure_directories(cfg: &Config) -> Result<(), StartupError> {
    let mut dirs = vec![&cfg.paths.output_dir, &cfg.paths.log_dir];
    if let Some(publish) = &cfg.paths.publish_dir {
        dirs.push(publish);
    }
    for dir in dirs {
        std::fs::create_dir_all(dir).map_err(|source| StartupError::Directory {
            path: dir.clone(),
            source,
        })?;
    }
    Ok(())
}

/// Obtain one token to prove the credentials work.
pub async fn verify_auth(auth: &dyn AuthProvider) -> Result<(), StartupError> {
    auth.get_token().await?;
    info!("Initial authentication succeeded");
    Ok(())
}

/// Run all startup checks in order
///
/// 1. Configuration validation
/// 2. Directories
/// 3. Capture tool
/// 4. Authentication
pub async fn run_startup_checks(cfg: &Config, auth: &dyn AuthProvider) -> Result<(), StartupError> {
    cfg.validate()?;
    ensure_directories(cfg)?;
    check_capture_tool(&cfg.capture.ffmpeg_path)?;
    verify_auth(auth).await?;
    Ok(())
}
