//! Post-processing of captured segments: concat, mux, cleanup, publish.

use crate::capture::runner::{spawn_logged, terminate};
use crate::capture::{CaptureCommand, CaptureError};
use crate::files::{file_len, move_file, set_aside};
use crate::jobs::sanitize_file_base;
use async_trait::async_trait;
use std::fs;
use std::path::{Path, PathBuf};
use stream_capture_config::Config;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum PostProcessError {
    #[error("No non-empty segments to process")]
    NoSegments,

    #[error("Failed to run {step}: {source}")]
    Tool {
        step: &'static str,
        source: CaptureError,
    },

    #[error("{step} exited with code {code:?}")]
    ToolFailed {
        step: &'static str,
        code: Option<i32>,
    },

    #[error("{step} did not produce {path}")]
    MissingOutput { step: &'static str, path: PathBuf },

    #[error("Post-processing cancelled")]
    Cancelled,

    #[error("Post-processing IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// What to finish for a job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FinishRequest {
    pub segments: Vec<PathBuf>,
    pub output_dir: PathBuf,
    pub file_base: String,
    /// Written into the container metadata
    pub description: String,
    /// Publish sub-folder
    pub category: String,
}

/// Turns captured segments into a published recording.
#[async_trait]
pub trait VideoFilePostProcessor: Send + Sync {
    /// Returns the final location of the recording.
    async fn finish(
        &self,
        request: &FinishRequest,
        cancel: &CancellationToken,
    ) -> Result<PathBuf, PostProcessError>;
}

/// Post-processing with the configured ffmpeg templates.
#[derive(Debug, Clone)]
pub struct FfmpegPostProcessor {
    program: PathBuf,
    concat_args: Vec<String>,
    mux_args: Vec<String>,
    publish_dir: Option<PathBuf>,
}

impl FfmpegPostProcessor {
    pub fn new(
        program: PathBuf,
        concat_args: Vec<String>,
        mux_args: Vec<String>,
        publish_dir: Option<PathBuf>,
    ) -> Self {
        Self {
            program,
            concat_args,
            mux_args,
            publish_dir,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(
            config.capture.ffmpeg_path.clone(),
            config.capture.concat_args.clone(),
            config.capture.mux_args.clone(),
            config.paths.publish_dir.clone(),
        )
    }

    fn publish(&self, video: &Path, category: &str) -> Result<PathBuf, PostProcessError> {
        let Some(root) = &self.publish_dir else {
            return Ok(video.to_path_buf());
        };
        let dir = match sanitize_file_base(category) {
            c if c.is_empty() => root.clone(),
            c => root.join(c),
        };
        fs::create_dir_all(&dir)?;
        let Some(name) = video.file_name() else {
            return Ok(video.to_path_buf());
        };
        let target = dir.join(name);
        set_aside(&target)?;
        move_file(video, &target)?;
        info!(target = %target.display(), "Published recording");
        Ok(target)
    }
}

#[async_trait]
impl VideoFilePostProcessor for FfmpegPostProcessor {
    async fn finish(
        &self,
        request: &FinishRequest,
        cancel: &CancellationToken,
    ) -> Result<PathBuf, PostProcessError> {
        let segments: Vec<PathBuf> = request
            .segments
            .iter()
            .filter(|p| file_len(p).map_or(false, |len| len > 0))
            .cloned()
            .collect();
        if segments.is_empty() {
            return Err(PostProcessError::NoSegments);
        }

        let mut intermediates = segments.clone();
        let video = if segments.len() > 1 {
            let joined = request.output_dir.join(format!("{}.ts", request.file_base));
            set_aside(&joined)?;
            let cmd = CaptureCommand::concat(&self.program, &self.concat_args, &segments, &joined);
            run_tool(&cmd, "concat", cancel).await?;
            if file_len(&joined).is_none() {
                return Err(PostProcessError::MissingOutput { step: "concat", path: joined });
            }
            intermediates.push(joined.clone());
            joined
        } else {
            segments[0].clone()
        };

        let mp4 = request.output_dir.join(format!("{}.mp4", request.file_base));
        set_aside(&mp4)?;
        let cmd = CaptureCommand::mux(&self.program, &self.mux_args, &video, &mp4, &request.description);
        run_tool(&cmd, "mux", cancel).await?;
        if file_len(&mp4).is_none() {
            return Err(PostProcessError::MissingOutput { step: "mux", path: mp4 });
        }

        for path in &intermediates {
            if let Err(e) = fs::remove_file(path) {
                warn!(path = %path.display(), error = %e, "Failed to remove segment");
            }
        }

        self.publish(&mp4, &request.category)
    }
}

async fn run_tool(
    cmd: &CaptureCommand,
    step: &'static str,
    cancel: &CancellationToken,
) -> Result<(), PostProcessError> {
    debug!(step, command = %cmd, "Running post-processing step");
    let mut child = spawn_logged(cmd).map_err(|source| PostProcessError::Tool { step, source })?;
    tokio::select! {
        status = child.wait() => {
            let status = status?;
            if status.success() {
                Ok(())
            } else {
                Err(PostProcessError::ToolFailed { step, code: status.code() })
            }
        }
        _ = cancel.cancelled() => {
            terminate(&mut child).await;
            Err(PostProcessError::Cancelled)
        }
    }
}
