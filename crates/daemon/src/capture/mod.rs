//! Capture subprocess modules

pub mod command;
pub mod liveness;
pub mod runner;

pub use command::{render_args, CaptureCommand};
pub use liveness::{assess_growth, LivenessMonitor, LivenessSettings, LivenessVerdict};
pub use runner::{CaptureError, CaptureOutcome, ExitInfo, ProcessRunner, TokioProcessRunner};
