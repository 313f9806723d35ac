//! Command construction from configured argument templates.
//!
//! Templates are argument lists; each argument may contain placeholders
//! such as `[SERVER]` or `[FULLOUTPUTPATH]` that are substituted per call.

use std::fmt;
use std::path::{Path, PathBuf};

pub const SERVER: &str = "[SERVER]";
pub const CHANNEL: &str = "[CHANNEL]";
pub const AUTH_TOKEN: &str = "[AUTHTOKEN]";
pub const OUTPUT_PATH: &str = "[FULLOUTPUTPATH]";
pub const DESCRIPTION: &str = "[DESCRIPTION]";
pub const FILE_LIST: &str = "[FILELIST]";
pub const VIDEO_FILE: &str = "[VIDEOFILE]";

/// A fully substituted external command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureCommand {
    pub program: PathBuf,
    pub args: Vec<String>,
}

/// Substitute every placeholder in every argument.
pub fn render_args(template: &[String], values: &[(&str, &str)]) -> Vec<String> {
    template
        .iter()
        .map(|arg| {
            values
                .iter()
                .fold(arg.clone(), |acc, (placeholder, value)| acc.replace(placeholder, value))
        })
        .collect()
}

impl CaptureCommand {
    /// Command for one capture attempt.
    pub fn capture(
        program: &Path,
        template: &[String],
        server: &str,
        channel: &str,
        auth_token: &str,
        output: &Path,
        description: &str,
    ) -> Self {
        let output = output.to_string_lossy();
        Self {
            program: program.to_path_buf(),
            args: render_args(
                template,
                &[
                    (SERVER, server),
                    (CHANNEL, channel),
                    (AUTH_TOKEN, auth_token),
                    (OUTPUT_PATH, &output),
                    (DESCRIPTION, description),
                ],
            ),
        }
    }

    /// Command joining segments into one file. Segments are `|`-separated.
    pub fn concat(program: &Path, template: &[String], segments: &[PathBuf], output: &Path) -> Self {
        let list = segments
            .iter()
            .map(|p| p.to_string_lossy().to_string())
            .collect::<Vec<_>>()
            .join("|");
        let output = output.to_string_lossy();
        Self {
            program: program.to_path_buf(),
            args: render_args(template, &[(FILE_LIST, &list), (OUTPUT_PATH, &output)]),
        }
    }

    /// Command muxing the captured video into its final container.
    pub fn mux(
        program: &Path,
        template: &[String],
        video: &Path,
        output: &Path,
        description: &str,
    ) -> Self {
        let video = video.to_string_lossy();
        let output = output.to_string_lossy();
        Self {
            program: program.to_path_buf(),
            args: render_args(
                template,
                &[
                    (VIDEO_FILE, &video),
                    (OUTPUT_PATH, &output),
                    (DESCRIPTION, description),
                ],
            ),
        }
    }

    /// Printable form with `secret` masked, for logs.
    pub fn redacted(&self, secret: &str) -> String {
        let line = self.to_string();
        if secret.is_empty() {
            line
        } else {
            line.replace(secret, "***")
        }
    }
}

impl fmt::Display for CaptureCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program.display())?;
        for arg in &self.args {
            write!(f, " {}", arg)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn template(args: &[&str]) -> Vec<String> {
        args.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_capture_command_substitution() {
        let cmd = CaptureCommand::capture(
            Path::new("ffmpeg"),
            &template(&[
                "-i",
                "https://[SERVER]/ch[CHANNEL]q1.stream/playlist.m3u8?wmsAuthSign=[AUTHTOKEN]",
                "-c",
                "copy",
                "[FULLOUTPUTPATH]",
            ]),
            "deu.example.net",
            "05",
            "tok123",
            Path::new("/rec/show0.ts"),
            "Show",
        );
        assert_eq!(cmd.program, PathBuf::from("ffmpeg"));
        assert_eq!(
            cmd.args[1],
            "https://deu.example.net/ch05q1.stream/playlist.m3u8?wmsAuthSign=tok123"
        );
        assert_eq!(cmd.args[4], "/rec/show0.ts");
    }

    #[test]
    fn test_concat_joins_segments() {
        let cmd = CaptureCommand::concat(
            Path::new("ffmpeg"),
            &template(&["-i", "concat:[FILELIST]", "-c", "copy", "[FULLOUTPUTPATH]"]),
            &[PathBuf::from("/rec/a0.ts"), PathBuf::from("/rec/a1.ts")],
            Path::new("/rec/a.ts"),
        );
        assert_eq!(cmd.args[1], "concat:/rec/a0.ts|/rec/a1.ts");
        assert_eq!(cmd.args[4], "/rec/a.ts");
    }

    #[test]
    fn test_mux_placeholders() {
        let cmd = CaptureCommand::mux(
            Path::new("ffmpeg"),
            &template(&["-i", "[VIDEOFILE]", "-metadata", "title=[DESCRIPTION]", "[FULLOUTPUTPATH]"]),
            Path::new("/rec/a.ts"),
            Path::new("/rec/a.mp4"),
            "Cup Final",
        );
        assert_eq!(cmd.args, template(&["-i", "/rec/a.ts", "-metadata", "title=Cup Final", "/rec/a.mp4"]));
    }

    #[test]
    fn test_redacted_hides_token() {
        let cmd = CaptureCommand {
            program: PathBuf::from("ffmpeg"),
            args: template(&["-i", "http://x/?sig=secret"]),
        };
        assert_eq!(cmd.redacted("secret"), "ffmpeg -i http://x/?sig=***");
        assert_eq!(cmd.redacted(""), "ffmpeg -i http://x/?sig=secret");
    }
}
