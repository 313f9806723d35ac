//! Core configuration structures and loading logic

use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

/// Error type for configuration operations
#[derive(Debug)]
pub enum ConfigError {
    /// IO error reading config file
    Io(std::io::Error),
    /// TOML parsing error
    Parse(toml::de::Error),
    /// A value parsed but is not usable
    Invalid(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "Failed to read config file: {}", e),
            ConfigError::Parse(e) => write!(f, "Failed to parse config: {}", e),
            ConfigError::Invalid(msg) => write!(f, "Invalid configuration: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(e: std::io::Error) -> Self {
        ConfigError::Io(e)
    }
}

impl From<toml::de::Error> for ConfigError {
    fn from(e: toml::de::Error) -> Self {
        ConfigError::Parse(e)
    }
}

/// Capture subprocess settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CaptureConfig {
    /// Capture/concat/mux tool
    #[serde(default = "default_ffmpeg_path")]
    pub ffmpeg_path: PathBuf,
    /// Argument template for a capture attempt.
    /// Placeholders: [SERVER], [CHANNEL], [AUTHTOKEN], [FULLOUTPUTPATH], [DESCRIPTION]
    #[serde(default = "default_capture_args")]
    pub capture_args: Vec<String>,
    /// Argument template for joining segments. Placeholders: [FILELIST], [FULLOUTPUTPATH]
    #[serde(default = "default_concat_args")]
    pub concat_args: Vec<String>,
    /// Argument template for the final mux.
    /// Placeholders: [VIDEOFILE], [FULLOUTPUTPATH], [DESCRIPTION]
    #[serde(default = "default_mux_args")]
    pub mux_args: Vec<String>,
    /// Capture attempts allowed inside one retry window
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Seconds between output-growth samples
    #[serde(default = "default_liveness_interval_secs")]
    pub liveness_interval_secs: u64,
    /// Minimum growth of the output file per sample interval
    #[serde(default = "default_acceptable_bytes_per_interval")]
    pub acceptable_bytes_per_interval: u64,
    /// A capture that ran longer than this resets the retry counter
    #[serde(default = "default_retry_window_minutes")]
    pub retry_window_minutes: u64,
}

fn default_ffmpeg_path() -> PathBuf {
    PathBuf::from("ffmpeg")
}

fn default_capture_args() -> Vec<String> {
    [
        "-hide_banner",
        "-i",
        "https://[SERVER]/view/ch[CHANNEL]q1.stream/playlist.m3u8?wmsAuthSign=[AUTHTOKEN]",
        "-c",
        "copy",
        "[FULLOUTPUTPATH]",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

fn default_concat_args() -> Vec<String> {
    ["-i", "concat:[FILELIST]", "-c", "copy", "[FULLOUTPUTPATH]"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

fn default_mux_args() -> Vec<String> {
    [
        "-i",
        "[VIDEOFILE]",
        "-acodec",
        "copy",
        "-vcodec",
        "copy",
        "-metadata",
        "title=[DESCRIPTION]",
        "[FULLOUTPUTPATH]",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

fn default_max_retries() -> u32 {
    3
}

fn default_liveness_interval_secs() -> u64 {
    10
}

fn default_acceptable_bytes_per_interval() -> u64 {
    100_000
}

fn default_retry_window_minutes() -> u64 {
    15
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            ffmpeg_path: default_ffmpeg_path(),
            capture_args: default_capture_args(),
            concat_args: default_concat_args(),
            mux_args: default_mux_args(),
            max_retries: default_max_retries(),
            liveness_interval_secs: default_liveness_interval_secs(),
            acceptable_bytes_per_interval: default_acceptable_bytes_per_interval(),
            retry_window_minutes: default_retry_window_minutes(),
        }
    }
}

/// Authentication endpoint settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AuthConfig {
    /// URL template with [USERNAME] and [PASSWORD] placeholders
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub user: String,
    #[serde(default)]
    pub pass: String,
    /// How long a session token stays usable
    #[serde(default = "default_validity_minutes")]
    pub validity_minutes: u64,
}

fn default_validity_minutes() -> u64 {
    240
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            user: String::new(),
            pass: String::new(),
            validity_minutes: default_validity_minutes(),
        }
    }
}

/// Schedule feed and planning-time settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ScheduleConfig {
    /// Remote JSON feed
    pub url: Option<String>,
    /// Local feed file, takes precedence over `url` (debugging)
    pub file: Option<PathBuf>,
    /// Hours of the day (local time) at which the schedule is re-read
    #[serde(default = "default_check_hours")]
    pub check_hours: Vec<u32>,
    /// Only dispatch shows starting within this many hours
    #[serde(default = "default_hours_in_future")]
    pub hours_in_future: i64,
    /// Added to every schedule time
    #[serde(default)]
    pub time_offset_hours: i64,
    #[serde(default = "default_fetch_attempts")]
    pub fetch_attempts: u32,
    #[serde(default = "default_fetch_retry_delay_secs")]
    pub fetch_retry_delay_secs: u64,
    /// Keyword rules file
    #[serde(default = "default_keywords_file")]
    pub keywords_file: PathBuf,
}

fn default_check_hours() -> Vec<u32> {
    vec![6, 12, 18]
}

fn default_hours_in_future() -> i64 {
    6
}

fn default_fetch_attempts() -> u32 {
    3
}

fn default_fetch_retry_delay_secs() -> u64 {
    30
}

fn default_keywords_file() -> PathBuf {
    PathBuf::from("keywords.toml")
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            url: None,
            file: None,
            check_hours: default_check_hours(),
            hours_in_future: default_hours_in_future(),
            time_offset_hours: 0,
            fetch_attempts: default_fetch_attempts(),
            fetch_retry_delay_secs: default_fetch_retry_delay_secs(),
            keywords_file: default_keywords_file(),
        }
    }
}

/// Admission settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PlannerConfig {
    /// Maximum number of overlapping captures
    #[serde(default = "default_concurrent_captures")]
    pub concurrent_captures: usize,
}

fn default_concurrent_captures() -> usize {
    2
}

impl Default for PlannerConfig {
    fn default() -> Self {
        Self {
            concurrent_captures: default_concurrent_captures(),
        }
    }
}

/// Filesystem locations
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PathsConfig {
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,
    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,
    /// Archive location finished recordings are moved to
    pub publish_dir: Option<PathBuf>,
    #[serde(default = "default_history_file")]
    pub history_file: PathBuf,
    /// Files older than this are removed from the managed directories
    pub retention_days: Option<u32>,
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("recordings")
}

fn default_log_dir() -> PathBuf {
    PathBuf::from("logs")
}

fn default_history_file() -> PathBuf {
    PathBuf::from("channelhistory.json")
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            output_dir: default_output_dir(),
            log_dir: default_log_dir(),
            publish_dir: None,
            history_file: default_history_file(),
            retention_days: None,
        }
    }
}

/// Notification delivery
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct NotifyConfig {
    /// Receives a JSON `{subject, body}` POST per notification
    pub webhook_url: Option<String>,
}

/// Control HTTP surface
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ControlConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
}

fn default_bind() -> String {
    "127.0.0.1:7878".to_string()
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
        }
    }
}

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct Config {
    /// Server address templates, tried in ranked order
    #[serde(default)]
    pub servers: Vec<String>,
    #[serde(default)]
    pub capture: CaptureConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub schedule: ScheduleConfig,
    #[serde(default)]
    pub planner: PlannerConfig,
    #[serde(default)]
    pub paths: PathsConfig,
    #[serde(default)]
    pub notify: NotifyConfig,
    #[serde(default)]
    pub control: ControlConfig,
}

impl Config {
    /// Load configuration from a TOML file
    ///
    /// Parses the config.toml file and handles missing optional fields with defaults.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)?;
        Self::parse_toml(&content)
    }

    /// Parse configuration from a TOML string
    pub fn parse_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;
        Ok(config)
    }

    /// Apply environment variable overrides to the configuration
    ///
    /// Overrides the following values if environment variables are set:
    /// - STREAM_CAPTURE_USER -> auth.user
    /// - STREAM_CAPTURE_PASS -> auth.pass
    /// - STREAM_CAPTURE_CONCURRENT_CAPTURES -> planner.concurrent_captures
    /// - STREAM_CAPTURE_MAX_RETRIES -> capture.max_retries
    /// - STREAM_CAPTURE_HOURS_IN_FUTURE -> schedule.hours_in_future
    /// - STREAM_CAPTURE_TIME_OFFSET_HOURS -> schedule.time_offset_hours
    /// - STREAM_CAPTURE_OUTPUT_DIR -> paths.output_dir
    pub fn apply_env_overrides(&mut self) {
        if let Ok(val) = env::var("STREAM_CAPTURE_USER") {
            self.auth.user = val;
        }

        if let Ok(val) = env::var("STREAM_CAPTURE_PASS") {
            self.auth.pass = val;
        }

        if let Ok(val) = env::var("STREAM_CAPTURE_CONCURRENT_CAPTURES") {
            if let Ok(n) = val.parse::<usize>() {
                self.planner.concurrent_captures = n;
            }
        }

        if let Ok(val) = env::var("STREAM_CAPTURE_MAX_RETRIES") {
            if let Ok(n) = val.parse::<u32>() {
                self.capture.max_retries = n;
            }
        }

        if let Ok(val) = env::var("STREAM_CAPTURE_HOURS_IN_FUTURE") {
            if let Ok(h) = val.parse::<i64>() {
                self.schedule.hours_in_future = h;
            }
        }

        if let Ok(val) = env::var("STREAM_CAPTURE_TIME_OFFSET_HOURS") {
            if let Ok(h) = val.parse::<i64>() {
                self.schedule.time_offset_hours = h;
            }
        }

        if let Ok(val) = env::var("STREAM_CAPTURE_OUTPUT_DIR") {
            if !val.is_empty() {
                self.paths.output_dir = PathBuf::from(val);
            }
        }
    }

    /// Reject configurations the daemon cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.servers.is_empty() {
            return Err(ConfigError::Invalid("at least one server is required".into()));
        }
        if self.planner.concurrent_captures == 0 {
            return Err(ConfigError::Invalid(
                "planner.concurrent_captures must be at least 1".into(),
            ));
        }
        if self.capture.max_retries == 0 {
            return Err(ConfigError::Invalid("capture.max_retries must be at least 1".into()));
        }
        if self.capture.liveness_interval_secs == 0 {
            return Err(ConfigError::Invalid(
                "capture.liveness_interval_secs must be greater than 0".into(),
            ));
        }
        if !self
            .capture
            .capture_args
            .iter()
            .any(|arg| arg.contains("[FULLOUTPUTPATH]"))
        {
            return Err(ConfigError::Invalid(
                "capture.capture_args must contain [FULLOUTPUTPATH]".into(),
            ));
        }
        if self.schedule.check_hours.is_empty() {
            return Err(ConfigError::Invalid("schedule.check_hours must not be empty".into()));
        }
        if let Some(hour) = self.schedule.check_hours.iter().find(|h| **h > 23) {
            return Err(ConfigError::Invalid(format!(
                "schedule.check_hours contains {}, expected 0-23",
                hour
            )));
        }
        if self.schedule.url.is_none() && self.schedule.file.is_none() {
            return Err(ConfigError::Invalid(
                "one of schedule.url or schedule.file is required".into(),
            ));
        }
        if self.schedule.fetch_attempts == 0 {
            return Err(ConfigError::Invalid(
                "schedule.fetch_attempts must be at least 1".into(),
            ));
        }
        if self.auth.url.is_empty() {
            return Err(ConfigError::Invalid("auth.url is required".into()));
        }
        Ok(())
    }

    /// Check hours, sorted and de-duplicated
    pub fn sorted_check_hours(&self) -> Vec<u32> {
        let mut hours = self.schedule.check_hours.clone();
        hours.sort_unstable();
        hours.dedup();
        hours
    }

    /// Load configuration from file, apply environment overrides and validate
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let mut config = Self::load_from_file(path)?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }
}
