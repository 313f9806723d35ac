//! Recording job model.
//!
//! This module turns schedule entries that matched a keyword rule into
//! `RecordingJob`s: derived start/end times, file naming and the channel
//! set a job may be captured from.

use crate::keywords::{KeywordMatch, PreferenceRule};
use chrono::{DateTime, Duration, NaiveDateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Characters removed from show names when building file names.
const FILE_NAME_STRIP: &[char] = &[
    '|', '\'', '/', '\\', ',', '<', '>', '#', '@', '!', '+', '&', '^', '*', '(', ')', '~', '`',
    ';', ':', '"', '?',
];

/// Time formats seen in schedule feeds, tried in order.
const SCHEDULE_TIME_FORMATS: &[&str] = &[
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%d %H:%M",
    "%m/%d/%Y %H:%M:%S",
    "%m/%d/%Y %H:%M",
];

/// One show as listed by the schedule feed.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ShowCandidate {
    pub id: String,
    pub name: String,
    pub channel: String,
    pub quality: String,
    pub language: String,
    pub category: String,
    /// Raw start time string
    pub time: String,
    /// Raw end time string
    pub end_time: String,
    /// Runtime in minutes, as listed
    pub runtime: String,
}

/// A channel a job can be captured from.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChannelCandidate {
    /// Zero-padded channel number
    pub number: String,
    /// Human readable description, e.g. `"05 (720p/English)"`
    pub description: String,
    pub quality: String,
    pub language: String,
}

impl ChannelCandidate {
    /// Create a candidate, padding the channel number.
    pub fn new(number: &str, quality: &str, language: &str) -> Self {
        let number = pad_channel(number);
        let description = format!("{} ({}/{})", number, quality, language);
        Self {
            number,
            description,
            quality: quality.to_string(),
            language: language.to_string(),
        }
    }
}

/// Preference tokens inherited from the matching keyword rule.
///
/// Tokens may carry repeated `+`/`-` characters as weight modifiers.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct PreferenceTokens {
    pub quality: Vec<String>,
    pub language: Vec<String>,
    pub channel: Vec<String>,
    pub category: Vec<String>,
}

impl PreferenceTokens {
    pub fn from_rule(rule: &PreferenceRule) -> Self {
        Self {
            quality: rule.quality_pref.clone(),
            language: rule.lang_pref.clone(),
            channel: rule.channel_pref.clone(),
            category: rule.category_pref.clone(),
        }
    }
}

/// State flags of a job.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct JobFlags {
    pub queued: bool,
    pub dispatched: bool,
    pub completed: bool,
    pub partial: bool,
    pub too_many: bool,
    pub cancelled: bool,
}

impl JobFlags {
    /// The job has run (or was cancelled) and will not be dispatched again.
    pub fn is_finished(&self) -> bool {
        self.completed || self.partial || self.cancelled
    }
}

/// How a dispatched job ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Capture was live when the target end time was reached.
    Completed,
    /// Retries were exhausted or the job failed before its end.
    Partial,
    /// Cancelled by the operator or at shutdown.
    Cancelled,
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobStatus::Completed => write!(f, "completed"),
            JobStatus::Partial => write!(f, "partial"),
            JobStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// A scheduled recording.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RecordingJob {
    /// Opaque identifier used by the control surface
    pub id: String,
    /// Merge key: show name + raw start time
    pub key: String,
    /// Show name
    pub description: String,
    /// Sanitised base name for output files
    pub file_base: String,
    pub raw_start: NaiveDateTime,
    pub raw_end: NaiveDateTime,
    /// Capture start (pre-roll and time offset applied)
    pub start: DateTime<Utc>,
    /// Capture end (post-roll and time offset applied)
    pub end: DateTime<Utc>,
    pub category: String,
    /// Position of the matching rule, lower is more important
    pub priority: usize,
    /// Keyword that matched
    pub keyword: String,
    pub channels: Vec<ChannelCandidate>,
    pub flags: JobFlags,
    pub preferences: PreferenceTokens,
}

impl RecordingJob {
    /// Merge key for a show.
    pub fn key_for(name: &str, raw_start: &str) -> String {
        format!("{}{}", name, raw_start)
    }

    /// Build a job from a matched show.
    ///
    /// Returns `None` when the show's times cannot be parsed.
    pub fn from_show(show: &ShowCandidate, matched: &KeywordMatch, offset: Duration) -> Option<Self> {
        let times = derive_times(show, &matched.rule, offset)?;
        let mut job = Self {
            id: Uuid::new_v4().simple().to_string()[..12].to_string(),
            key: Self::key_for(&show.name, &show.time),
            description: show.name.clone(),
            file_base: String::new(),
            raw_start: times.raw_start,
            raw_end: times.raw_end,
            start: times.start,
            end: times.end,
            category: show.category.clone(),
            priority: matched.priority,
            keyword: matched.keyword.clone(),
            channels: Vec::new(),
            flags: JobFlags {
                queued: true,
                ..JobFlags::default()
            },
            preferences: PreferenceTokens::from_rule(&matched.rule),
        };
        job.file_base = file_base_for(&show.name, &times.raw_start);
        job.add_channel(ChannelCandidate::new(&show.channel, &show.quality, &show.language));
        Some(job)
    }

    /// Refresh a job from a re-seen show: fields are overwritten, the
    /// channel is added to the candidate set, flags are kept.
    ///
    /// Returns `false` (and leaves the job untouched) when the show's
    /// times cannot be parsed.
    pub fn update_from_show(
        &mut self,
        show: &ShowCandidate,
        matched: &KeywordMatch,
        offset: Duration,
    ) -> bool {
        let Some(times) = derive_times(show, &matched.rule, offset) else {
            return false;
        };
        self.description = show.name.clone();
        self.file_base = file_base_for(&show.name, &times.raw_start);
        self.raw_start = times.raw_start;
        self.raw_end = times.raw_end;
        self.start = times.start;
        self.end = times.end;
        self.category = show.category.clone();
        self.priority = matched.priority;
        self.keyword = matched.keyword.clone();
        self.preferences = PreferenceTokens::from_rule(&matched.rule);
        self.add_channel(ChannelCandidate::new(&show.channel, &show.quality, &show.language));
        true
    }

    /// Add a channel, replacing an existing entry with the same number.
    pub fn add_channel(&mut self, candidate: ChannelCandidate) {
        if candidate.number.is_empty() {
            return;
        }
        match self
            .channels
            .iter_mut()
            .find(|c| c.number == candidate.number)
        {
            Some(existing) => *existing = candidate,
            None => self.channels.push(candidate),
        }
    }

    /// A job recorded on demand, outside the schedule.
    pub fn single_shot(
        file_base: &str,
        channels: &[String],
        start: DateTime<Utc>,
        duration: Duration,
    ) -> Self {
        let mut job = Self {
            id: Uuid::new_v4().simple().to_string()[..12].to_string(),
            key: Self::key_for(file_base, &start.to_rfc3339()),
            description: file_base.to_string(),
            file_base: sanitize_file_base(file_base),
            raw_start: start.naive_utc(),
            raw_end: (start + duration).naive_utc(),
            start,
            end: start + duration,
            category: String::new(),
            priority: 0,
            keyword: String::new(),
            channels: Vec::new(),
            flags: JobFlags {
                queued: true,
                ..JobFlags::default()
            },
            preferences: PreferenceTokens::default(),
        };
        for channel in channels {
            job.add_channel(ChannelCandidate::new(channel, "", ""));
        }
        job
    }

    /// Planned capture length.
    pub fn duration(&self) -> Duration {
        self.end - self.start
    }
}

struct DerivedTimes {
    raw_start: NaiveDateTime,
    raw_end: NaiveDateTime,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
}

fn derive_times(show: &ShowCandidate, rule: &PreferenceRule, offset: Duration) -> Option<DerivedTimes> {
    let raw_start = parse_schedule_time(&show.time)?;
    let raw_end = match parse_schedule_time(&show.end_time) {
        Some(end) => end,
        None => {
            let minutes: i64 = show.runtime.trim().parse().ok()?;
            raw_start + Duration::minutes(minutes)
        }
    };
    if raw_end <= raw_start {
        return None;
    }
    let start = Utc.from_utc_datetime(&raw_start) - Duration::minutes(rule.pre_minutes) + offset;
    let end = Utc.from_utc_datetime(&raw_end) + Duration::minutes(rule.post_minutes) + offset;
    Some(DerivedTimes {
        raw_start,
        raw_end,
        start,
        end,
    })
}

fn file_base_for(name: &str, raw_start: &NaiveDateTime) -> String {
    format!("{}{}", sanitize_file_base(name), raw_start.format("%Y%m%d%H%M"))
}

/// Parse a schedule time string in any of the known feed formats.
pub fn parse_schedule_time(raw: &str) -> Option<NaiveDateTime> {
    let raw = raw.trim();
    SCHEDULE_TIME_FORMATS
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(raw, fmt).ok())
}

/// Make a show name safe for use as a file name.
///
/// Spaces become `_`; shell and path metacharacters are removed.
pub fn sanitize_file_base(name: &str) -> String {
    name.trim()
        .chars()
        .map(|c| if c == ' ' { '_' } else { c })
        .filter(|c| !FILE_NAME_STRIP.contains(c))
        .collect()
}

/// Zero-pad single digit channel numbers to two digits.
pub fn pad_channel(raw: &str) -> String {
    let trimmed = raw.trim();
    if trimmed.len() == 1 && trimmed.chars().all(|c| c.is_ascii_digit()) {
        format!("0{}", trimmed)
    } else {
        trimmed.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn create_test_match(pre: i64, post: i64) -> KeywordMatch {
        KeywordMatch {
            rule: PreferenceRule {
                keywords: vec!["premier league".to_string()],
                pre_minutes: pre,
                post_minutes: post,
                quality_pref: vec!["720p+".to_string()],
                ..PreferenceRule::default()
            },
            keyword: "premier league".to_string(),
            priority: 2,
        }
    }

    fn create_test_show(channel: &str) -> ShowCandidate {
        ShowCandidate {
            id: "4412".to_string(),
            name: "Premier League: Arsenal v Spurs".to_string(),
            channel: channel.to_string(),
            quality: "720p".to_string(),
            language: "English".to_string(),
            category: "Soccer".to_string(),
            time: "2024-03-02 15:00:00".to_string(),
            end_time: "2024-03-02 17:00:00".to_string(),
            runtime: "120".to_string(),
        }
    }

    #[test]
    fn test_sanitize_file_base() {
        assert_eq!(
            sanitize_file_base("Premier League: Arsenal v Spurs (Live)"),
            "Premier_League_Arsenal_v_Spurs_Live"
        );
        assert_eq!(sanitize_file_base("A/B\\C|D"), "ABCD");
        assert_eq!(sanitize_file_base("  plain  "), "plain");
    }

    #[test]
    fn test_pad_channel() {
        assert_eq!(pad_channel("5"), "05");
        assert_eq!(pad_channel("15"), "15");
        assert_eq!(pad_channel(" 7 "), "07");
        assert_eq!(pad_channel("x"), "x");
    }

    #[test]
    fn test_parse_schedule_time_formats() {
        let expected = NaiveDate::from_ymd_opt(2024, 3, 2)
            .unwrap()
            .and_hms_opt(15, 0, 0)
            .unwrap();
        assert_eq!(parse_schedule_time("2024-03-02 15:00:00"), Some(expected));
        assert_eq!(parse_schedule_time("2024-03-02T15:00:00"), Some(expected));
        assert_eq!(parse_schedule_time("2024-03-02 15:00"), Some(expected));
        assert_eq!(parse_schedule_time("03/02/2024 15:00"), Some(expected));
        assert_eq!(parse_schedule_time("tomorrow"), None);
    }

    #[test]
    fn test_from_show_derives_times() {
        let show = create_test_show("5");
        let job = RecordingJob::from_show(&show, &create_test_match(10, 30), Duration::hours(-1))
            .expect("times parse");

        // 15:00 - 10 min pre-roll - 1h offset
        assert_eq!(job.start.format("%H:%M").to_string(), "13:50");
        // 17:00 + 30 min post-roll - 1h offset
        assert_eq!(job.end.format("%H:%M").to_string(), "16:30");
        assert_eq!(job.priority, 2);
        assert_eq!(job.channels.len(), 1);
        assert_eq!(job.channels[0].number, "05");
        assert_eq!(job.channels[0].description, "05 (720p/English)");
        assert!(job.flags.queued);
        assert_eq!(job.file_base, "Premier_League_Arsenal_v_Spurs202403021500");
        assert_eq!(job.preferences.quality, vec!["720p+".to_string()]);
    }

    #[test]
    fn test_from_show_falls_back_to_runtime() {
        let mut show = create_test_show("5");
        show.end_time = String::new();
        show.runtime = "90".to_string();
        let job = RecordingJob::from_show(&show, &create_test_match(0, 0), Duration::zero())
            .expect("runtime fallback");
        assert_eq!(job.duration(), Duration::minutes(90));
    }

    #[test]
    fn test_from_show_rejects_bad_times() {
        let mut show = create_test_show("5");
        show.time = "garbage".to_string();
        assert!(RecordingJob::from_show(&show, &create_test_match(0, 0), Duration::zero()).is_none());
    }

    #[test]
    fn test_update_from_show_grows_channel_set() {
        let first = create_test_show("5");
        let m = create_test_match(0, 0);
        let mut job = RecordingJob::from_show(&first, &m, Duration::zero()).unwrap();
        let id = job.id.clone();
        job.flags.dispatched = true;

        let mut again = create_test_show("12");
        again.category = "Football".to_string();
        assert!(job.update_from_show(&again, &m, Duration::zero()));

        assert_eq!(job.id, id);
        assert!(job.flags.dispatched);
        assert_eq!(job.category, "Football");
        let numbers: Vec<_> = job.channels.iter().map(|c| c.number.as_str()).collect();
        assert_eq!(numbers, vec!["05", "12"]);

        // Same channel again updates in place
        let mut hd = create_test_show("05");
        hd.quality = "1080p".to_string();
        job.update_from_show(&hd, &m, Duration::zero());
        assert_eq!(job.channels.len(), 2);
        assert_eq!(job.channels[0].quality, "1080p");
    }

    #[test]
    fn test_single_shot_job() {
        let start = Utc::now();
        let job = RecordingJob::single_shot(
            "my recording",
            &["1".to_string(), "22".to_string()],
            start,
            Duration::minutes(60),
        );
        assert_eq!(job.file_base, "my_recording");
        assert_eq!(job.end - job.start, Duration::minutes(60));
        assert_eq!(job.channels.len(), 2);
        assert_eq!(job.channels[0].number, "01");
    }

    #[test]
    fn test_flags_is_finished() {
        let mut flags = JobFlags::default();
        assert!(!flags.is_finished());
        flags.partial = true;
        assert!(flags.is_finished());
    }
}
