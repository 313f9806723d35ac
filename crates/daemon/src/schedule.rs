//! Schedule feed access.
//!
//! The feed is a JSON object mapping channel ids to `{ "items": [...] }`
//! listings. Every field is a string in the feed; missing or null fields
//! become empty strings.

use crate::jobs::ShowCandidate;
use async_trait::async_trait;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;
use stream_capture_config::ScheduleConfig;
use thiserror::Error;
use tracing::warn;

#[derive(Debug, Error)]
pub enum ScheduleError {
    #[error("Schedule request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("Schedule endpoint returned status {0}")]
    Status(u16),

    #[error("Failed to read schedule file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse schedule: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("No schedule source configured")]
    NotConfigured,
}

/// Source of upcoming shows.
#[async_trait]
pub trait ScheduleSource: Send + Sync {
    async fn fetch(&self) -> Result<Vec<ShowCandidate>, ScheduleError>;
}

#[derive(Debug, Deserialize)]
struct FeedChannel {
    #[serde(default)]
    items: Option<Vec<FeedItem>>,
}

#[derive(Debug, Default, Deserialize)]
struct FeedItem {
    id: Option<String>,
    name: Option<String>,
    channel: Option<String>,
    quality: Option<String>,
    language: Option<String>,
    category: Option<String>,
    time: Option<String>,
    end_time: Option<String>,
    runtime: Option<String>,
}

impl From<FeedItem> for ShowCandidate {
    fn from(item: FeedItem) -> Self {
        Self {
            id: item.id.unwrap_or_default(),
            name: item.name.unwrap_or_default(),
            channel: item.channel.unwrap_or_default(),
            quality: item.quality.unwrap_or_default(),
            language: item.language.unwrap_or_default(),
            category: item.category.unwrap_or_default(),
            time: item.time.unwrap_or_default(),
            end_time: item.end_time.unwrap_or_default(),
            runtime: item.runtime.unwrap_or_default(),
        }
    }
}

/// Flatten a feed document into show candidates.
pub fn parse_feed(json: &str) -> Result<Vec<ShowCandidate>, ScheduleError> {
    let channels: BTreeMap<String, FeedChannel> = serde_json::from_str(json)?;
    Ok(channels
        .into_values()
        .flat_map(|c| c.items.unwrap_or_default())
        .map(ShowCandidate::from)
        .collect())
}

/// Where the feed comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FeedLocation {
    Url(String),
    /// Local copy, used when debugging
    File(PathBuf),
}

/// Reads the JSON schedule feed.
#[derive(Debug, Clone)]
pub struct JsonFeedSource {
    client: reqwest::Client,
    location: FeedLocation,
}

impl JsonFeedSource {
    pub fn new(client: reqwest::Client, location: FeedLocation) -> Self {
        Self { client, location }
    }

    /// A local file takes precedence over the URL.
    pub fn from_config(client: reqwest::Client, config: &ScheduleConfig) -> Result<Self, ScheduleError> {
        let location = match (&config.file, &config.url) {
            (Some(file), _) => FeedLocation::File(file.clone()),
            (None, Some(url)) => FeedLocation::Url(url.clone()),
            (None, None) => return Err(ScheduleError::NotConfigured),
        };
        Ok(Self::new(client, location))
    }
}

#[async_trait]
impl ScheduleSource for JsonFeedSource {
    async fn fetch(&self) -> Result<Vec<ShowCandidate>, ScheduleError> {
        let body = match &self.location {
            FeedLocation::File(path) => tokio::fs::read_to_string(path).await?,
            FeedLocation::Url(url) => {
                let response = self
                    .client
                    .get(url)
                    .timeout(Duration::from_secs(60))
                    .send()
                    .await?;
                if !response.status().is_success() {
                    return Err(ScheduleError::Status(response.status().as_u16()));
                }
                response.text().await?
            }
        };
        parse_feed(&body)
    }
}

/// Fetch with a bounded number of attempts and a fixed delay between them.
///
/// Returns the last error once `attempts` are used up.
pub async fn fetch_with_retry(
    source: &dyn ScheduleSource,
    attempts: u32,
    delay: Duration,
) -> Result<Vec<ShowCandidate>, ScheduleError> {
    let attempts = attempts.max(1);
    let mut attempt = 1;
    loop {
        match source.fetch().await {
            Ok(shows) => return Ok(shows),
            Err(e) if attempt < attempts => {
                warn!(attempt, attempts, error = %e, "Schedule fetch failed, retrying");
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    const FEED: &str = r#"{
        "101": {
            "channel_id": "101",
            "name": "Sports 1",
            "items": [
                {
                    "id": "1", "name": "Cup Final", "channel": "5", "quality": "720p",
                    "language": "English", "category": "Soccer",
                    "time": "2024-03-02 15:00:00", "end_time": "2024-03-02 17:00:00",
                    "runtime": "120", "network_id": "9"
                }
            ]
        },
        "102": { "items": null },
        "103": { "items": [ { "name": "Late Show", "time": "2024-03-02 23:00:00", "quality": null } ] }
    }"#;

    struct FlakySource {
        failures: u32,
        calls: AtomicU32,
    }

    #[async_trait]
    impl ScheduleSource for FlakySource {
        async fn fetch(&self) -> Result<Vec<ShowCandidate>, ScheduleError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.failures {
                Err(ScheduleError::Status(503))
            } else {
                Ok(vec![ShowCandidate::default()])
            }
        }
    }

    #[test]
    fn test_parse_feed() {
        let shows = parse_feed(FEED).unwrap();
        assert_eq!(shows.len(), 2);
        let cup = shows.iter().find(|s| s.name == "Cup Final").unwrap();
        assert_eq!(cup.channel, "5");
        assert_eq!(cup.end_time, "2024-03-02 17:00:00");
        let late = shows.iter().find(|s| s.name == "Late Show").unwrap();
        assert_eq!(late.quality, "");
    }

    #[test]
    fn test_parse_feed_rejects_garbage() {
        assert!(matches!(parse_feed("[1,2"), Err(ScheduleError::Parse(_))));
    }

    #[tokio::test]
    async fn test_file_source() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("feed.json");
        std::fs::write(&path, FEED).unwrap();
        let source = JsonFeedSource::new(reqwest::Client::new(), FeedLocation::File(path));
        assert_eq!(source.fetch().await.unwrap().len(), 2);
    }

    #[test]
    fn test_from_config_prefers_file() {
        let config = ScheduleConfig {
            url: Some("https://x".into()),
            file: Some(PathBuf::from("feed.json")),
            ..ScheduleConfig::default()
        };
        let source = JsonFeedSource::from_config(reqwest::Client::new(), &config).unwrap();
        assert_eq!(source.location, FeedLocation::File(PathBuf::from("feed.json")));

        let empty = ScheduleConfig::default();
        assert!(JsonFeedSource::from_config(reqwest::Client::new(), &empty).is_err());
    }

    #[tokio::test]
    async fn test_fetch_with_retry_recovers() {
        let source = FlakySource { failures: 2, calls: AtomicU32::new(0) };
        let shows = fetch_with_retry(&source, 3, Duration::from_millis(1)).await.unwrap();
        assert_eq!(shows.len(), 1);
        assert_eq!(source.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_fetch_with_retry_gives_up() {
        let source = FlakySource { failures: 10, calls: AtomicU32::new(0) };
        let result = fetch_with_retry(&source, 3, Duration::from_millis(1)).await;
        assert!(matches!(result, Err(ScheduleError::Status(503))));
        assert_eq!(source.calls.load(Ordering::SeqCst), 3);
    }
}
