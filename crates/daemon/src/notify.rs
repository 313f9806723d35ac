//! Operator notifications.
//!
//! Delivery is best effort: failures are logged and never reach the caller.

use crate::jobs::RecordingJob;
use async_trait::async_trait;
use serde::Serialize;
use std::time::Duration;
use tracing::{info, warn};

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send(&self, subject: &str, body: &str);
}

/// Writes notifications to the log.
#[derive(Debug, Clone, Default)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn send(&self, subject: &str, body: &str) {
        info!(target: "stream_capture::notify", %subject, "{}", body);
    }
}

#[derive(Debug, Serialize)]
struct WebhookPayload<'a> {
    subject: &'a str,
    body: &'a str,
}

/// POSTs `{subject, body}` JSON to a webhook.
#[derive(Debug, Clone)]
pub struct WebhookNotifier {
    client: reqwest::Client,
    url: String,
}

impl WebhookNotifier {
    pub fn new(client: reqwest::Client, url: String) -> Self {
        Self { client, url }
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn send(&self, subject: &str, body: &str) {
        let result = self
            .client
            .post(&self.url)
            .timeout(Duration::from_secs(15))
            .json(&WebhookPayload { subject, body })
            .send()
            .await;
        match result {
            Ok(response) if response.status().is_success() => {}
            Ok(response) => warn!(status = %response.status(), %subject, "Webhook rejected notification"),
            Err(e) => warn!(error = %e, %subject, "Failed to deliver notification"),
        }
    }
}

/// Body of the "new shows scheduled" notification.
pub fn scheduled_summary(jobs: &[RecordingJob]) -> String {
    jobs.iter()
        .map(|job| {
            let channels = job
                .channels
                .iter()
                .map(|c| c.description.trim())
                .collect::<Vec<_>>()
                .join(", ");
            format!(
                "{} | {} - {} | keyword: {} | channels: {}",
                job.description,
                job.start.format("%Y-%m-%d %H:%M"),
                job.end.format("%H:%M"),
                job.keyword,
                channels
            )
        })
        .collect::<Vec<_>>()
        .join("\n")
}
