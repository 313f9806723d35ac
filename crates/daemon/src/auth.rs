//! Stream authentication.

use async_trait::async_trait;
use serde_json::Value;
use std::time::{Duration, Instant};
use stream_capture_config::AuthConfig;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("Authentication request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("Authentication endpoint returned status {0}")]
    Status(u16),

    #[error("Authentication response has no usable hash")]
    MissingHash,
}

/// Supplies session tokens for stream URLs.
#[async_trait]
pub trait AuthProvider: Send + Sync {
    async fn get_token(&self) -> Result<String, AuthError>;
}

/// Fill the `[USERNAME]` and `[PASSWORD]` placeholders of the auth URL.
pub fn build_auth_url(template: &str, user: &str, pass: &str) -> String {
    template.replace("[USERNAME]", user).replace("[PASSWORD]", pass)
}

/// First non-empty string `hash` field anywhere in a JSON document.
pub fn extract_hash(body: &str) -> Result<String, AuthError> {
    let value: Value = serde_json::from_str(body).map_err(|_| AuthError::MissingHash)?;
    find_hash(&value).ok_or(AuthError::MissingHash)
}

fn find_hash(value: &Value) -> Option<String> {
    match value {
        Value::Object(map) => {
            if let Some(Value::String(hash)) = map.get("hash") {
                if !hash.is_empty() {
                    return Some(hash.clone());
                }
            }
            map.values().find_map(find_hash)
        }
        Value::Array(items) => items.iter().find_map(find_hash),
        _ => None,
    }
}

/// Fetches tokens from an HTTP endpoint returning JSON with a `hash` field.
#[derive(Debug, Clone)]
pub struct HttpAuthProvider {
    client: reqwest::Client,
    url: String,
}

impl HttpAuthProvider {
    pub fn new(client: reqwest::Client, config: &AuthConfig) -> Self {
        Self {
            client,
            url: build_auth_url(&config.url, &config.user, &config.pass),
        }
    }
}

#[async_trait]
impl AuthProvider for HttpAuthProvider {
    async fn get_token(&self) -> Result<String, AuthError> {
        let response = self
            .client
            .get(&self.url)
            .timeout(Duration::from_secs(30))
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(AuthError::Status(response.status().as_u16()));
        }
        let body = response.text().await?;
        extract_hash(&body)
    }
}

/// A token and when it was obtained.
#[derive(Debug, Clone)]
pub struct AuthSession {
    pub token: String,
    obtained_at: Instant,
}

impl AuthSession {
    pub fn new(token: String) -> Self {
        Self {
            token,
            obtained_at: Instant::now(),
        }
    }

    pub fn age(&self) -> Duration {
        self.obtained_at.elapsed()
    }

    pub fn is_expired(&self, validity: Duration) -> bool {
        self.age() > validity
    }
}
