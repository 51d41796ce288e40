//! Outbound automation webhook.

use std::time::Duration;

use chrono::Utc;
use serde_json::{json, Value};
use thiserror::Error;

use crate::config::WebhookConfig;

#[derive(Debug, Error)]
pub enum WebhookError {
    #[error("webhook request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("webhook responded with status {0}")]
    Status(u16),
}

/// Result of one emit attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Delivery {
    Sent { status: u16 },
    /// No URL configured; nothing was sent.
    Skipped,
}

/// Posts `{eventType, payload, timestamp}` to the configured URL with the
/// shared secret in a header.
#[derive(Clone)]
pub struct WebhookClient {
    client: reqwest::Client,
    url: Option<String>,
    secret: Option<String>,
    secret_header: String,
}

impl std::fmt::Debug for WebhookClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebhookClient")
            .field("url", &self.url)
            .field("secret", &self.secret.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

impl WebhookClient {
    pub fn new(config: &WebhookConfig) -> Result<Self, WebhookError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self {
            client,
            url: config.url.clone(),
            secret: config.secret.clone(),
            secret_header: config.secret_header.clone(),
        })
    }

    pub fn is_configured(&self) -> bool {
        self.url.is_some()
    }

    pub async fn emit(&self, event_type: &str, payload: Value) -> Result<Delivery, WebhookError> {
        let Some(url) = &self.url else {
            tracing::warn!(event_type, "webhook URL not configured; event skipped");
            return Ok(Delivery::Skipped);
        };

        let body = json!({
            "eventType": event_type,
            "payload": payload,
            "timestamp": Utc::now().to_rfc3339(),
        });
        let mut request = self.client.post(url).json(&body);
        if let Some(secret) = &self.secret {
            request = request.header(self.secret_header.as_str(), secret.as_str());
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            tracing::warn!(event_type, status = status.as_u16(), "webhook rejected event");
            return Err(WebhookError::Status(status.as_u16()));
        }
        tracing::info!(event_type, status = status.as_u16(), "webhook event delivered");
        Ok(Delivery::Sent {
            status: status.as_u16(),
        })
    }
}
