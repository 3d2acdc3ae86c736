//! Alert delivery sinks.
//!
//! The notifier contract is a single rendered string; HTML-lite markup is
//! allowed. With no webhook configured, notifications go to the log.

use async_trait::async_trait;
use dozor_remedy::Notifier;
use std::time::Duration;
use tracing::{info, warn};

/// POSTs the rendered notification as JSON to the configured webhook.
pub struct WebhookNotifier {
    client: reqwest::Client,
    url: String,
}

impl WebhookNotifier {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            url: url.into(),
        }
    }
}

/// The webhook payload shape.
pub fn webhook_payload(message: &str) -> serde_json::Value {
    serde_json::json!({ "text": message })
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn notify(&self, message: &str) {
        let result = self
            .client
            .post(&self.url)
            .timeout(Duration::from_secs(10))
            .json(&webhook_payload(message))
            .send()
            .await;
        match result {
            Ok(response) if response.status().is_success() => {
                info!(subsystem = "notify", "webhook delivered");
            }
            Ok(response) => {
                warn!(subsystem = "notify", status = %response.status(), "webhook rejected");
            }
            Err(e) => {
                warn!(subsystem = "notify", error = %e, "webhook delivery failed");
            }
        }
    }
}

/// Fallback sink: notifications become log records.
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, message: &str) {
        info!(subsystem = "notify", notification = message, "alert");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payload_wraps_text() {
        let payload = webhook_payload("<b>dozor alerts</b>\n[CRITICAL] db");
        assert_eq!(payload["text"], "<b>dozor alerts</b>\n[CRITICAL] db");
    }
}
