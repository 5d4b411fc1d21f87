//! Event delivery.

use crate::{AnalyticsEvent, OutboxError, OutboxResult};
use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;
use std::time::Duration;
use tracing::{debug, info};
use url::Url;

/// Delivers one event. A returned error counts as a failed attempt.
#[async_trait]
pub trait EventSender: Send + Sync {
    async fn send(&self, event: &AnalyticsEvent) -> OutboxResult<()>;
}

/// HTTP sender configuration.
#[derive(Debug, Clone)]
pub struct SenderConfig {
    /// Collector endpoint events are POSTed to.
    pub endpoint: Url,
    /// Bearer token, if the collector wants one.
    pub auth_token: Option<String>,
    /// Request timeout in seconds.
    pub timeout_secs: u64,
}

/// Request body for one event.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct EventPayload<'a> {
    event_id: &'a str,
    name: &'a str,
    payload: &'a serde_json::Value,
    timestamp: i64,
    retry_count: u32,
}

/// POSTs events as JSON to a collector.
pub struct HttpEventSender {
    config: SenderConfig,
    client: Client,
}

impl HttpEventSender {
    pub fn new(config: SenderConfig) -> OutboxResult<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self { config, client })
    }

    pub fn endpoint(&self) -> &Url {
        &self.config.endpoint
    }
}

#[async_trait]
impl EventSender for HttpEventSender {
    async fn send(&self, event: &AnalyticsEvent) -> OutboxResult<()> {
        let body = EventPayload {
            event_id: &event.id,
            name: &event.name,
            payload: &event.payload,
            timestamp: event.enqueued_at.timestamp_millis(),
            retry_count: event.retry_count,
        };

        debug!(url = %self.config.endpoint, event_id = %event.id, name = %event.name, "Sending event");

        let mut request = self.client.post(self.config.endpoint.clone()).json(&body);
        if let Some(token) = &self.config.auth_token {
            request = request.bearer_auth(token);
        }
        let response = request.send().await?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(OutboxError::Send(format!("HTTP {}: {}", status, text)));
        }
        Ok(())
    }
}

/// Writes events to the structured log. Used when no collector is configured.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSender;

#[async_trait]
impl EventSender for TracingSender {
    async fn send(&self, event: &AnalyticsEvent) -> OutboxResult<()> {
        info!(
            target: "karma::analytics",
            event_id = %event.id,
            name = %event.name,
            payload = %event.payload,
            "analytics event"
        );
        Ok(())
    }
}
