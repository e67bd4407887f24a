//! Fire-and-forget node lifecycle analytics.

use std::sync::Arc;

use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;

/// Node lifecycle events reported to the analytics collector.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum AnalyticsEvent {
    NodeConnected { node_id: String, model: String },
    NodeRejected { node_id: String, reason: String },
    NodeDisconnected { node_id: String },
    NodeEvicted { node_id: String, miss_streak: u32 },
}

#[derive(Debug, thiserror::Error)]
pub enum AnalyticsError {
    #[error("HTTP request failed: {0}")]
    RequestFailed(String),
    #[error("Collector returned {0}")]
    Rejected(String),
}

#[async_trait]
pub trait Analytics: Send + Sync {
    async fn track_event(&self, user_id: &str, event: AnalyticsEvent) -> Result<(), AnalyticsError>;
}

#[derive(Debug, Serialize)]
struct EventEnvelope<'a> {
    user_id: &'a str,
    timestamp: String,
    #[serde(flatten)]
    event: AnalyticsEvent,
}

/// Posts events as JSON to a collector endpoint.
pub struct HttpAnalytics {
    http_client: Client,
    url: String,
}

impl HttpAnalytics {
    pub fn new(url: &str) -> Self {
        Self {
            http_client: Client::new(),
            url: url.to_string(),
        }
    }
}

#[async_trait]
impl Analytics for HttpAnalytics {
    async fn track_event(&self, user_id: &str, event: AnalyticsEvent) -> Result<(), AnalyticsError> {
        let envelope = EventEnvelope {
            user_id,
            timestamp: chrono::Utc::now().to_rfc3339(),
            event,
        };

        let response = self
            .http_client
            .post(&self.url)
            .json(&envelope)
            .send()
            .await
            .map_err(|e| AnalyticsError::RequestFailed(e.to_string()))?;

        if !response.status().is_success() {
            return Err(AnalyticsError::Rejected(response.status().to_string()));
        }
        Ok(())
    }
}

/// Discards every event.
pub struct NoopAnalytics;

#[async_trait]
impl Analytics for NoopAnalytics {
    async fn track_event(&self, _user_id: &str, _event: AnalyticsEvent) -> Result<(), AnalyticsError> {
        Ok(())
    }
}

pub fn from_url(url: Option<&str>) -> Arc<dyn Analytics> {
    match url {
        Some(url) => {
            tracing::info!("Analytics enabled, posting to {}", url);
            Arc::new(HttpAnalytics::new(url))
        }
        None => Arc::new(NoopAnalytics),
    }
}

/// Report an event in the background; failures are only logged.
pub fn track(analytics: &Arc<dyn Analytics>, user_id: &str, event: AnalyticsEvent) {
    let analytics = analytics.clone();
    let user_id = user_id.to_string();
    tokio::spawn(async move {
        if let Err(e) = analytics.track_event(&user_id, event).await {
            tracing::warn!(user_id = %user_id, "Analytics event dropped: {}", e);
        }
    });
}
