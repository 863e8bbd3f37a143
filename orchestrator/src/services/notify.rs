//! Notification sinks
//!
//! Notifications are best-effort: sinks log delivery failures and never
//! report them to the caller.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::errors::PilotError;

/// Severity of a user notification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum NotificationLevel {
    Info,
    Success,
    Warning,
    Error,
}

/// A message for the owner of a record
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Notification {
    pub owner_id: String,
    pub record_id: String,
    pub level: NotificationLevel,
    pub title: String,
    pub message: String,
}

impl Notification {
    pub fn new(
        owner_id: &str,
        record_id: &str,
        level: NotificationLevel,
        title: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            owner_id: owner_id.to_string(),
            record_id: record_id.to_string(),
            level,
            title: title.into(),
            message: message.into(),
        }
    }
}

#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn notify(&self, notification: Notification);
}

/// Writes notifications to the tracing log
#[derive(Debug, Default)]
pub struct LogSink;

#[async_trait]
impl NotificationSink for LogSink {
    async fn notify(&self, notification: Notification) {
        info!(
            owner_id = %notification.owner_id,
            record_id = %notification.record_id,
            level = ?notification.level,
            "{}: {}",
            notification.title,
            notification.message
        );
    }
}

/// Posts notifications as JSON to a webhook
pub struct WebhookSink {
    client: Client,
    url: String,
}

impl WebhookSink {
    pub fn new(url: &str) -> Result<Self, PilotError> {
        let client = Client::builder().timeout(Duration::from_secs(10)).build()?;
        Ok(Self {
            client,
            url: url.to_string(),
        })
    }
}

#[async_trait]
impl NotificationSink for WebhookSink {
    async fn notify(&self, notification: Notification) {
        debug!("POST {} (notification)", self.url);
        match self.client.post(&self.url).json(&notification).send().await {
            Ok(response) if response.status().is_success() => {}
            Ok(response) => {
                warn!(
                    "Notification webhook returned {} for record {}",
                    response.status(),
                    notification.record_id
                );
            }
            Err(e) => {
                warn!("Failed to deliver notification for {}: {}", notification.record_id, e);
            }
        }
    }
}
