//! Chat notifications for newly found images.

use std::sync::Arc;

use amibot_core::{release_message, ImageRecord};
use async_trait::async_trait;
use serde_json::json;
use thiserror::Error;
use tracing::{info, warn};

use crate::SideEffect;

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("chat request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("chat webhook returned {status}: {body}")]
    Status { status: u16, body: String },
}

#[async_trait]
pub trait ChatNotifier: Send + Sync {
    async fn post_message(&self, text: &str) -> Result<(), NotifyError>;
}

/// Slack incoming webhook.
#[derive(Debug, Clone)]
pub struct SlackWebhook {
    client: reqwest::Client,
    webhook_url: String,
}

impl SlackWebhook {
    pub fn new(client: reqwest::Client, webhook_url: impl Into<String>) -> Self {
        Self {
            client,
            webhook_url: webhook_url.into(),
        }
    }
}

#[async_trait]
impl ChatNotifier for SlackWebhook {
    async fn post_message(&self, text: &str) -> Result<(), NotifyError> {
        let resp = self
            .client
            .post(&self.webhook_url)
            .json(&json!({ "text": text }))
            .send()
            .await?;
        let status = resp.status();
        if status.is_success() {
            return Ok(());
        }
        let body = resp.text().await.unwrap_or_default();
        Err(NotifyError::Status {
            status: status.as_u16(),
            body,
        })
    }
}

/// Formats the release message and hands it to the configured notifier, if any.
/// Transport failures are reported in the returned [`SideEffect`], never raised.
#[derive(Clone, Default)]
pub struct NotificationDispatcher {
    notifier: Option<Arc<dyn ChatNotifier>>,
}

impl NotificationDispatcher {
    pub fn new(notifier: Arc<dyn ChatNotifier>) -> Self {
        Self {
            notifier: Some(notifier),
        }
    }

    pub fn disabled() -> Self {
        Self { notifier: None }
    }

    pub fn is_enabled(&self) -> bool {
        self.notifier.is_some()
    }

    pub async fn notify(&self, record: &ImageRecord) -> SideEffect {
        let Some(notifier) = &self.notifier else {
            return SideEffect::Disabled;
        };
        match notifier.post_message(&release_message(record)).await {
            Ok(()) => {
                info!(ami_id = %record.ami_id, "sent chat notification");
                SideEffect::Done
            }
            Err(err) => {
                warn!(ami_id = %record.ami_id, error = %err, "chat notification failed");
                SideEffect::Failed(err.to_string())
            }
        }
    }
}
