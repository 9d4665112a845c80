use async_trait::async_trait;
use reqwest::Client;
use std::time::Duration;
use uuid::Uuid;

use crate::models::job::GenerationJob;

/// Hand-off point to the excluded email/webhook subsystem. Every call is
/// best-effort: callers log delivery failures and move on; a notification
/// must never change a job's outcome.
#[async_trait]
pub trait NotificationSink: Send + Sync {
    /// Tell the account owner their generation failed, with a human-readable
    /// reason (never provider internals).
    async fn notify_failure(
        &self,
        account_id: Uuid,
        job: &GenerationJob,
        reason: &str,
    ) -> Result<(), NotifyError>;

    /// Warn the account owner they are about to exhaust their window.
    async fn notify_usage_warning(
        &self,
        account_id: Uuid,
        used: u32,
        limit: u32,
    ) -> Result<(), NotifyError>;
}

#[derive(Debug, thiserror::Error)]
pub enum NotifyError {
    #[error("webhook request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("webhook returned status {0}")]
    Status(u16),
}

/// Posts notification events to the notification subsystem's webhook.
pub struct WebhookNotifier {
    http: Client,
    endpoint: String,
}

impl WebhookNotifier {
    pub fn new(endpoint: &str) -> Result<Self, reqwest::Error> {
        let http = Client::builder().timeout(Duration::from_secs(10)).build()?;
        Ok(Self {
            http,
            endpoint: endpoint.to_string(),
        })
    }

    async fn post(&self, event: serde_json::Value) -> Result<(), NotifyError> {
        let response = self.http.post(&self.endpoint).json(&event).send().await?;

        if !response.status().is_success() {
            return Err(NotifyError::Status(response.status().as_u16()));
        }
        Ok(())
    }
}

#[async_trait]
impl NotificationSink for WebhookNotifier {
    async fn notify_failure(
        &self,
        account_id: Uuid,
        job: &GenerationJob,
        reason: &str,
    ) -> Result<(), NotifyError> {
        self.post(serde_json::json!({
            "event": "generation.failed",
            "accountId": account_id,
            "jobId": job.id,
            "prompt": job.prompt,
            "reason": reason,
            "retryCount": job.retry_count,
        }))
        .await
    }

    async fn notify_usage_warning(
        &self,
        account_id: Uuid,
        used: u32,
        limit: u32,
    ) -> Result<(), NotifyError> {
        self.post(serde_json::json!({
            "event": "usage.warning",
            "accountId": account_id,
            "used": used,
            "limit": limit,
        }))
        .await
    }
}

/// Log-only sink used when no webhook endpoint is configured.
pub struct LogNotifier;

#[async_trait]
impl NotificationSink for LogNotifier {
    async fn notify_failure(
        &self,
        account_id: Uuid,
        job: &GenerationJob,
        reason: &str,
    ) -> Result<(), NotifyError> {
        tracing::info!(
            account_id = %account_id,
            job_id = %job.id,
            reason,
            "Generation failure notification (no webhook configured)"
        );
        Ok(())
    }

    async fn notify_usage_warning(
        &self,
        account_id: Uuid,
        used: u32,
        limit: u32,
    ) -> Result<(), NotifyError> {
        tracing::info!(
            account_id = %account_id,
            used,
            limit,
            "Usage warning notification (no webhook configured)"
        );
        Ok(())
    }
}
