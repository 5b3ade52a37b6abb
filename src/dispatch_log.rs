use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use tracing::{info, instrument, warn};

use crate::db::{self, NewNotificationLog, Pool};
use crate::executor::RunSummary;
use crate::model::{DispatchStatus, RunStatus};

/// Persists dispatch outcomes and trigger run results.
#[derive(Debug, Clone)]
pub struct DispatchLogger {
    pool: Pool,
}

impl DispatchLogger {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    #[instrument(skip_all, fields(trigger = entry.trigger_key, entity_id = entry.entity_id))]
    pub async fn record_dispatch(&self, entry: &NewNotificationLog<'_>) -> Result<i64> {
        let id = db::insert_notification_log(&self.pool, entry)
            .await
            .context("failed to write notification log")?;
        match entry.status {
            DispatchStatus::Sent => {
                info!(log_id = id, recipient = entry.recipient_id, "notification sent")
            }
            DispatchStatus::Skipped => info!(
                log_id = id,
                recipient = entry.recipient_id,
                reason = entry.error.unwrap_or_default(),
                "notification skipped"
            ),
            DispatchStatus::Failed => warn!(
                log_id = id,
                recipient = entry.recipient_id,
                error = entry.error.unwrap_or_default(),
                "notification failed"
            ),
        }
        Ok(id)
    }

    #[instrument(skip_all, fields(trigger = summary.trigger))]
    pub async fn record_run(&self, summary: &RunSummary, at: DateTime<Utc>) -> Result<()> {
        let status = if summary.failed > 0 || summary.unlogged > 0 {
            RunStatus::Partial
        } else {
            RunStatus::Success
        };
        let value = serde_json::to_value(summary.counts()).context("failed to encode summary")?;
        db::record_trigger_run(&self.pool, &summary.trigger, status.as_str(), &value, at).await
    }

    #[instrument(skip_all, fields(trigger = key))]
    pub async fn record_run_error(&self, key: &str, error: &str, at: DateTime<Utc>) -> Result<()> {
        let value = serde_json::json!({ "error": error });
        db::record_trigger_run(&self.pool, key, RunStatus::Error.as_str(), &value, at).await
    }
}
