use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{error, info, instrument, warn};

use crate::alerts::AlertNotifier;
use crate::config::Monitoring;
use crate::db::{self, Pool};
use crate::executor::{RunCounts, TriggerExecutor};
use crate::health::{self, HealthIssue, IssueKind, Severity};
use crate::triggers;

#[derive(Debug, Clone, Serialize)]
pub struct CampaignResult {
    pub trigger: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub counts: Option<RunCounts>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ScheduledRunReport {
    pub ran_at: DateTime<Utc>,
    pub success: bool,
    pub triggers_evaluated: i64,
    pub campaigns_processed: i64,
    pub campaigns: Vec<CampaignResult>,
    pub health_record_id: i64,
}

/// One scheduled pass: run every campaign, persist a health record, alert on failure.
#[instrument(skip_all)]
pub async fn run_scheduled(
    executor: &TriggerExecutor,
    pool: &Pool,
    monitoring: &Monitoring,
    alerts: Option<&AlertNotifier>,
    now: DateTime<Utc>,
) -> Result<ScheduledRunReport> {
    let mut campaigns = Vec::new();
    let mut processed = 0i64;
    for def in triggers::definitions() {
        match executor.run_trigger_at(def.key.as_str(), None, now).await {
            Ok(summary) => {
                processed += 1;
                campaigns.push(CampaignResult {
                    trigger: summary.trigger.clone(),
                    counts: Some(summary.counts()),
                    error: None,
                });
            }
            Err(err) => {
                error!(trigger = def.key.as_str(), %err, "campaign failed");
                campaigns.push(CampaignResult {
                    trigger: def.key.as_str().to_string(),
                    counts: None,
                    error: Some(err.to_string()),
                });
            }
        }
    }

    let evaluated = triggers::definitions().len() as i64;
    let success = processed == evaluated;
    let error_detail = (!success).then(|| {
        campaigns
            .iter()
            .filter_map(|c| c.error.as_ref().map(|e| format!("{}: {}", c.trigger, e)))
            .collect::<Vec<_>>()
            .join("; ")
    });

    let health_record_id = match db::insert_cron_health(
        pool,
        now,
        success,
        evaluated,
        processed,
        error_detail.as_deref(),
    )
    .await
    {
        Ok(id) => id,
        Err(err) => {
            error!(?err, "failed to record cron health");
            // Monitoring cannot see this run, so the alert carries the cause.
            if let Some(alerts) = alerts {
                let issue = HealthIssue {
                    kind: IssueKind::LastRunFailed,
                    severity: Severity::Critical,
                    message: format!(
                        "cron health could not be recorded: {:#}; campaigns: {}",
                        err,
                        error_detail.as_deref().unwrap_or("all processed")
                    ),
                };
                if let Err(alert_err) = alerts
                    .send("scheduled trigger run could not be recorded", &[issue])
                    .await
                {
                    warn!(?alert_err, "failed to deliver alert");
                }
            }
            return Err(err.context("failed to record cron health"));
        }
    };
    info!(success, evaluated, processed, "scheduled trigger run recorded");

    if !success {
        if let Some(alerts) = alerts {
            let issues = match health::monitoring_summary(pool, monitoring, now).await {
                Ok(summary) => summary.issues,
                Err(err) => {
                    warn!(?err, "failed to compute monitoring issues for alert");
                    Vec::<HealthIssue>::new()
                }
            };
            if let Err(err) = alerts.send("scheduled trigger run failed", &issues).await {
                warn!(?err, "failed to deliver alert");
            }
        }
    }

    Ok(ScheduledRunReport {
        ran_at: now,
        success,
        triggers_evaluated: evaluated,
        campaigns_processed: processed,
        campaigns,
        health_record_id,
    })
}
