//! Scheduled-run health records and the monitoring read path.
use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use tracing::instrument;

use crate::config::Monitoring;
use crate::db::{self, Pool};
use crate::model::CronHealthRecord;

/// Consecutive failed runs that count as a repeated failure.
const REPEATED_FAILURE_RUNS: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueKind {
    NoRuns,
    Delayed,
    LastRunFailed,
    RepeatedFailures,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Warning,
    Critical,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HealthIssue {
    pub kind: IssueKind,
    pub severity: Severity,
    pub message: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct MonitoringSummary {
    pub healthy: bool,
    pub last_run: Option<CronHealthRecord>,
    pub minutes_since_last_run: Option<i64>,
    pub recent_runs: Vec<CronHealthRecord>,
    pub issues: Vec<HealthIssue>,
}

/// Derive issues from health records ordered newest first.
pub fn compute_issues(
    records: &[CronHealthRecord],
    now: DateTime<Utc>,
    stale_after_minutes: i64,
) -> Vec<HealthIssue> {
    let Some(last) = records.first() else {
        return vec![HealthIssue {
            kind: IssueKind::NoRuns,
            severity: Severity::Critical,
            message: "trigger processing has never run".to_string(),
        }];
    };

    let mut issues = Vec::new();
    let age = now - last.ran_at;
    if age > Duration::minutes(stale_after_minutes) {
        issues.push(HealthIssue {
            kind: IssueKind::Delayed,
            severity: Severity::Warning,
            message: format!(
                "last run was {} minutes ago (expected every {} minutes)",
                age.num_minutes(),
                stale_after_minutes
            ),
        });
    }

    if !last.success {
        issues.push(HealthIssue {
            kind: IssueKind::LastRunFailed,
            severity: Severity::Critical,
            message: match &last.error {
                Some(err) => format!("last run failed: {}", err),
                None => "last run failed".to_string(),
            },
        });
    }

    let recent = &records[..records.len().min(REPEATED_FAILURE_RUNS)];
    if recent.len() == REPEATED_FAILURE_RUNS && recent.iter().all(|r| !r.success) {
        issues.push(HealthIssue {
            kind: IssueKind::RepeatedFailures,
            severity: Severity::Critical,
            message: format!("the last {} runs failed", REPEATED_FAILURE_RUNS),
        });
    }

    issues
}

#[instrument(skip_all)]
pub async fn monitoring_summary(
    pool: &Pool,
    monitoring: &Monitoring,
    now: DateTime<Utc>,
) -> Result<MonitoringSummary> {
    let recent_runs = db::recent_cron_health(pool, monitoring.recent_runs).await?;
    let issues = compute_issues(&recent_runs, now, monitoring.stale_after_minutes);
    let last_run = recent_runs.first().cloned();
    Ok(MonitoringSummary {
        healthy: issues.is_empty(),
        minutes_since_last_run: last_run.as_ref().map(|r| (now - r.ran_at).num_minutes()),
        last_run,
        recent_runs,
        issues,
    })
}
