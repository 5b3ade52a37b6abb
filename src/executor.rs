//! Trigger and campaign execution.
//!
//! A run resolves the trigger, picks its targets and walks them one at a time:
//! eligibility, rate limit, compose, dispatch, log. Per-target problems end up
//! in the [`RunSummary`]; only an unknown key or an unreachable database when
//! selecting targets abort the run.
use anyhow::{anyhow, Result};
use chrono::{DateTime, Duration, Utc};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{error, info, instrument, warn};

use crate::db::{self, NewNotificationLog, Pool};
use crate::dispatch_log::DispatchLogger;
use crate::eligibility::{Eligibility, EligibilityEvaluator};
use crate::error::NotifyError;
use crate::model::{DispatchStatus, ReferralStatus};
use crate::push::{PushMessage, PushSender};
use crate::ratelimit::{RateDecision, RateLimiter};
use crate::triggers::{self, ComposedMessage, Target, TriggerDefinition, TriggerKey};

/// Optional body of a trigger invocation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunPayload {
    #[serde(default)]
    pub entity_id: Option<String>,
}

impl RunPayload {
    pub fn for_entity(entity_id: impl Into<String>) -> Self {
        Self {
            entity_id: Some(entity_id.into()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeKind {
    Sent,
    /// Delivered, but the `sent` row could not be written; a later run may resend.
    SentUnlogged,
    AlreadyNotified,
    EntityNotFound,
    PreconditionFailed,
    RateLimited,
    Failed,
}

#[derive(Debug, Clone, Serialize)]
pub struct TargetOutcome {
    pub entity_id: String,
    pub recipient_id: Option<String>,
    pub outcome: OutcomeKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RunCounts {
    pub targets: usize,
    pub sent: usize,
    pub skipped_ineligible: usize,
    pub skipped_rate_limited: usize,
    pub failed: usize,
    pub unlogged: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub trigger: String,
    pub targets: usize,
    pub sent: usize,
    pub skipped_ineligible: usize,
    pub skipped_rate_limited: usize,
    pub failed: usize,
    /// Sent targets whose log row is missing.
    pub unlogged: usize,
    pub outcomes: Vec<TargetOutcome>,
}

impl RunSummary {
    fn new(trigger: &str) -> Self {
        Self {
            trigger: trigger.to_string(),
            targets: 0,
            sent: 0,
            skipped_ineligible: 0,
            skipped_rate_limited: 0,
            failed: 0,
            unlogged: 0,
            outcomes: Vec::new(),
        }
    }

    fn push(&mut self, outcome: TargetOutcome) {
        self.targets += 1;
        match outcome.outcome {
            OutcomeKind::Sent => self.sent += 1,
            OutcomeKind::SentUnlogged => {
                self.sent += 1;
                self.unlogged += 1;
            }
            OutcomeKind::AlreadyNotified
            | OutcomeKind::EntityNotFound
            | OutcomeKind::PreconditionFailed => self.skipped_ineligible += 1,
            OutcomeKind::RateLimited => self.skipped_rate_limited += 1,
            OutcomeKind::Failed => self.failed += 1,
        }
        self.outcomes.push(outcome);
    }

    pub fn counts(&self) -> RunCounts {
        RunCounts {
            targets: self.targets,
            sent: self.sent,
            skipped_ineligible: self.skipped_ineligible,
            skipped_rate_limited: self.skipped_rate_limited,
            failed: self.failed,
            unlogged: self.unlogged,
        }
    }
}

/// Orchestrates trigger runs. Collaborators are injected by the entry point.
#[derive(Clone)]
pub struct TriggerExecutor {
    pool: Pool,
    evaluator: EligibilityEvaluator,
    limiter: RateLimiter,
    push: Arc<dyn PushSender>,
    logger: DispatchLogger,
}

impl TriggerExecutor {
    pub fn new(
        pool: Pool,
        evaluator: EligibilityEvaluator,
        limiter: RateLimiter,
        push: Arc<dyn PushSender>,
    ) -> Self {
        let logger = DispatchLogger::new(pool.clone());
        Self {
            pool,
            evaluator,
            limiter,
            push,
            logger,
        }
    }

    pub async fn run_trigger(
        &self,
        key: &str,
        payload: Option<RunPayload>,
    ) -> Result<RunSummary, NotifyError> {
        self.run_trigger_at(key, payload, Utc::now()).await
    }

    #[instrument(skip(self, payload, now))]
    pub async fn run_trigger_at(
        &self,
        key: &str,
        payload: Option<RunPayload>,
        now: DateTime<Utc>,
    ) -> Result<RunSummary, NotifyError> {
        let def = triggers::resolve(key)?;

        let explicit = payload.and_then(|p| p.entity_id);
        let targets = match explicit {
            Some(id) if id.trim().is_empty() => {
                return Err(NotifyError::Validation("entity_id must be non-empty".into()));
            }
            Some(id) => vec![id],
            None => match self.select_targets(def, now).await {
                Ok(ids) => ids,
                Err(err) => {
                    error!(?err, "failed to select campaign targets");
                    if let Err(log_err) = self
                        .logger
                        .record_run_error(def.key.as_str(), &format!("{:#}", err), now)
                        .await
                    {
                        warn!(?log_err, "failed to record trigger run error");
                    }
                    return Err(NotifyError::Infrastructure(err));
                }
            },
        };

        info!(targets = targets.len(), "running trigger");
        let mut summary = RunSummary::new(def.key.as_str());
        for entity_id in targets {
            let outcome = match self.process_target(def, &entity_id, now).await {
                Ok(outcome) => outcome,
                Err(err) => {
                    warn!(?err, entity_id = %entity_id, "target processing failed");
                    TargetOutcome {
                        entity_id,
                        recipient_id: None,
                        outcome: OutcomeKind::Failed,
                        detail: Some(format!("{:#}", err)),
                    }
                }
            };
            summary.push(outcome);
        }

        if let Err(err) = self.logger.record_run(&summary, now).await {
            warn!(?err, "failed to record trigger run");
        }
        info!(
            sent = summary.sent,
            skipped_ineligible = summary.skipped_ineligible,
            skipped_rate_limited = summary.skipped_rate_limited,
            failed = summary.failed,
            unlogged = summary.unlogged,
            "trigger run finished"
        );
        Ok(summary)
    }

    /// Batch target rule for each trigger. Already-notified rows are filtered
    /// in SQL; the evaluator re-checks them per target.
    async fn select_targets(
        &self,
        def: &TriggerDefinition,
        now: DateTime<Utc>,
    ) -> Result<Vec<String>> {
        let key = def.key.as_str();
        match def.key {
            TriggerKey::ReferralInvited => {
                db::unnotified_referrals_with_status(&self.pool, ReferralStatus::Invited, key).await
            }
            TriggerKey::ReferralVerified => db::unnotified_verified_referrals(&self.pool, key).await,
            TriggerKey::SmartPlanUnlocked => {
                let threshold = self.evaluator.campaigns().smart_plan_threshold;
                db::unnotified_smart_plan_candidates(&self.pool, threshold, key).await
            }
            TriggerKey::DebtDueReminder => {
                let today = now.date_naive();
                let horizon = today + Duration::days(self.evaluator.campaigns().debt_reminder_days);
                db::unnotified_debts_due_between(&self.pool, today, horizon, key).await
            }
        }
    }

    #[instrument(skip(self, def, now), fields(trigger = def.key.as_str()))]
    async fn process_target(
        &self,
        def: &TriggerDefinition,
        entity_id: &str,
        now: DateTime<Utc>,
    ) -> Result<TargetOutcome> {
        let skipped = |outcome: OutcomeKind, detail: Option<String>| TargetOutcome {
            entity_id: entity_id.to_string(),
            recipient_id: None,
            outcome,
            detail,
        };

        let target = match self
            .evaluator
            .evaluate(def, entity_id, now.date_naive())
            .await?
        {
            Eligibility::Eligible(target) => target,
            Eligibility::AlreadyNotified => return Ok(skipped(OutcomeKind::AlreadyNotified, None)),
            Eligibility::EntityNotFound => return Ok(skipped(OutcomeKind::EntityNotFound, None)),
            Eligibility::PreconditionFailed(reason) => {
                return Ok(skipped(OutcomeKind::PreconditionFailed, Some(reason)))
            }
        };

        let recipient = target.recipient_id().to_string();
        let message = triggers::compose(def, &target);

        if let RateDecision::Blocked {
            window,
            limit,
            reset_at,
            ..
        } = self.limiter.check_at(def.category, &recipient, now).await
        {
            let detail = format!(
                "rate limited: {}/{} window, resets at {}",
                limit,
                window,
                reset_at.to_rfc3339()
            );
            self.log(def, &target, &message, DispatchStatus::Skipped, Some(&detail), now)
                .await;
            return Ok(TargetOutcome {
                entity_id: entity_id.to_string(),
                recipient_id: Some(recipient),
                outcome: OutcomeKind::RateLimited,
                detail: Some(detail),
            });
        }

        let (status, detail) = match self.dispatch(&recipient, &message).await {
            Ok(()) => (DispatchStatus::Sent, None),
            Err(err) => (DispatchStatus::Failed, Some(format!("{:#}", err))),
        };
        let log_error = self
            .log(def, &target, &message, status, detail.as_deref(), now)
            .await;

        let (outcome, detail) = match (status, log_error) {
            (DispatchStatus::Sent, None) => (OutcomeKind::Sent, None),
            (DispatchStatus::Sent, Some(err)) => (
                OutcomeKind::SentUnlogged,
                Some(format!("delivered but not logged: {}", err)),
            ),
            _ => (OutcomeKind::Failed, detail),
        };
        Ok(TargetOutcome {
            entity_id: entity_id.to_string(),
            recipient_id: Some(recipient),
            outcome,
            detail,
        })
    }

    /// Deliver to every registered device; one accepted delivery counts as sent.
    async fn dispatch(&self, recipient: &str, message: &ComposedMessage) -> Result<()> {
        let tokens = db::push_tokens_for_user(&self.pool, recipient).await?;
        if tokens.is_empty() {
            return Err(anyhow!("no registered device for user {}", recipient));
        }

        let messages: Vec<PushMessage> = tokens
            .into_iter()
            .map(|token| PushMessage {
                token,
                title: message.title.clone(),
                body: message.body.clone(),
                data: message.data.clone(),
            })
            .collect();
        let results = join_all(messages.iter().map(|m| self.push.send(m))).await;

        let mut errors = Vec::new();
        let mut delivered = 0usize;
        for result in results {
            match result {
                Ok(_) => delivered += 1,
                Err(err) => errors.push(format!("{:#}", err)),
            }
        }
        if delivered > 0 {
            if !errors.is_empty() {
                warn!(recipient, failures = errors.len(), "some devices rejected the push");
            }
            return Ok(());
        }
        Err(anyhow!(errors.join("; ")))
    }

    /// Returns the write error, if any. It never changes whether the push went out.
    async fn log(
        &self,
        def: &TriggerDefinition,
        target: &Target,
        message: &ComposedMessage,
        status: DispatchStatus,
        error: Option<&str>,
        now: DateTime<Utc>,
    ) -> Option<String> {
        let entry = NewNotificationLog {
            recipient_id: target.recipient_id(),
            trigger_key: def.key.as_str(),
            entity_id: target.entity_id(),
            category: def.category.as_str(),
            title: &message.title,
            body: &message.body,
            status,
            error,
            created_at: now,
        };
        match self.logger.record_dispatch(&entry).await {
            Ok(_) => None,
            Err(err) => {
                error!(?err, status = status.as_str(), "failed to record dispatch outcome");
                Some(format!("{:#}", err))
            }
        }
    }
}
