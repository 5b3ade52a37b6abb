//! Per-trigger preconditions and the prior-send idempotency guard.
use anyhow::Result;
use chrono::{Duration, NaiveDate};
use tracing::{debug, instrument};

use crate::config::Campaigns;
use crate::db::{self, Pool};
use crate::model::ReferralStatus;
use crate::triggers::{Target, TriggerDefinition, TriggerKey};

#[derive(Debug, Clone)]
pub enum Eligibility {
    Eligible(Target),
    AlreadyNotified,
    EntityNotFound,
    PreconditionFailed(String),
}

impl Eligibility {
    pub fn label(&self) -> &'static str {
        match self {
            Eligibility::Eligible(_) => "eligible",
            Eligibility::AlreadyNotified => "already_notified",
            Eligibility::EntityNotFound => "entity_not_found",
            Eligibility::PreconditionFailed(_) => "precondition_failed",
        }
    }
}

#[derive(Debug, Clone)]
pub struct EligibilityEvaluator {
    pool: Pool,
    campaigns: Campaigns,
}

impl EligibilityEvaluator {
    pub fn new(pool: Pool, campaigns: Campaigns) -> Self {
        Self { pool, campaigns }
    }

    pub fn campaigns(&self) -> &Campaigns {
        &self.campaigns
    }

    /// Read-only. Database errors propagate; every business outcome is an
    /// [`Eligibility`] variant.
    #[instrument(skip(self, def, today), fields(trigger = def.key.as_str()))]
    pub async fn evaluate(
        &self,
        def: &TriggerDefinition,
        entity_id: &str,
        today: NaiveDate,
    ) -> Result<Eligibility> {
        let Some(target) = self.load_target(def.key, entity_id).await? else {
            return Ok(Eligibility::EntityNotFound);
        };

        if let Some(reason) = self.precondition_failure(def.key, &target, today) {
            debug!(%reason, "precondition not met");
            return Ok(Eligibility::PreconditionFailed(reason));
        }

        let already = db::has_sent_notification(
            &self.pool,
            target.recipient_id(),
            def.key.as_str(),
            target.entity_id(),
        )
        .await?;
        if already {
            return Ok(Eligibility::AlreadyNotified);
        }

        Ok(Eligibility::Eligible(target))
    }

    async fn load_target(&self, key: TriggerKey, entity_id: &str) -> Result<Option<Target>> {
        match key {
            TriggerKey::ReferralInvited | TriggerKey::ReferralVerified => {
                let Some(referral) = db::get_referral(&self.pool, entity_id).await? else {
                    return Ok(None);
                };
                let referrer = db::get_user(&self.pool, &referral.referrer_id).await?;
                Ok(Some(Target::Referral { referral, referrer }))
            }
            TriggerKey::SmartPlanUnlocked => {
                let Some(user) = db::get_user(&self.pool, entity_id).await? else {
                    return Ok(None);
                };
                let verified_referrals = db::count_verified_referrals(&self.pool, &user.id).await?;
                Ok(Some(Target::User {
                    user,
                    verified_referrals,
                }))
            }
            TriggerKey::DebtDueReminder => {
                Ok(db::get_debt(&self.pool, entity_id).await?.map(Target::Debt))
            }
        }
    }

    fn precondition_failure(
        &self,
        key: TriggerKey,
        target: &Target,
        today: NaiveDate,
    ) -> Option<String> {
        match (key, target) {
            (TriggerKey::ReferralInvited, Target::Referral { referral, .. }) => {
                (referral.status != ReferralStatus::Invited).then(|| {
                    format!("referral status is {}", referral.status.as_str())
                })
            }
            (TriggerKey::ReferralVerified, Target::Referral { referral, .. }) => {
                if !referral.verified {
                    Some("referral is not verified".to_string())
                } else if referral.verified_at.is_none() {
                    Some("referral has no verification timestamp".to_string())
                } else {
                    None
                }
            }
            (
                TriggerKey::SmartPlanUnlocked,
                Target::User {
                    user,
                    verified_referrals,
                },
            ) => {
                if user.plan == "smart" {
                    Some("user is already on the smart plan".to_string())
                } else if *verified_referrals < self.campaigns.smart_plan_threshold {
                    Some(format!(
                        "{} of {} verified referrals",
                        verified_referrals, self.campaigns.smart_plan_threshold
                    ))
                } else {
                    None
                }
            }
            (TriggerKey::DebtDueReminder, Target::Debt(debt)) => {
                let horizon = today + Duration::days(self.campaigns.debt_reminder_days);
                if debt.paid {
                    Some("debt is already paid".to_string())
                } else if debt.due_date < today {
                    Some("debt is overdue".to_string())
                } else if debt.due_date > horizon {
                    Some(format!("debt is due on {}", debt.due_date))
                } else {
                    None
                }
            }
            _ => Some("entity does not match trigger".to_string()),
        }
    }
}
