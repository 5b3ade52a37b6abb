//! Built-in notification triggers and their message templates.
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use std::collections::BTreeMap;

use crate::error::NotifyError;
use crate::model::{Debt, NotificationCategory, Referral, User};

static KEY_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-z0-9][a-z0-9-]*$").expect("valid trigger key pattern"));

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum TriggerKey {
    ReferralInvited,
    ReferralVerified,
    SmartPlanUnlocked,
    DebtDueReminder,
}

impl TriggerKey {
    pub fn as_str(&self) -> &'static str {
        match self {
            TriggerKey::ReferralInvited => "referral-invited",
            TriggerKey::ReferralVerified => "referral-verified",
            TriggerKey::SmartPlanUnlocked => "smart-plan-unlocked",
            TriggerKey::DebtDueReminder => "debt-due-reminder",
        }
    }

    pub fn parse_key(s: &str) -> Option<Self> {
        DEFINITIONS
            .iter()
            .map(|d| d.key)
            .find(|k| k.as_str() == s)
    }
}

/// What kind of row a trigger's entity id points at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Referral,
    User,
    Debt,
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct TriggerDefinition {
    pub key: TriggerKey,
    pub label: &'static str,
    pub category: NotificationCategory,
    pub entity: EntityKind,
    /// Human description of the batch target rule.
    pub selection: &'static str,
}

static DEFINITIONS: [TriggerDefinition; 4] = [
    TriggerDefinition {
        key: TriggerKey::ReferralInvited,
        label: "Referral invitation pending",
        category: NotificationCategory::Referral,
        entity: EntityKind::Referral,
        selection: "referrals with status=invited and no prior notification",
    },
    TriggerDefinition {
        key: TriggerKey::ReferralVerified,
        label: "Referral verified",
        category: NotificationCategory::Referral,
        entity: EntityKind::Referral,
        selection: "verified referrals with a verification timestamp and no prior notification",
    },
    TriggerDefinition {
        key: TriggerKey::SmartPlanUnlocked,
        label: "Smart plan unlocked",
        category: NotificationCategory::Marketing,
        entity: EntityKind::User,
        selection: "users reaching the verified-referral threshold, not on the smart plan",
    },
    TriggerDefinition {
        key: TriggerKey::DebtDueReminder,
        label: "Debt due soon",
        category: NotificationCategory::Reminder,
        entity: EntityKind::Debt,
        selection: "unpaid debts due within the reminder window and no prior notification",
    },
];

pub fn definitions() -> &'static [TriggerDefinition] {
    &DEFINITIONS
}

pub fn definition(key: TriggerKey) -> &'static TriggerDefinition {
    let idx = match key {
        TriggerKey::ReferralInvited => 0,
        TriggerKey::ReferralVerified => 1,
        TriggerKey::SmartPlanUnlocked => 2,
        TriggerKey::DebtDueReminder => 3,
    };
    &DEFINITIONS[idx]
}

/// Resolve a raw key from a request path.
pub fn resolve(raw: &str) -> Result<&'static TriggerDefinition, NotifyError> {
    if !KEY_PATTERN.is_match(raw) {
        return Err(NotifyError::Validation(format!(
            "invalid trigger key '{}'",
            raw
        )));
    }
    TriggerKey::parse_key(raw)
        .map(definition)
        .ok_or_else(|| NotifyError::trigger_not_found(raw))
}

/// Entity snapshot a trigger fires for, loaded by the eligibility evaluator.
#[derive(Debug, Clone)]
pub enum Target {
    Referral {
        referral: Referral,
        referrer: Option<User>,
    },
    User {
        user: User,
        verified_referrals: i64,
    },
    Debt(Debt),
}

impl Target {
    pub fn entity_id(&self) -> &str {
        match self {
            Target::Referral { referral, .. } => &referral.id,
            Target::User { user, .. } => &user.id,
            Target::Debt(debt) => &debt.id,
        }
    }

    pub fn recipient_id(&self) -> &str {
        match self {
            Target::Referral { referral, .. } => &referral.referrer_id,
            Target::User { user, .. } => &user.id,
            Target::Debt(debt) => &debt.user_id,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComposedMessage {
    pub title: String,
    pub body: String,
    pub data: BTreeMap<String, String>,
}

fn format_amount(cents: i64) -> String {
    let sign = if cents < 0 { "-" } else { "" };
    let cents = cents.abs();
    format!("{}${}.{:02}", sign, cents / 100, cents % 100)
}

pub fn compose(def: &TriggerDefinition, target: &Target) -> ComposedMessage {
    let (title, body) = match target {
        Target::Referral {
            referral,
            referrer,
        } => {
            let friend = referral.referred_name.as_deref();
            let greeting = referrer
                .as_ref()
                .and_then(|u| u.display_name.as_deref())
                .map(|n| format!("{}, ", n))
                .unwrap_or_default();
            match def.key {
                TriggerKey::ReferralVerified => (
                    "¡Referido verificado!".to_string(),
                    format!(
                        "{}{} verificó su cuenta. Estás más cerca del plan Smart.",
                        greeting,
                        friend.unwrap_or("tu referido")
                    ),
                ),
                _ => (
                    "Invitación enviada".to_string(),
                    format!(
                        "Te avisaremos cuando {} se una a Ahorro365.",
                        friend.unwrap_or("tu amigo")
                    ),
                ),
            }
        }
        Target::User {
            verified_referrals, ..
        } => (
            "¡Desbloqueaste el plan Smart!".to_string(),
            format!(
                "Tienes {} referidos verificados. Activa tu plan Smart desde la app.",
                verified_referrals
            ),
        ),
        Target::Debt(debt) => (
            "Tu deuda vence pronto".to_string(),
            format!(
                "Recuerda pagar {} a {} antes del {}.",
                format_amount(debt.amount_cents),
                debt.creditor,
                debt.due_date.format("%d/%m/%Y")
            ),
        ),
    };

    let data = BTreeMap::from([
        ("trigger".to_string(), def.key.as_str().to_string()),
        ("entity_id".to_string(), target.entity_id().to_string()),
        ("category".to_string(), def.category.as_str().to_string()),
    ]);
    ComposedMessage { title, body, data }
}
