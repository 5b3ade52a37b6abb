use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

/// Rate-limit bucket a notification belongs to.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum NotificationCategory {
    Marketing,
    Transaction,
    Reminder,
    Referral,
    Payment,
    System,
}

impl NotificationCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationCategory::Marketing => "marketing",
            NotificationCategory::Transaction => "transaction",
            NotificationCategory::Reminder => "reminder",
            NotificationCategory::Referral => "referral",
            NotificationCategory::Payment => "payment",
            NotificationCategory::System => "system",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DispatchStatus {
    Sent,
    Failed,
    Skipped,
}

impl DispatchStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DispatchStatus::Sent => "sent",
            DispatchStatus::Failed => "failed",
            DispatchStatus::Skipped => "skipped",
        }
    }

    pub fn parse_status(s: &str) -> Option<Self> {
        match s {
            "sent" => Some(DispatchStatus::Sent),
            "failed" => Some(DispatchStatus::Failed),
            "skipped" => Some(DispatchStatus::Skipped),
            _ => None,
        }
    }
}

/// Outcome of a whole trigger run, stored on the trigger row.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Success,
    Partial,
    Error,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Success => "success",
            RunStatus::Partial => "partial",
            RunStatus::Error => "error",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ReferralStatus {
    Invited,
    Registered,
    Verified,
    Rewarded,
}

impl ReferralStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReferralStatus::Invited => "invited",
            ReferralStatus::Registered => "registered",
            ReferralStatus::Verified => "verified",
            ReferralStatus::Rewarded => "rewarded",
        }
    }

    pub fn parse_status(s: &str) -> Option<Self> {
        match s {
            "invited" => Some(ReferralStatus::Invited),
            "registered" => Some(ReferralStatus::Registered),
            "verified" => Some(ReferralStatus::Verified),
            "rewarded" => Some(ReferralStatus::Rewarded),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: String,
    pub display_name: Option<String>,
    pub plan: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Referral {
    pub id: String,
    pub referrer_id: String,
    pub referred_id: Option<String>,
    pub referred_name: Option<String>,
    pub status: ReferralStatus,
    pub verified: bool,
    pub verified_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Debt {
    pub id: String,
    pub user_id: String,
    pub creditor: String,
    pub amount_cents: i64,
    pub due_date: NaiveDate,
    pub paid: bool,
}

/// One dispatch attempt as persisted in `notification_logs`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationLog {
    pub id: i64,
    pub recipient_id: String,
    pub trigger_key: String,
    pub entity_id: String,
    pub category: String,
    pub title: String,
    pub body: String,
    pub status: DispatchStatus,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub sent_at: Option<DateTime<Utc>>,
    pub delivered_at: Option<DateTime<Utc>>,
    pub opened_at: Option<DateTime<Utc>>,
    pub clicked_at: Option<DateTime<Utc>>,
    pub dismissed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CronHealthRecord {
    pub id: i64,
    pub ran_at: DateTime<Utc>,
    pub success: bool,
    pub triggers_evaluated: i64,
    pub campaigns_processed: i64,
    pub error: Option<String>,
}
