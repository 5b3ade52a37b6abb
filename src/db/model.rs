//! Database view models used by repositories.
//!
//! Keep these structs focused on the data written or returned by queries.
//! Business logic should live in higher layers.

use crate::model::DispatchStatus;
use chrono::{DateTime, Utc};
use serde::Serialize;

/// Insert payload for one dispatch attempt.
#[derive(Debug, Clone)]
pub struct NewNotificationLog<'a> {
    pub recipient_id: &'a str,
    pub trigger_key: &'a str,
    pub entity_id: &'a str,
    pub category: &'a str,
    pub title: &'a str,
    pub body: &'a str,
    pub status: DispatchStatus,
    pub error: Option<&'a str>,
    pub created_at: DateTime<Utc>,
}

/// Last-run columns of a trigger row.
#[derive(Debug, Clone, Serialize)]
pub struct TriggerRunRow {
    pub key: String,
    pub last_run_at: Option<DateTime<Utc>>,
    pub last_run_status: Option<String>,
    pub last_summary: Option<serde_json::Value>,
}
