use super::model::{NewNotificationLog, TriggerRunRow};
use crate::model::{
    CronHealthRecord, Debt, DispatchStatus, NotificationLog, Referral, ReferralStatus, User,
};
use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::Row;
use sqlx::SqlitePool;
use tracing::instrument;

pub type Pool = SqlitePool;

pub async fn init_pool(database_url: &str) -> Result<Pool> {
    let normalized = prepare_sqlite_url(database_url);
    let pool = SqlitePool::connect(&normalized)
        .await
        .with_context(|| format!("failed to open database {}", normalized))?;
    // Enable WAL and stricter durability.
    sqlx::query("PRAGMA journal_mode=WAL;")
        .execute(&pool)
        .await?;
    sqlx::query("PRAGMA synchronous=FULL;")
        .execute(&pool)
        .await?;
    Ok(pool)
}

/// If using a file-backed SQLite URL, expand a leading `~/` and ensure the parent
/// directory exists. Leaves in-memory URLs untouched. Returns possibly-updated URL.
fn prepare_sqlite_url(url: &str) -> String {
    if !url.starts_with("sqlite:") {
        return url.to_string();
    }

    // In-memory URLs like sqlite::memory: or sqlite::memory:?cache=shared
    if url.starts_with("sqlite::memory") {
        return url.to_string();
    }

    let rest = &url["sqlite:".len()..];
    let path_with_query = rest.strip_prefix("//").unwrap_or(rest);

    let (path_part, query_part) = match path_with_query.split_once('?') {
        Some((p, q)) => (p, Some(q)),
        None => (path_with_query, None),
    };

    if path_part.is_empty() {
        return url.to_string();
    }

    let expanded_path = match (path_part.strip_prefix("~/"), std::env::var("HOME")) {
        (Some(rest), Ok(home)) => format!("{}/{}", home.trim_end_matches('/'), rest),
        _ => path_part.to_string(),
    };

    if let Some(parent) = std::path::Path::new(&expanded_path).parent() {
        if !parent.as_os_str().is_empty() {
            let _ = std::fs::create_dir_all(parent);
        }
    }

    // sqlx refuses to create missing files unless asked to.
    let mut rebuilt = String::from("sqlite://");
    rebuilt.push_str(&expanded_path);
    match query_part {
        Some(q) => {
            rebuilt.push('?');
            rebuilt.push_str(q);
        }
        None => rebuilt.push_str("?mode=rwc"),
    }
    rebuilt
}

pub async fn run_migrations(pool: &Pool) -> Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Users and devices
// ---------------------------------------------------------------------------

#[instrument(skip_all)]
pub async fn upsert_user(
    pool: &Pool,
    id: &str,
    display_name: Option<&str>,
    plan: &str,
) -> Result<()> {
    sqlx::query(
        "INSERT INTO users (id, display_name, plan) VALUES (?, ?, ?) \
         ON CONFLICT(id) DO UPDATE SET display_name = excluded.display_name, plan = excluded.plan",
    )
    .bind(id)
    .bind(display_name)
    .bind(plan)
    .execute(pool)
    .await?;
    Ok(())
}

#[instrument(skip_all)]
pub async fn get_user(pool: &Pool, id: &str) -> Result<Option<User>> {
    let row = sqlx::query("SELECT id, display_name, plan FROM users WHERE id = ?")
        .bind(id)
        .fetch_optional(pool)
        .await?;
    Ok(row.map(|row| User {
        id: row.get("id"),
        display_name: row.get("display_name"),
        plan: row.get("plan"),
    }))
}

#[instrument(skip_all)]
pub async fn add_push_token(pool: &Pool, user_id: &str, token: &str, platform: &str) -> Result<()> {
    sqlx::query(
        "INSERT INTO push_tokens (user_id, token, platform) VALUES (?, ?, ?) \
         ON CONFLICT(token) DO UPDATE SET user_id = excluded.user_id, platform = excluded.platform",
    )
    .bind(user_id)
    .bind(token)
    .bind(platform)
    .execute(pool)
    .await?;
    Ok(())
}

#[instrument(skip_all)]
pub async fn push_tokens_for_user(pool: &Pool, user_id: &str) -> Result<Vec<String>> {
    let tokens = sqlx::query_scalar("SELECT token FROM push_tokens WHERE user_id = ? ORDER BY id")
        .bind(user_id)
        .fetch_all(pool)
        .await?;
    Ok(tokens)
}

// ---------------------------------------------------------------------------
// Referrals
// ---------------------------------------------------------------------------

#[instrument(skip_all)]
pub async fn insert_referral(
    pool: &Pool,
    id: &str,
    referrer_id: &str,
    referred_name: Option<&str>,
) -> Result<()> {
    sqlx::query(
        "INSERT INTO referrals (id, referrer_id, referred_name, status) VALUES (?, ?, ?, ?)",
    )
    .bind(id)
    .bind(referrer_id)
    .bind(referred_name)
    .bind(ReferralStatus::Invited.as_str())
    .execute(pool)
    .await?;
    Ok(())
}

/// Mark a referral as verified by the invited user.
#[instrument(skip_all)]
pub async fn verify_referral(
    pool: &Pool,
    id: &str,
    referred_id: &str,
    verified_at: DateTime<Utc>,
) -> Result<()> {
    let res = sqlx::query(
        "UPDATE referrals SET status = ?, verified = 1, verified_at = ?, referred_id = ? WHERE id = ?",
    )
    .bind(ReferralStatus::Verified.as_str())
    .bind(verified_at)
    .bind(referred_id)
    .bind(id)
    .execute(pool)
    .await?;
    if res.rows_affected() == 0 {
        return Err(anyhow!("referral {} not found", id));
    }
    Ok(())
}

fn map_referral(row: &SqliteRow) -> Result<Referral> {
    let status: String = row.get("status");
    let status = ReferralStatus::parse_status(&status)
        .ok_or_else(|| anyhow!("unknown referral status '{}'", status))?;
    Ok(Referral {
        id: row.get("id"),
        referrer_id: row.get("referrer_id"),
        referred_id: row.get("referred_id"),
        referred_name: row.get("referred_name"),
        status,
        verified: row.get("verified"),
        verified_at: row.get("verified_at"),
    })
}

#[instrument(skip_all)]
pub async fn get_referral(pool: &Pool, id: &str) -> Result<Option<Referral>> {
    let row = sqlx::query(
        "SELECT id, referrer_id, referred_id, referred_name, status, verified, verified_at \
         FROM referrals WHERE id = ?",
    )
    .bind(id)
    .fetch_optional(pool)
    .await?;
    row.as_ref().map(map_referral).transpose()
}

/// Referral ids in `status` that have no `sent` log for `trigger_key` yet.
#[instrument(skip_all)]
pub async fn unnotified_referrals_with_status(
    pool: &Pool,
    status: ReferralStatus,
    trigger_key: &str,
) -> Result<Vec<String>> {
    let ids = sqlx::query_scalar(
        "SELECT r.id FROM referrals r WHERE r.status = ? AND NOT EXISTS ( \
             SELECT 1 FROM notification_logs l \
             WHERE l.trigger_key = ? AND l.entity_id = r.id AND l.status = 'sent') \
         ORDER BY r.created_at, r.id",
    )
    .bind(status.as_str())
    .bind(trigger_key)
    .fetch_all(pool)
    .await?;
    Ok(ids)
}

/// Verified referral ids that have no `sent` log for `trigger_key` yet.
#[instrument(skip_all)]
pub async fn unnotified_verified_referrals(pool: &Pool, trigger_key: &str) -> Result<Vec<String>> {
    let ids = sqlx::query_scalar(
        "SELECT r.id FROM referrals r WHERE r.verified = 1 AND r.verified_at IS NOT NULL \
         AND NOT EXISTS ( \
             SELECT 1 FROM notification_logs l \
             WHERE l.trigger_key = ? AND l.entity_id = r.id AND l.status = 'sent') \
         ORDER BY r.verified_at, r.id",
    )
    .bind(trigger_key)
    .fetch_all(pool)
    .await?;
    Ok(ids)
}

#[instrument(skip_all)]
pub async fn count_verified_referrals(pool: &Pool, referrer_id: &str) -> Result<i64> {
    let cnt: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM referrals WHERE referrer_id = ? AND verified = 1",
    )
    .bind(referrer_id)
    .fetch_one(pool)
    .await?;
    Ok(cnt)
}

/// Users with at least `threshold` verified referrals, not on the Smart plan,
/// and without a `sent` log for `trigger_key`.
#[instrument(skip_all)]
pub async fn unnotified_smart_plan_candidates(
    pool: &Pool,
    threshold: i64,
    trigger_key: &str,
) -> Result<Vec<String>> {
    let ids = sqlx::query_scalar(
        "SELECT u.id FROM users u \
         JOIN referrals r ON r.referrer_id = u.id AND r.verified = 1 \
         WHERE u.plan != 'smart' AND NOT EXISTS ( \
             SELECT 1 FROM notification_logs l \
             WHERE l.trigger_key = ? AND l.entity_id = u.id AND l.status = 'sent') \
         GROUP BY u.id HAVING COUNT(r.id) >= ? ORDER BY u.id",
    )
    .bind(trigger_key)
    .bind(threshold)
    .fetch_all(pool)
    .await?;
    Ok(ids)
}

// ---------------------------------------------------------------------------
// Debts
// ---------------------------------------------------------------------------

#[instrument(skip_all)]
pub async fn insert_debt(
    pool: &Pool,
    id: &str,
    user_id: &str,
    creditor: &str,
    amount_cents: i64,
    due_date: NaiveDate,
) -> Result<()> {
    sqlx::query(
        "INSERT INTO debts (id, user_id, creditor, amount_cents, due_date) VALUES (?, ?, ?, ?, ?)",
    )
    .bind(id)
    .bind(user_id)
    .bind(creditor)
    .bind(amount_cents)
    .bind(due_date)
    .execute(pool)
    .await?;
    Ok(())
}

#[instrument(skip_all)]
pub async fn get_debt(pool: &Pool, id: &str) -> Result<Option<Debt>> {
    let row = sqlx::query(
        "SELECT id, user_id, creditor, amount_cents, due_date, paid FROM debts WHERE id = ?",
    )
    .bind(id)
    .fetch_optional(pool)
    .await?;
    Ok(row.map(|row| Debt {
        id: row.get("id"),
        user_id: row.get("user_id"),
        creditor: row.get("creditor"),
        amount_cents: row.get("amount_cents"),
        due_date: row.get("due_date"),
        paid: row.get("paid"),
    }))
}

/// Unpaid debts due in `[from, to]` without a `sent` log for `trigger_key`.
#[instrument(skip_all)]
pub async fn unnotified_debts_due_between(
    pool: &Pool,
    from: NaiveDate,
    to: NaiveDate,
    trigger_key: &str,
) -> Result<Vec<String>> {
    let ids = sqlx::query_scalar(
        "SELECT d.id FROM debts d WHERE d.paid = 0 AND d.due_date >= ? AND d.due_date <= ? \
         AND NOT EXISTS ( \
             SELECT 1 FROM notification_logs l \
             WHERE l.trigger_key = ? AND l.entity_id = d.id AND l.status = 'sent') \
         ORDER BY d.due_date, d.id",
    )
    .bind(from)
    .bind(to)
    .bind(trigger_key)
    .fetch_all(pool)
    .await?;
    Ok(ids)
}

// ---------------------------------------------------------------------------
// Notification logs
// ---------------------------------------------------------------------------

#[instrument(skip_all)]
pub async fn insert_notification_log(pool: &Pool, log: &NewNotificationLog<'_>) -> Result<i64> {
    let sent_at = (log.status == DispatchStatus::Sent).then_some(log.created_at);
    let rec = sqlx::query(
        "INSERT INTO notification_logs \
         (recipient_id, trigger_key, entity_id, category, title, body, status, error, created_at, sent_at) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?) RETURNING id",
    )
    .bind(log.recipient_id)
    .bind(log.trigger_key)
    .bind(log.entity_id)
    .bind(log.category)
    .bind(log.title)
    .bind(log.body)
    .bind(log.status.as_str())
    .bind(log.error)
    .bind(log.created_at)
    .bind(sent_at)
    .fetch_one(pool)
    .await?;
    Ok(rec.get("id"))
}

#[instrument(skip_all)]
pub async fn has_sent_notification(
    pool: &Pool,
    recipient_id: &str,
    trigger_key: &str,
    entity_id: &str,
) -> Result<bool> {
    let found: Option<i64> = sqlx::query_scalar(
        "SELECT id FROM notification_logs \
         WHERE recipient_id = ? AND trigger_key = ? AND entity_id = ? AND status = 'sent' LIMIT 1",
    )
    .bind(recipient_id)
    .bind(trigger_key)
    .bind(entity_id)
    .fetch_optional(pool)
    .await?;
    Ok(found.is_some())
}

fn map_log(row: &SqliteRow) -> Result<NotificationLog> {
    let status: String = row.get("status");
    let status = DispatchStatus::parse_status(&status)
        .ok_or_else(|| anyhow!("unknown dispatch status '{}'", status))?;
    Ok(NotificationLog {
        id: row.get("id"),
        recipient_id: row.get("recipient_id"),
        trigger_key: row.get("trigger_key"),
        entity_id: row.get("entity_id"),
        category: row.get("category"),
        title: row.get("title"),
        body: row.get("body"),
        status,
        error: row.get("error"),
        created_at: row.get("created_at"),
        sent_at: row.get("sent_at"),
        delivered_at: row.get("delivered_at"),
        opened_at: row.get("opened_at"),
        clicked_at: row.get("clicked_at"),
        dismissed_at: row.get("dismissed_at"),
    })
}

#[instrument(skip_all)]
pub async fn notification_logs_for_trigger(
    pool: &Pool,
    trigger_key: &str,
) -> Result<Vec<NotificationLog>> {
    let rows = sqlx::query(
        "SELECT id, recipient_id, trigger_key, entity_id, category, title, body, status, error, \
         created_at, sent_at, delivered_at, opened_at, clicked_at, dismissed_at \
         FROM notification_logs WHERE trigger_key = ? ORDER BY id",
    )
    .bind(trigger_key)
    .fetch_all(pool)
    .await?;
    rows.iter().map(map_log).collect()
}

// ---------------------------------------------------------------------------
// Trigger runs
// ---------------------------------------------------------------------------

#[instrument(skip_all)]
pub async fn record_trigger_run(
    pool: &Pool,
    key: &str,
    status: &str,
    summary: &serde_json::Value,
    at: DateTime<Utc>,
) -> Result<()> {
    sqlx::query(
        "INSERT INTO notification_triggers (key, last_run_at, last_run_status, last_summary) \
         VALUES (?, ?, ?, ?) ON CONFLICT(key) DO UPDATE SET \
         last_run_at = excluded.last_run_at, last_run_status = excluded.last_run_status, \
         last_summary = excluded.last_summary",
    )
    .bind(key)
    .bind(at)
    .bind(status)
    .bind(summary.to_string())
    .execute(pool)
    .await?;
    Ok(())
}

#[instrument(skip_all)]
pub async fn trigger_runs(pool: &Pool) -> Result<Vec<TriggerRunRow>> {
    let rows = sqlx::query(
        "SELECT key, last_run_at, last_run_status, last_summary FROM notification_triggers ORDER BY key",
    )
    .fetch_all(pool)
    .await?;
    Ok(rows
        .into_iter()
        .map(|row| {
            let summary: Option<String> = row.get("last_summary");
            TriggerRunRow {
                key: row.get("key"),
                last_run_at: row.get("last_run_at"),
                last_run_status: row.get("last_run_status"),
                last_summary: summary.and_then(|s| serde_json::from_str(&s).ok()),
            }
        })
        .collect())
}

// ---------------------------------------------------------------------------
// Cron health
// ---------------------------------------------------------------------------

#[instrument(skip_all)]
pub async fn insert_cron_health(
    pool: &Pool,
    ran_at: DateTime<Utc>,
    success: bool,
    triggers_evaluated: i64,
    campaigns_processed: i64,
    error: Option<&str>,
) -> Result<i64> {
    let rec = sqlx::query(
        "INSERT INTO cron_health (ran_at, success, triggers_evaluated, campaigns_processed, error) \
         VALUES (?, ?, ?, ?, ?) RETURNING id",
    )
    .bind(ran_at)
    .bind(success)
    .bind(triggers_evaluated)
    .bind(campaigns_processed)
    .bind(error)
    .fetch_one(pool)
    .await?;
    Ok(rec.get("id"))
}

/// Most recent health records, newest first.
#[instrument(skip_all)]
pub async fn recent_cron_health(pool: &Pool, limit: i64) -> Result<Vec<CronHealthRecord>> {
    let rows = sqlx::query(
        "SELECT id, ran_at, success, triggers_evaluated, campaigns_processed, error \
         FROM cron_health ORDER BY ran_at DESC, id DESC LIMIT ?",
    )
    .bind(limit)
    .fetch_all(pool)
    .await?;
    Ok(rows
        .into_iter()
        .map(|row| CronHealthRecord {
            id: row.get("id"),
            ran_at: row.get("ran_at"),
            success: row.get("success"),
            triggers_evaluated: row.get("triggers_evaluated"),
            campaigns_processed: row.get("campaigns_processed"),
            error: row.get("error"),
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    async fn setup_pool() -> Pool {
        let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
        sqlx::migrate!("./migrations").run(&pool).await.unwrap();
        pool
    }

    #[test]
    fn prepare_sqlite_url_leaves_memory_untouched() {
        assert_eq!(prepare_sqlite_url("sqlite::memory:"), "sqlite::memory:");
        assert_eq!(
            prepare_sqlite_url("postgres://localhost/db"),
            "postgres://localhost/db"
        );
    }

    #[test]
    fn prepare_sqlite_url_adds_create_mode() {
        let td = tempfile::tempdir().unwrap();
        let path = td.path().join("nested").join("a.db");
        let url = format!("sqlite://{}", path.display());
        let prepared = prepare_sqlite_url(&url);
        assert!(prepared.ends_with("a.db?mode=rwc"));
        assert!(path.parent().unwrap().exists());
    }

    #[tokio::test]
    async fn referral_lifecycle_and_selection() {
        let pool = setup_pool().await;
        upsert_user(&pool, "u1", Some("Ana"), "free").await.unwrap();
        insert_referral(&pool, "r1", "u1", Some("Luis")).await.unwrap();
        insert_referral(&pool, "r2", "u1", None).await.unwrap();

        let invited = unnotified_referrals_with_status(&pool, ReferralStatus::Invited, "k")
            .await
            .unwrap();
        assert_eq!(invited, vec!["r1".to_string(), "r2".to_string()]);

        verify_referral(&pool, "r1", "u2", Utc::now()).await.unwrap();
        let r1 = get_referral(&pool, "r1").await.unwrap().unwrap();
        assert_eq!(r1.status, ReferralStatus::Verified);
        assert!(r1.verified);
        assert!(r1.verified_at.is_some());
        assert_eq!(count_verified_referrals(&pool, "u1").await.unwrap(), 1);

        assert!(verify_referral(&pool, "missing", "u2", Utc::now()).await.is_err());
        assert!(get_referral(&pool, "missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn sent_logs_exclude_targets_from_selection() {
        let pool = setup_pool().await;
        upsert_user(&pool, "u1", None, "free").await.unwrap();
        insert_referral(&pool, "r1", "u1", None).await.unwrap();

        let log = NewNotificationLog {
            recipient_id: "u1",
            trigger_key: "referral-invited",
            entity_id: "r1",
            category: "referral",
            title: "t",
            body: "b",
            status: DispatchStatus::Failed,
            error: Some("boom"),
            created_at: Utc::now(),
        };
        insert_notification_log(&pool, &log).await.unwrap();
        assert!(!has_sent_notification(&pool, "u1", "referral-invited", "r1")
            .await
            .unwrap());
        assert_eq!(
            unnotified_referrals_with_status(&pool, ReferralStatus::Invited, "referral-invited")
                .await
                .unwrap()
                .len(),
            1
        );

        let sent = NewNotificationLog {
            status: DispatchStatus::Sent,
            error: None,
            ..log
        };
        insert_notification_log(&pool, &sent).await.unwrap();
        assert!(has_sent_notification(&pool, "u1", "referral-invited", "r1")
            .await
            .unwrap());
        assert!(
            unnotified_referrals_with_status(&pool, ReferralStatus::Invited, "referral-invited")
                .await
                .unwrap()
                .is_empty()
        );

        let logs = notification_logs_for_trigger(&pool, "referral-invited")
            .await
            .unwrap();
        assert_eq!(logs.len(), 2);
        assert!(logs[0].sent_at.is_none());
        assert!(logs[1].sent_at.is_some());
    }

    #[tokio::test]
    async fn debts_due_window() {
        let pool = setup_pool().await;
        upsert_user(&pool, "u1", None, "free").await.unwrap();
        let today = Utc::now().date_naive();
        insert_debt(&pool, "d1", "u1", "Banco", 10_000, today + Duration::days(2))
            .await
            .unwrap();
        insert_debt(&pool, "d2", "u1", "Tienda", 5_000, today + Duration::days(10))
            .await
            .unwrap();
        insert_debt(&pool, "d3", "u1", "Amigo", 2_000, today - Duration::days(1))
            .await
            .unwrap();

        let due = unnotified_debts_due_between(&pool, today, today + Duration::days(3), "k")
            .await
            .unwrap();
        assert_eq!(due, vec!["d1".to_string()]);

        let d1 = get_debt(&pool, "d1").await.unwrap().unwrap();
        assert_eq!(d1.amount_cents, 10_000);
        assert!(!d1.paid);
    }

    #[tokio::test]
    async fn trigger_runs_and_cron_health_roundtrip() {
        let pool = setup_pool().await;
        let now = Utc::now();
        record_trigger_run(&pool, "a", "success", &serde_json::json!({"sent": 1}), now)
            .await
            .unwrap();
        record_trigger_run(&pool, "a", "partial", &serde_json::json!({"sent": 2}), now)
            .await
            .unwrap();
        let runs = trigger_runs(&pool).await.unwrap();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].last_run_status.as_deref(), Some("partial"));
        assert_eq!(runs[0].last_summary.as_ref().unwrap()["sent"], 2);

        insert_cron_health(&pool, now - Duration::minutes(10), true, 4, 4, None)
            .await
            .unwrap();
        insert_cron_health(&pool, now, false, 4, 2, Some("db down"))
            .await
            .unwrap();
        let recent = recent_cron_health(&pool, 10).await.unwrap();
        assert_eq!(recent.len(), 2);
        assert!(!recent[0].success);
        assert_eq!(recent[0].error.as_deref(), Some("db down"));
        assert!(recent[1].success);
    }
}
