//! Sliding-window rate limiting per notification category.
//!
//! Each category carries a cascade of windows that must all pass. Counting is
//! delegated to a [`RateLimitBackend`], which checks every window of the
//! cascade and records the event in all of them or in none. The production
//! backend evaluates one Lua script through the Upstash Redis REST API so the
//! whole cascade is atomic on the server. When no backend is configured, or
//! the backend cannot be reached, checks fail open.
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use reqwest::{Client, Url};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, instrument, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::model::NotificationCategory;

const HOUR: i64 = 60 * 60;
const DAY: i64 = 24 * HOUR;
const WEEK: i64 = 7 * DAY;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowRule {
    pub name: &'static str,
    pub limit: i64,
    pub window_secs: i64,
}

impl WindowRule {
    const fn new(name: &'static str, limit: i64, window_secs: i64) -> Self {
        Self {
            name,
            limit,
            window_secs,
        }
    }

    pub fn window(&self) -> Duration {
        Duration::seconds(self.window_secs)
    }
}

const MARKETING: [WindowRule; 3] = [
    WindowRule::new("hour", 2, HOUR),
    WindowRule::new("day", 5, DAY),
    WindowRule::new("week", 15, WEEK),
];
const TRANSACTION: [WindowRule; 1] = [WindowRule::new("hour", 30, HOUR)];
const REMINDER: [WindowRule; 2] = [
    WindowRule::new("hour", 3, HOUR),
    WindowRule::new("day", 10, DAY),
];
const REFERRAL: [WindowRule; 2] = [
    WindowRule::new("hour", 3, HOUR),
    WindowRule::new("day", 10, DAY),
];
const PAYMENT: [WindowRule; 1] = [WindowRule::new("hour", 10, HOUR)];
const SYSTEM: [WindowRule; 1] = [WindowRule::new("hour", 20, HOUR)];

/// Windows checked, in order, for a category.
pub fn rules_for(category: NotificationCategory) -> &'static [WindowRule] {
    match category {
        NotificationCategory::Marketing => &MARKETING,
        NotificationCategory::Transaction => &TRANSACTION,
        NotificationCategory::Reminder => &REMINDER,
        NotificationCategory::Referral => &REFERRAL,
        NotificationCategory::Payment => &PAYMENT,
        NotificationCategory::System => &SYSTEM,
    }
}

pub fn limit_key(category: NotificationCategory, rule: &WindowRule, identifier: &str) -> String {
    format!("ratelimit:{}:{}:{}", category.as_str(), rule.name, identifier)
}

/// One window of a cascade as handed to the backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WindowCheck {
    pub key: String,
    pub limit: i64,
    pub window: Duration,
}

/// Answer from the backend for a single window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowDecision {
    pub allowed: bool,
    pub remaining: i64,
    pub reset_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum RateDecision {
    Allowed,
    Blocked {
        window: String,
        limit: i64,
        remaining: i64,
        reset_at: DateTime<Utc>,
    },
}

impl RateDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, RateDecision::Allowed)
    }
}

#[async_trait]
pub trait RateLimitBackend: Send + Sync {
    /// Check every window, then record one event in all of them only when
    /// each has room. Returns one decision per window, in input order.
    /// Rejected events are not counted in any window.
    async fn hit(&self, windows: &[WindowCheck], now: DateTime<Utc>)
        -> Result<Vec<WindowDecision>>;
}

#[derive(Clone)]
pub struct RateLimiter {
    backend: Option<Arc<dyn RateLimitBackend>>,
}

impl fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RateLimiter")
            .field("enabled", &self.backend.is_some())
            .finish()
    }
}

impl RateLimiter {
    pub fn new(backend: Arc<dyn RateLimitBackend>) -> Self {
        Self {
            backend: Some(backend),
        }
    }

    /// A limiter with no backend; every check is allowed.
    pub fn disabled() -> Self {
        Self { backend: None }
    }

    pub fn from_config(cfg: &Config) -> Result<Self> {
        match &cfg.rate_limit {
            Some(rl) => {
                let backend = UpstashBackend::new(&rl.url, rl.token.clone())?;
                Ok(Self::new(Arc::new(backend)))
            }
            None => {
                warn!("rate limiter not configured; notifications will not be throttled");
                Ok(Self::disabled())
            }
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.backend.is_some()
    }

    pub async fn check(&self, category: NotificationCategory, identifier: &str) -> RateDecision {
        self.check_at(category, identifier, Utc::now()).await
    }

    #[instrument(skip(self, category), fields(category = category.as_str()))]
    pub async fn check_at(
        &self,
        category: NotificationCategory,
        identifier: &str,
        now: DateTime<Utc>,
    ) -> RateDecision {
        let Some(backend) = &self.backend else {
            return RateDecision::Allowed;
        };

        let rules = rules_for(category);
        let checks: Vec<WindowCheck> = rules
            .iter()
            .map(|rule| WindowCheck {
                key: limit_key(category, rule, identifier),
                limit: rule.limit,
                window: rule.window(),
            })
            .collect();

        let decisions = match backend.hit(&checks, now).await {
            Ok(decisions) => decisions,
            Err(err) => {
                warn!(?err, "rate limiter unavailable; failing open");
                return RateDecision::Allowed;
            }
        };

        // The first exhausted window in cascade order is the one reported.
        match rules.iter().zip(&decisions).find(|(_, d)| !d.allowed) {
            Some((rule, decision)) => RateDecision::Blocked {
                window: rule.name.to_string(),
                limit: rule.limit,
                remaining: decision.remaining,
                reset_at: decision.reset_at,
            },
            None => {
                debug!(windows = decisions.len(), "all windows ok");
                RateDecision::Allowed
            }
        }
    }
}

/// In-process sliding window, for local runs and tests.
#[derive(Debug, Default)]
pub struct InMemoryBackend {
    events: Mutex<HashMap<String, VecDeque<DateTime<Utc>>>>,
}

impl InMemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RateLimitBackend for InMemoryBackend {
    async fn hit(
        &self,
        windows: &[WindowCheck],
        now: DateTime<Utc>,
    ) -> Result<Vec<WindowDecision>> {
        // One lock for the whole cascade.
        let mut events = self.events.lock().await;

        let mut counts = Vec::with_capacity(windows.len());
        for check in windows {
            let entries = events.entry(check.key.clone()).or_default();
            let cutoff = now - check.window;
            while entries.front().is_some_and(|t| *t <= cutoff) {
                entries.pop_front();
            }
            counts.push(entries.len() as i64);
        }
        let allowed = windows
            .iter()
            .zip(&counts)
            .all(|(check, count)| *count < check.limit);

        let mut decisions = Vec::with_capacity(windows.len());
        for (check, count) in windows.iter().zip(counts) {
            let entries = events.entry(check.key.clone()).or_default();
            let used = if allowed {
                entries.push_back(now);
                count + 1
            } else {
                count
            };
            let oldest = entries.front().copied().unwrap_or(now);
            decisions.push(WindowDecision {
                allowed: count < check.limit,
                remaining: (check.limit - used).max(0),
                reset_at: oldest + check.window,
            });
        }
        Ok(decisions)
    }
}

/// KEYS are the cascade windows; ARGV is `now_ms, member` followed by one
/// `window_ms, limit` pair per key. Expired members are dropped from every
/// key, and `member` is added to every key only when all of them have room.
/// Returns a flat `{has_room, count, oldest_score_ms}` triple per key.
const SLIDING_WINDOW_SCRIPT: &str = r#"
local now = tonumber(ARGV[1])
local member = ARGV[2]
local counts = {}
local all_room = true
for i = 1, #KEYS do
  local window = tonumber(ARGV[1 + 2 * i])
  local limit = tonumber(ARGV[2 + 2 * i])
  redis.call('ZREMRANGEBYSCORE', KEYS[i], 0, now - window)
  counts[i] = redis.call('ZCARD', KEYS[i])
  if counts[i] >= limit then
    all_room = false
  end
end
local out = {}
for i = 1, #KEYS do
  local window = tonumber(ARGV[1 + 2 * i])
  local limit = tonumber(ARGV[2 + 2 * i])
  local has_room = 0
  if counts[i] < limit then
    has_room = 1
  end
  if all_room then
    redis.call('ZADD', KEYS[i], now, member)
    redis.call('PEXPIRE', KEYS[i], window)
    counts[i] = counts[i] + 1
  end
  local oldest = redis.call('ZRANGE', KEYS[i], 0, 0, 'WITHSCORES')
  local oldest_score = now
  if oldest[2] then
    oldest_score = tonumber(oldest[2])
  end
  table.insert(out, has_room)
  table.insert(out, counts[i])
  table.insert(out, oldest_score)
end
return out
"#;

/// Upstash Redis over its REST API.
#[derive(Clone)]
pub struct UpstashBackend {
    http: Client,
    url: Url,
    token: String,
}

impl fmt::Debug for UpstashBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UpstashBackend")
            .field("url", &self.url)
            .finish_non_exhaustive()
    }
}

impl UpstashBackend {
    pub fn new(url: &str, token: String) -> Result<Self> {
        let url = Url::parse(url).context("invalid rate limit URL")?;
        let http = Client::builder()
            .user_agent(concat!("ahorro-notify/", env!("CARGO_PKG_VERSION")))
            .timeout(std::time::Duration::from_secs(3))
            .build()
            .context("failed to build rate limit HTTP client")?;
        Ok(Self { http, url, token })
    }

    pub fn build_request(
        &self,
        windows: &[WindowCheck],
        now: DateTime<Utc>,
    ) -> Result<reqwest::Request> {
        let member = format!("{}-{}", now.timestamp_millis(), Uuid::new_v4());
        let mut command = vec![
            "EVAL".to_string(),
            SLIDING_WINDOW_SCRIPT.to_string(),
            windows.len().to_string(),
        ];
        command.extend(windows.iter().map(|w| w.key.clone()));
        command.push(now.timestamp_millis().to_string());
        command.push(member);
        for w in windows {
            command.push(w.window.num_milliseconds().to_string());
            command.push(w.limit.to_string());
        }
        self.http
            .post(self.url.clone())
            .bearer_auth(&self.token)
            .json(&command)
            .build()
            .context("failed to build rate limit request")
    }
}

#[derive(Deserialize)]
struct UpstashResponse {
    result: Option<Value>,
    error: Option<String>,
}

pub fn parse_script_result(body: &Value, windows: &[WindowCheck]) -> Result<Vec<WindowDecision>> {
    let resp: UpstashResponse =
        serde_json::from_value(body.clone()).context("invalid rate limit response")?;
    if let Some(err) = resp.error {
        return Err(anyhow!("rate limit backend error: {}", err));
    }
    let values: Vec<i64> = resp
        .result
        .ok_or_else(|| anyhow!("rate limit response without result"))
        .and_then(|v| serde_json::from_value(v).context("unexpected rate limit result shape"))?;
    if values.len() != windows.len() * 3 {
        return Err(anyhow!(
            "unexpected rate limit result length {} for {} windows",
            values.len(),
            windows.len()
        ));
    }
    windows
        .iter()
        .zip(values.chunks_exact(3))
        .map(|(check, triple)| {
            let (has_room, count, oldest_ms) = (triple[0], triple[1], triple[2]);
            let oldest = DateTime::<Utc>::from_timestamp_millis(oldest_ms)
                .ok_or_else(|| anyhow!("invalid oldest timestamp {}", oldest_ms))?;
            Ok(WindowDecision {
                allowed: has_room == 1,
                remaining: (check.limit - count).max(0),
                reset_at: oldest + check.window,
            })
        })
        .collect()
}

#[async_trait]
impl RateLimitBackend for UpstashBackend {
    async fn hit(
        &self,
        windows: &[WindowCheck],
        now: DateTime<Utc>,
    ) -> Result<Vec<WindowDecision>> {
        let request = self.build_request(windows, now)?;
        let res = self
            .http
            .execute(request)
            .await
            .context("failed to reach rate limit backend")?;
        let status = res.status();
        let body: Value = res
            .json()
            .await
            .context("failed to read rate limit response")?;
        if !status.is_success() {
            return Err(anyhow!("rate limit backend returned {}: {}", status, body));
        }
        parse_script_result(&body, windows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    struct FailingBackend;

    #[async_trait]
    impl RateLimitBackend for FailingBackend {
        async fn hit(
            &self,
            _windows: &[WindowCheck],
            _now: DateTime<Utc>,
        ) -> Result<Vec<WindowDecision>> {
            Err(anyhow!("connection refused"))
        }
    }

    fn check(key: &str, limit: i64, window: Duration) -> WindowCheck {
        WindowCheck {
            key: key.to_string(),
            limit,
            window,
        }
    }

    #[tokio::test]
    async fn marketing_third_send_in_hour_is_blocked() {
        let limiter = RateLimiter::new(Arc::new(InMemoryBackend::new()));
        let now = Utc::now();

        assert!(limiter
            .check_at(NotificationCategory::Marketing, "u1", now)
            .await
            .is_allowed());
        assert!(limiter
            .check_at(NotificationCategory::Marketing, "u1", now + Duration::minutes(5))
            .await
            .is_allowed());

        let third = limiter
            .check_at(NotificationCategory::Marketing, "u1", now + Duration::minutes(10))
            .await;
        match third {
            RateDecision::Blocked {
                window,
                limit,
                remaining,
                reset_at,
            } => {
                assert_eq!(window, "hour");
                assert_eq!(limit, 2);
                assert_eq!(remaining, 0);
                assert_eq!(reset_at, now + Duration::hours(1));
            }
            RateDecision::Allowed => panic!("third marketing send should be blocked"),
        }

        // Other identifiers have their own counters.
        assert!(limiter
            .check_at(NotificationCategory::Marketing, "u2", now)
            .await
            .is_allowed());
    }

    #[tokio::test]
    async fn marketing_daily_window_blocks_after_hours_pass() {
        let limiter = RateLimiter::new(Arc::new(InMemoryBackend::new()));
        let start = Utc::now();
        for i in 0..5 {
            let at = start + Duration::hours(2 * i);
            assert!(limiter
                .check_at(NotificationCategory::Marketing, "u1", at)
                .await
                .is_allowed());
        }
        let blocked = limiter
            .check_at(NotificationCategory::Marketing, "u1", start + Duration::hours(11))
            .await;
        assert!(matches!(blocked, RateDecision::Blocked { ref window, .. } if window == "day"));
    }

    #[tokio::test]
    async fn attempts_blocked_by_a_later_window_leave_earlier_windows_untouched() {
        let limiter = RateLimiter::new(Arc::new(InMemoryBackend::new()));
        let start = Utc.with_ymd_and_hms(2026, 3, 6, 0, 0, 0).unwrap();
        for i in 0..5 {
            assert!(limiter
                .check_at(NotificationCategory::Marketing, "u1", start + Duration::hours(2 * i))
                .await
                .is_allowed());
        }

        // Hourly room is available every time; only the daily quota is spent.
        let blocked_at = start + Duration::hours(11);
        for offset in 0..3 {
            let decision = limiter
                .check_at(
                    NotificationCategory::Marketing,
                    "u1",
                    blocked_at + Duration::minutes(offset),
                )
                .await;
            match decision {
                RateDecision::Blocked {
                    window,
                    remaining,
                    reset_at,
                    ..
                } => {
                    assert_eq!(window, "day");
                    assert_eq!(remaining, 0);
                    assert_eq!(reset_at, start + Duration::days(1));
                }
                RateDecision::Allowed => panic!("daily quota is spent"),
            }
        }
    }

    #[tokio::test]
    async fn window_slides() {
        let backend = InMemoryBackend::new();
        let now = Utc::now();
        let windows = [check("k", 1, Duration::hours(1))];
        assert!(backend.hit(&windows, now).await.unwrap()[0].allowed);
        assert!(!backend.hit(&windows, now + Duration::minutes(30)).await.unwrap()[0].allowed);
        assert!(backend.hit(&windows, now + Duration::minutes(61)).await.unwrap()[0].allowed);
    }

    #[tokio::test]
    async fn cascade_records_in_every_window_or_none() {
        let backend = InMemoryBackend::new();
        let now = Utc::now();
        let windows = [
            check("short", 5, Duration::hours(1)),
            check("long", 1, Duration::days(1)),
        ];

        let first = backend.hit(&windows, now).await.unwrap();
        assert!(first.iter().all(|d| d.allowed));
        assert_eq!(first[0].remaining, 4);

        let second = backend.hit(&windows, now + Duration::minutes(1)).await.unwrap();
        assert!(second[0].allowed);
        assert!(!second[1].allowed);
        // The rejected attempt was not recorded in the short window.
        assert_eq!(second[0].remaining, 4);
    }

    #[tokio::test]
    async fn unconfigured_limiter_always_allows() {
        let limiter = RateLimiter::disabled();
        assert!(!limiter.is_enabled());
        for _ in 0..100 {
            assert!(limiter
                .check(NotificationCategory::Marketing, "u1")
                .await
                .is_allowed());
        }
    }

    #[tokio::test]
    async fn unreachable_backend_fails_open() {
        let limiter = RateLimiter::new(Arc::new(FailingBackend));
        assert!(limiter
            .check(NotificationCategory::Payment, "u1")
            .await
            .is_allowed());
    }

    #[test]
    fn keys_are_scoped_by_category_window_and_identifier() {
        let rule = rules_for(NotificationCategory::Reminder)[1];
        assert_eq!(
            limit_key(NotificationCategory::Reminder, &rule, "u9"),
            "ratelimit:reminder:day:u9"
        );
    }

    #[test]
    fn parse_script_result_blocked() {
        let windows = [
            check("h", 2, Duration::hours(1)),
            check("d", 5, Duration::days(1)),
        ];
        let body = json!({
            "result": [1, 1, 1_700_000_000_000i64, 0, 5, 1_699_990_000_000i64]
        });
        let decisions = parse_script_result(&body, &windows).unwrap();
        assert!(decisions[0].allowed);
        assert_eq!(decisions[0].remaining, 1);
        assert!(!decisions[1].allowed);
        assert_eq!(decisions[1].remaining, 0);
        assert_eq!(
            decisions[1].reset_at.timestamp_millis(),
            1_699_990_000_000 + 86_400_000
        );

        let short = json!({ "result": [0, 2, 1_700_000_000_000i64] });
        assert!(parse_script_result(&short, &windows).is_err());

        let err = parse_script_result(&json!({ "error": "NOAUTH" }), &windows).unwrap_err();
        assert!(err.to_string().contains("NOAUTH"));
    }

    #[test]
    fn upstash_request_is_an_eval_command() {
        let backend = UpstashBackend::new("https://rl.example", "tok".into()).unwrap();
        let windows = [
            check("ratelimit:marketing:hour:u1", 2, Duration::hours(1)),
            check("ratelimit:marketing:day:u1", 5, Duration::days(1)),
        ];
        let request = backend.build_request(&windows, Utc::now()).unwrap();
        assert_eq!(request.method(), reqwest::Method::POST);
        assert_eq!(
            request
                .headers()
                .get("Authorization")
                .and_then(|h| h.to_str().ok())
                .unwrap(),
            "Bearer tok"
        );
        let body: Value =
            serde_json::from_slice(request.body().unwrap().as_bytes().unwrap()).unwrap();
        assert_eq!(body[0], "EVAL");
        assert_eq!(body[2], "2");
        assert_eq!(body[3], "ratelimit:marketing:hour:u1");
        assert_eq!(body[4], "ratelimit:marketing:day:u1");
        assert_eq!(body[7], "3600000");
        assert_eq!(body[8], "2");
        assert_eq!(body[9], "86400000");
        assert_eq!(body[10], "5");
    }
}
