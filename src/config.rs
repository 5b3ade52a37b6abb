//! Configuration loader and validator for the notification service.
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("YAML parse error: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(&'static str),
}

/// Root configuration struct mirroring the YAML schema exactly.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Config {
    pub app: App,
    pub push: Push,
    #[serde(default)]
    pub rate_limit: Option<RateLimit>,
    #[serde(default)]
    pub alerts: Option<Alerts>,
    #[serde(default)]
    pub monitoring: Monitoring,
    #[serde(default)]
    pub campaigns: Campaigns,
}

/// App-level settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct App {
    pub bind: String,
    pub data_dir: String,
    /// Shared secret expected as `Authorization: Bearer <secret>` on the cron endpoint.
    #[serde(default)]
    pub cron_secret: Option<String>,
}

/// Firebase Cloud Messaging (HTTP v1) settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Push {
    pub project_id: String,
    pub access_token: String,
    #[serde(default)]
    pub base_url: Option<String>,
}

/// Upstash Redis REST endpoint backing the sliding-window limiter.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RateLimit {
    pub url: String,
    pub token: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Alerts {
    pub webhook_url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Monitoring {
    pub stale_after_minutes: i64,
    pub recent_runs: i64,
}

impl Default for Monitoring {
    fn default() -> Self {
        Self {
            stale_after_minutes: 30,
            recent_runs: 10,
        }
    }
}

/// Business thresholds used by the built-in triggers.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Campaigns {
    pub smart_plan_threshold: i64,
    pub debt_reminder_days: i64,
}

impl Default for Campaigns {
    fn default() -> Self {
        Self {
            smart_plan_threshold: 3,
            debt_reminder_days: 3,
        }
    }
}

impl Config {
    /// Ensure required directories exist (creates `app.data_dir` if missing).
    pub fn ensure_dirs(&self) -> Result<(), std::io::Error> {
        if self.app.data_dir.trim().is_empty() {
            return Ok(());
        }
        fs::create_dir_all(&self.app.data_dir)
    }

    /// Default SQLite location inside the data dir; `DATABASE_URL` wins when set.
    pub fn database_url(&self) -> String {
        std::env::var("DATABASE_URL")
            .unwrap_or_else(|_| format!("sqlite://{}/ahorro-notify.db", self.app.data_dir))
    }

    /// Overlay secrets and collaborator endpoints from the process environment.
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(|name| std::env::var(name).ok());
    }

    fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        if let Some(token) = get("PUSH_ACCESS_TOKEN") {
            self.push.access_token = token;
        }
        if let Some(secret) = get("CRON_SECRET") {
            self.app.cron_secret = Some(secret);
        }
        if let Some(url) = get("ALERT_WEBHOOK_URL") {
            self.alerts = Some(Alerts { webhook_url: url });
        }
        match (get("RATE_LIMIT_URL"), get("RATE_LIMIT_TOKEN")) {
            (Some(url), Some(token)) => self.rate_limit = Some(RateLimit { url, token }),
            (Some(url), None) => {
                if let Some(rl) = self.rate_limit.as_mut() {
                    rl.url = url;
                }
            }
            (None, Some(token)) => {
                if let Some(rl) = self.rate_limit.as_mut() {
                    rl.token = token;
                }
            }
            (None, None) => {}
        }
    }
}

/// Load configuration from a YAML file, apply environment overrides and validate it.
/// - If `path` is None, uses `config.yaml` in the current working directory.
pub fn load(path: Option<&Path>) -> Result<Config, ConfigError> {
    let path = path.unwrap_or_else(|| Path::new("config.yaml"));
    let content = fs::read_to_string(path)?;
    let mut cfg: Config = serde_yaml::from_str(&content)?;
    cfg.apply_env_overrides();
    validate(&cfg)?;
    Ok(cfg)
}

/// Validate a configuration instance.
fn validate(cfg: &Config) -> Result<(), ConfigError> {
    if cfg.app.bind.trim().is_empty() {
        return Err(ConfigError::Invalid("app.bind must be non-empty"));
    }
    if cfg.app.data_dir.trim().is_empty() {
        return Err(ConfigError::Invalid("app.data_dir must be non-empty"));
    }

    if cfg.push.project_id.trim().is_empty() {
        return Err(ConfigError::Invalid("push.project_id must be non-empty"));
    }
    if cfg.push.access_token.trim().is_empty() {
        return Err(ConfigError::Invalid("push.access_token must be non-empty"));
    }

    // An absent rate_limit section is legal: the limiter fails open.
    if let Some(rl) = &cfg.rate_limit {
        if !rl.url.starts_with("http://") && !rl.url.starts_with("https://") {
            return Err(ConfigError::Invalid("rate_limit.url must be an http(s) URL"));
        }
        if rl.token.trim().is_empty() {
            return Err(ConfigError::Invalid("rate_limit.token must be non-empty"));
        }
    }

    if let Some(alerts) = &cfg.alerts {
        if !alerts.webhook_url.starts_with("http://") && !alerts.webhook_url.starts_with("https://")
        {
            return Err(ConfigError::Invalid("alerts.webhook_url must be an http(s) URL"));
        }
    }

    if cfg.monitoring.stale_after_minutes <= 0 {
        return Err(ConfigError::Invalid("monitoring.stale_after_minutes must be > 0"));
    }
    if cfg.monitoring.recent_runs <= 0 {
        return Err(ConfigError::Invalid("monitoring.recent_runs must be > 0"));
    }

    if cfg.campaigns.smart_plan_threshold <= 0 {
        return Err(ConfigError::Invalid("campaigns.smart_plan_threshold must be > 0"));
    }
    if cfg.campaigns.debt_reminder_days < 0 {
        return Err(ConfigError::Invalid("campaigns.debt_reminder_days must be >= 0"));
    }

    Ok(())
}

/// Returns the example YAML shipped with the service.
pub fn example() -> &'static str {
    r#"app:
  bind: "0.0.0.0:8080"
  data_dir: "./data"
  cron_secret: "CHANGE_ME"

push:
  project_id: "ahorro365"
  access_token: "YOUR_FCM_ACCESS_TOKEN"

rate_limit:
  url: "https://example.upstash.io"
  token: "YOUR_UPSTASH_REST_TOKEN"

alerts:
  webhook_url: "https://hooks.example.com/ahorro-alerts"

monitoring:
  stale_after_minutes: 30
  recent_runs: 10

campaigns:
  smart_plan_threshold: 3
  debt_reminder_days: 3
"#
}
