use anyhow::{anyhow, Context, Result};
use reqwest::{Client, Url};
use serde_json::{json, Value};
use std::fmt;
use tracing::info;

use crate::config::Config;
use crate::health::HealthIssue;

/// Posts operational alerts to a chat-style incoming webhook.
#[derive(Clone)]
pub struct AlertNotifier {
    http: Client,
    url: Url,
}

impl fmt::Debug for AlertNotifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Webhook URLs embed their secret in the path.
        f.debug_struct("AlertNotifier")
            .field("host", &self.url.host_str())
            .finish_non_exhaustive()
    }
}

impl AlertNotifier {
    pub fn new(url: &str) -> Result<Self> {
        let url = Url::parse(url).context("invalid alert webhook URL")?;
        let http = Client::builder()
            .user_agent(concat!("ahorro-notify/", env!("CARGO_PKG_VERSION")))
            .timeout(std::time::Duration::from_secs(5))
            .build()
            .context("failed to build alert HTTP client")?;
        Ok(Self { http, url })
    }

    pub fn from_config(cfg: &Config) -> Result<Option<Self>> {
        cfg.alerts
            .as_ref()
            .map(|a| Self::new(&a.webhook_url))
            .transpose()
    }

    pub fn build_request(&self, payload: &Value) -> Result<reqwest::Request> {
        self.http
            .post(self.url.clone())
            .json(payload)
            .build()
            .context("failed to build alert request")
    }

    pub async fn send(&self, title: &str, issues: &[HealthIssue]) -> Result<()> {
        let payload = build_alert_payload(title, issues);
        let request = self.build_request(&payload)?;
        let res = self
            .http
            .execute(request)
            .await
            .context("failed to reach alert webhook")?;
        if !res.status().is_success() {
            let status = res.status();
            let body = res.text().await.unwrap_or_default();
            return Err(anyhow!("alert webhook error {}: {}", status, body));
        }
        info!(issues = issues.len(), "alert delivered");
        Ok(())
    }
}

pub fn build_alert_payload(title: &str, issues: &[HealthIssue]) -> Value {
    let lines: Vec<String> = issues
        .iter()
        .map(|i| format!("- [{:?}] {}", i.severity, i.message))
        .collect();
    let text = if lines.is_empty() {
        format!("[ahorro-notify] {}", title)
    } else {
        format!("[ahorro-notify] {}\n{}", title, lines.join("\n"))
    };
    json!({
        "text": text,
        "issues": issues,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::health::{IssueKind, Severity};

    #[test]
    fn payload_lists_issues() {
        let issues = vec![HealthIssue {
            kind: IssueKind::LastRunFailed,
            severity: Severity::Critical,
            message: "last run failed: db down".into(),
        }];
        let payload = build_alert_payload("scheduled trigger run failed", &issues);
        let text = payload["text"].as_str().unwrap();
        assert!(text.starts_with("[ahorro-notify] scheduled trigger run failed"));
        assert!(text.contains("- [Critical] last run failed: db down"));
        assert_eq!(payload["issues"][0]["kind"], "last_run_failed");
    }

    #[test]
    fn debug_hides_webhook_path() {
        let notifier = AlertNotifier::new("https://hooks.example.com/T000/SECRET").unwrap();
        let rendered = format!("{:?}", notifier);
        assert!(rendered.contains("hooks.example.com"));
        assert!(!rendered.contains("SECRET"));
    }
}
