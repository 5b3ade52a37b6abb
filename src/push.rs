//! Push-messaging collaborator: Firebase Cloud Messaging HTTP v1.
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use reqwest::{Client, StatusCode, Url};
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::fmt;
use tracing::{debug, warn};

use crate::config::Config;

const FCM_API_BASE: &str = "https://fcm.googleapis.com/";

/// A composed notification addressed to one device token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PushMessage {
    pub token: String,
    pub title: String,
    pub body: String,
    pub data: BTreeMap<String, String>,
}

#[async_trait]
pub trait PushSender: Send + Sync {
    /// Deliver one message; returns the provider's message id.
    async fn send(&self, message: &PushMessage) -> Result<String>;
}

#[derive(Clone)]
pub struct FcmClient {
    http: Client,
    base_url: Url,
    project_id: String,
    access_token: String,
}

impl fmt::Debug for FcmClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FcmClient")
            .field("base_url", &self.base_url)
            .field("project_id", &self.project_id)
            .finish_non_exhaustive()
    }
}

impl FcmClient {
    pub fn new(project_id: String, access_token: String) -> Result<Self> {
        let base_url = Url::parse(FCM_API_BASE).context("invalid default FCM URL")?;
        Self::with_base_url(project_id, access_token, base_url)
    }

    pub fn with_base_url(project_id: String, access_token: String, base_url: Url) -> Result<Self> {
        let http = Client::builder()
            .user_agent(concat!("ahorro-notify/", env!("CARGO_PKG_VERSION")))
            .timeout(std::time::Duration::from_secs(10))
            .build()
            .context("failed to build push HTTP client")?;
        Ok(Self {
            http,
            base_url,
            project_id,
            access_token,
        })
    }

    pub fn from_config(cfg: &Config) -> Result<Self> {
        match cfg.push.base_url.as_deref() {
            Some(base) => {
                let base_url = Url::parse(base).context("invalid push.base_url")?;
                Self::with_base_url(cfg.push.project_id.clone(), cfg.push.access_token.clone(), base_url)
            }
            None => Self::new(cfg.push.project_id.clone(), cfg.push.access_token.clone()),
        }
    }

    pub fn build_request(&self, message: &PushMessage) -> Result<reqwest::Request> {
        let endpoint = self
            .base_url
            .join(&format!("v1/projects/{}/messages:send", self.project_id))
            .context("invalid FCM base URL")?;
        self.http
            .post(endpoint)
            .bearer_auth(&self.access_token)
            .header("Content-Type", "application/json")
            .json(&build_message_body(message))
            .build()
            .context("failed to build FCM request")
    }
}

#[async_trait]
impl PushSender for FcmClient {
    async fn send(&self, message: &PushMessage) -> Result<String> {
        let request = self.build_request(message)?;
        debug!(url = %request.url(), "sending push message");

        let res = self
            .http
            .execute(request)
            .await
            .context("failed to reach FCM")?;

        let status = res.status();
        if status == StatusCode::NOT_FOUND || status == StatusCode::BAD_REQUEST {
            let body = res.text().await.unwrap_or_default();
            warn!(%status, "FCM rejected device token");
            return Err(anyhow!("invalid device token ({}): {}", status, body));
        }
        if !status.is_success() {
            let body = res.text().await.unwrap_or_default();
            warn!(%status, "FCM API error");
            return Err(anyhow!("fcm error {}: {}", status, body));
        }

        let payload: SendResponse = res.json().await.context("invalid FCM response JSON")?;
        Ok(payload.name)
    }
}

pub fn build_message_body(message: &PushMessage) -> Value {
    let mut msg = json!({
        "token": message.token,
        "notification": {
            "title": message.title,
            "body": message.body,
        },
    });
    if !message.data.is_empty() {
        msg["data"] = json!(message.data);
    }
    json!({ "message": msg })
}

#[derive(Deserialize)]
struct SendResponse {
    name: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_message() -> PushMessage {
        PushMessage {
            token: "device-1".into(),
            title: "Hola".into(),
            body: "Tu referido se verificó".into(),
            data: BTreeMap::from([("trigger".to_string(), "referral-verified".to_string())]),
        }
    }

    #[test]
    fn build_message_body_includes_notification_and_data() {
        let body = build_message_body(&sample_message());
        assert_eq!(body["message"]["token"], "device-1");
        assert_eq!(body["message"]["notification"]["title"], "Hola");
        assert_eq!(body["message"]["data"]["trigger"], "referral-verified");
    }

    #[test]
    fn build_message_body_omits_empty_data() {
        let mut msg = sample_message();
        msg.data.clear();
        let body = build_message_body(&msg);
        assert!(body["message"].get("data").is_none());
    }

    #[test]
    fn build_request_sets_headers() {
        let client = FcmClient::new("ahorro365".into(), "token".into()).unwrap();
        let request = client.build_request(&sample_message()).unwrap();
        assert_eq!(request.method(), reqwest::Method::POST);
        assert_eq!(
            request.url().path(),
            "/v1/projects/ahorro365/messages:send"
        );
        let headers = request.headers();
        assert_eq!(
            headers
                .get("Authorization")
                .and_then(|h| h.to_str().ok())
                .unwrap(),
            "Bearer token"
        );
        assert_eq!(
            headers
                .get("Content-Type")
                .and_then(|h| h.to_str().ok())
                .unwrap(),
            "application/json"
        );
    }

    #[test]
    fn debug_redacts_token() {
        let client = FcmClient::new("p".into(), "super-secret".into()).unwrap();
        assert!(!format!("{:?}", client).contains("super-secret"));
    }
}
