use ahorro_notify::api::{router, AppState};
use ahorro_notify::config::{Campaigns, Monitoring};
use ahorro_notify::db;
use ahorro_notify::eligibility::EligibilityEvaluator;
use ahorro_notify::executor::TriggerExecutor;
use ahorro_notify::push::{PushMessage, PushSender};
use ahorro_notify::ratelimit::RateLimiter;
use anyhow::Result;
use async_trait::async_trait;
use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use chrono::Utc;
use http_body_util::BodyExt;
use serde_json::Value;
use std::sync::Arc;
use tower::ServiceExt;

struct AcceptAll;

#[async_trait]
impl PushSender for AcceptAll {
    async fn send(&self, message: &PushMessage) -> Result<String> {
        Ok(format!("projects/test/messages/{}", message.token))
    }
}

async fn setup() -> (AppState, sqlx::SqlitePool) {
    let pool = sqlx::SqlitePool::connect("sqlite::memory:").await.unwrap();
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    let evaluator = EligibilityEvaluator::new(pool.clone(), Campaigns::default());
    let executor = TriggerExecutor::new(
        pool.clone(),
        evaluator,
        RateLimiter::disabled(),
        Arc::new(AcceptAll),
    );
    let state = AppState {
        executor: Arc::new(executor),
        pool: pool.clone(),
        monitoring: Monitoring::default(),
        cron_secret: Some("cron-secret".into()),
        alerts: None,
    };
    (state, pool)
}

async fn json_body(response: axum::response::Response) -> Value {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn unknown_trigger_returns_404() {
    let (state, _pool) = setup().await;
    let response = router(state)
        .oneshot(
            Request::post("/api/notifications/triggers/weekly-digest")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    let body = json_body(response).await;
    assert_eq!(body["success"], false);
    assert!(body["message"].as_str().unwrap().contains("weekly-digest"));
}

#[tokio::test]
async fn malformed_body_returns_400() {
    let (state, _pool) = setup().await;
    let response = router(state)
        .oneshot(
            Request::post("/api/notifications/triggers/referral-verified")
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from("{not json"))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn trigger_for_entity_returns_summary() {
    let (state, pool) = setup().await;
    db::upsert_user(&pool, "u1", Some("Ana"), "free").await.unwrap();
    db::add_push_token(&pool, "u1", "token-u1", "ios").await.unwrap();
    db::insert_referral(&pool, "r1", "u1", Some("Luis")).await.unwrap();
    db::verify_referral(&pool, "r1", "u2", Utc::now()).await.unwrap();

    let response = router(state)
        .oneshot(
            Request::post("/api/notifications/triggers/referral-verified")
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(r#"{"entity_id":"r1"}"#))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await;
    assert_eq!(body["success"], true);
    assert_eq!(body["result"]["trigger"], "referral-verified");
    assert_eq!(body["result"]["sent"], 1);
    assert_eq!(body["result"]["outcomes"][0]["outcome"], "sent");
}

#[tokio::test]
async fn lists_every_trigger_with_last_run() {
    let (state, _pool) = setup().await;
    state
        .executor
        .run_trigger("debt-due-reminder", None)
        .await
        .unwrap();

    let response = router(state)
        .oneshot(
            Request::get("/api/notifications/triggers")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await;
    let data = body["data"].as_array().unwrap();
    assert_eq!(data.len(), 4);

    let debt = data.iter().find(|t| t["key"] == "debt-due-reminder").unwrap();
    assert_eq!(debt["category"], "reminder");
    assert_eq!(debt["last_run_status"], "success");
    let invited = data.iter().find(|t| t["key"] == "referral-invited").unwrap();
    assert!(invited["last_run_at"].is_null());
}

#[tokio::test]
async fn cron_endpoint_requires_secret() {
    let (state, pool) = setup().await;
    let app = router(state);

    let rejected = app
        .clone()
        .oneshot(
            Request::post("/api/cron/process-triggers")
                .header(header::AUTHORIZATION, "Bearer wrong")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(rejected.status(), StatusCode::UNAUTHORIZED);
    assert!(db::recent_cron_health(&pool, 10).await.unwrap().is_empty());

    let accepted = app
        .oneshot(
            Request::post("/api/cron/process-triggers")
                .header(header::AUTHORIZATION, "Bearer cron-secret")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(accepted.status(), StatusCode::OK);
    let body = json_body(accepted).await;
    assert_eq!(body["result"]["triggers_evaluated"], 4);
    assert_eq!(db::recent_cron_health(&pool, 10).await.unwrap().len(), 1);
}

#[tokio::test]
async fn monitoring_reports_missing_runs() {
    let (state, _pool) = setup().await;
    let response = router(state)
        .oneshot(
            Request::get("/api/monitoring/cron")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await;
    assert_eq!(body["healthy"], false);
    assert_eq!(body["issues"][0]["kind"], "no_runs");
}

#[tokio::test]
async fn health_check_is_ok() {
    let (state, _pool) = setup().await;
    let response = router(state)
        .oneshot(Request::get("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}
