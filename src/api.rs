//! HTTP routes for triggering notifications and reading run health.
use axum::{
    body::Bytes,
    extract::{Path, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{error, warn};

use crate::alerts::AlertNotifier;
use crate::config::Monitoring;
use crate::db::{self, Pool};
use crate::error::NotifyError;
use crate::executor::{RunPayload, TriggerExecutor};
use crate::health;
use crate::model::NotificationCategory;
use crate::scheduler;
use crate::triggers::{self, EntityKind};

/// Shared state handed to every route.
#[derive(Clone)]
pub struct AppState {
    pub executor: Arc<TriggerExecutor>,
    pub pool: Pool,
    pub monitoring: Monitoring,
    pub cron_secret: Option<String>,
    pub alerts: Option<Arc<AlertNotifier>>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/api/notifications/triggers", get(list_triggers))
        .route("/api/notifications/triggers/{key}", post(run_trigger))
        .route("/api/monitoring/cron", get(cron_monitoring))
        .route("/api/cron/process-triggers", post(process_triggers))
        .with_state(state)
}

impl IntoResponse for NotifyError {
    fn into_response(self) -> Response {
        let status = match &self {
            NotifyError::NotFound(_) => StatusCode::NOT_FOUND,
            NotifyError::Validation(_) => StatusCode::BAD_REQUEST,
            NotifyError::PreconditionFailed(_) => StatusCode::UNPROCESSABLE_ENTITY,
            NotifyError::RateLimited(_) => StatusCode::TOO_MANY_REQUESTS,
            NotifyError::Infrastructure(err) => {
                error!(?err, "request failed");
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        let message = match &self {
            NotifyError::Infrastructure(_) => "internal error while executing trigger".to_string(),
            other => other.to_string(),
        };
        (status, Json(json!({ "success": false, "message": message }))).into_response()
    }
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

/// POST /api/notifications/triggers/{key} - run one trigger, optionally for one entity
async fn run_trigger(
    State(state): State<AppState>,
    Path(key): Path<String>,
    body: Bytes,
) -> Result<Json<serde_json::Value>, NotifyError> {
    let payload = if body.iter().all(u8::is_ascii_whitespace) {
        None
    } else {
        let payload: RunPayload = serde_json::from_slice(&body)
            .map_err(|e| NotifyError::Validation(format!("invalid JSON body: {}", e)))?;
        Some(payload)
    };

    let summary = state.executor.run_trigger(&key, payload).await?;
    Ok(Json(json!({ "success": true, "result": summary })))
}

#[derive(Serialize)]
struct TriggerInfo {
    key: &'static str,
    label: &'static str,
    category: NotificationCategory,
    entity: EntityKind,
    selection: &'static str,
    last_run_at: Option<DateTime<Utc>>,
    last_run_status: Option<String>,
    last_summary: Option<serde_json::Value>,
}

/// GET /api/notifications/triggers - known triggers with their last run
async fn list_triggers(
    State(state): State<AppState>,
) -> Result<Json<serde_json::Value>, NotifyError> {
    let mut runs: HashMap<String, db::TriggerRunRow> = db::trigger_runs(&state.pool)
        .await?
        .into_iter()
        .map(|r| (r.key.clone(), r))
        .collect();

    let data: Vec<TriggerInfo> = triggers::definitions()
        .iter()
        .map(|def| {
            let run = runs.remove(def.key.as_str());
            TriggerInfo {
                key: def.key.as_str(),
                label: def.label,
                category: def.category,
                entity: def.entity,
                selection: def.selection,
                last_run_at: run.as_ref().and_then(|r| r.last_run_at),
                last_run_status: run.as_ref().and_then(|r| r.last_run_status.clone()),
                last_summary: run.and_then(|r| r.last_summary),
            }
        })
        .collect();
    Ok(Json(json!({ "success": true, "data": data })))
}

/// GET /api/monitoring/cron - last health record, recent records and derived issues
async fn cron_monitoring(
    State(state): State<AppState>,
) -> Result<Json<health::MonitoringSummary>, NotifyError> {
    let summary = health::monitoring_summary(&state.pool, &state.monitoring, Utc::now()).await?;
    Ok(Json(summary))
}

fn cron_authorized(secret: Option<&str>, headers: &HeaderMap) -> bool {
    let Some(secret) = secret else {
        return true;
    };
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .is_some_and(|token| token == secret)
}

/// POST /api/cron/process-triggers - one scheduled pass over every campaign
async fn process_triggers(State(state): State<AppState>, headers: HeaderMap) -> Response {
    if !cron_authorized(state.cron_secret.as_deref(), &headers) {
        warn!("rejected cron request with bad credentials");
        return (
            StatusCode::UNAUTHORIZED,
            Json(json!({ "success": false, "message": "unauthorized" })),
        )
            .into_response();
    }

    match scheduler::run_scheduled(
        &state.executor,
        &state.pool,
        &state.monitoring,
        state.alerts.as_deref(),
        Utc::now(),
    )
    .await
    {
        Ok(report) => {
            let status = if report.success {
                StatusCode::OK
            } else {
                StatusCode::INTERNAL_SERVER_ERROR
            };
            (
                status,
                Json(json!({ "success": report.success, "result": report })),
            )
                .into_response()
        }
        Err(err) => NotifyError::Infrastructure(err).into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn cron_auth_without_secret_is_open() {
        assert!(cron_authorized(None, &HeaderMap::new()));
    }

    #[test]
    fn cron_auth_requires_matching_bearer() {
        let mut headers = HeaderMap::new();
        assert!(!cron_authorized(Some("s3cret"), &headers));

        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Bearer nope"));
        assert!(!cron_authorized(Some("s3cret"), &headers));

        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Bearer s3cret"));
        assert!(cron_authorized(Some("s3cret"), &headers));
    }

    #[test]
    fn not_found_maps_to_404() {
        let response = NotifyError::trigger_not_found("nope").into_response();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn infrastructure_maps_to_500() {
        let response =
            NotifyError::Infrastructure(anyhow::anyhow!("pool timed out")).into_response();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
