use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::Json,
};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::warn;

use crate::api::identity::HeaderIdentity;
use crate::api::AppState;
use crate::database::now;
use crate::error::ComplianceError;
use crate::external::{Actor, IdentityProvider};
use crate::health::CheckType;

type ApiResponse = (StatusCode, Json<Value>);

fn error_response(err: &ComplianceError) -> ApiResponse {
    let status = match err {
        ComplianceError::Validation(_) => StatusCode::BAD_REQUEST,
        ComplianceError::NotFound(_) => StatusCode::NOT_FOUND,
        ComplianceError::InvalidTransition { .. }
        | ComplianceError::ConcurrentAppendConflict { .. }
        | ComplianceError::AlreadyResolved(_) => StatusCode::CONFLICT,
        ComplianceError::StoreUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (
        status,
        Json(json!({ "error": err.to_string(), "retryable": err.is_retryable() })),
    )
}

fn ok<T: serde::Serialize>(value: &T) -> ApiResponse {
    match serde_json::to_value(value) {
        Ok(body) => (StatusCode::OK, Json(body)),
        Err(e) => error_response(&ComplianceError::from(e)),
    }
}

/// Actor from gateway headers, confined to the tenant in the path.
fn authorize(headers: &HeaderMap, tenant_id: &str) -> Result<Actor, ApiResponse> {
    let actor = HeaderIdentity::from_headers(headers)
        .current_actor()
        .map_err(|e| (StatusCode::UNAUTHORIZED, Json(json!({ "error": e.to_string() }))))?;
    if actor.tenant_id != tenant_id {
        warn!(
            "Actor {} of tenant {} denied access to tenant {}",
            actor.actor_id, actor.tenant_id, tenant_id
        );
        return Err((
            StatusCode::FORBIDDEN,
            Json(json!({ "error": "actor does not belong to this tenant" })),
        ));
    }
    Ok(actor)
}

pub async fn health_check() -> Json<Value> {
    Json(json!({
        "status": "healthy",
        "service": "compliance-core",
        "timestamp": Utc::now()
    }))
}

pub async fn verify_ledger(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(tenant_id): Path<String>,
) -> ApiResponse {
    if let Err(denied) = authorize(&headers, &tenant_id) {
        return denied;
    }
    match state.ledger.verify_chain(&tenant_id, None, None).await {
        Ok(result) => ok(&result),
        Err(e) => error_response(&e),
    }
}

#[derive(Debug, Deserialize)]
pub struct ReportQuery {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub as_of: Option<DateTime<Utc>>,
}

pub async fn certification_report(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(tenant_id): Path<String>,
    Query(query): Query<ReportQuery>,
) -> ApiResponse {
    if let Err(denied) = authorize(&headers, &tenant_id) {
        return denied;
    }
    let as_of = query.as_of.unwrap_or_else(now);
    match state
        .reports
        .generate_certification_report(&tenant_id, query.start, query.end, as_of)
        .await
    {
        Ok(report) => ok(&report),
        Err(e) => error_response(&e),
    }
}

pub async fn export_subject(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path((tenant_id, patient_id)): Path<(String, String)>,
) -> ApiResponse {
    let actor = match authorize(&headers, &tenant_id) {
        Ok(actor) => actor,
        Err(denied) => return denied,
    };
    match state
        .reports
        .export_subject_data(&tenant_id, &patient_id, &actor.actor_id)
        .await
    {
        Ok(export) => ok(&export),
        Err(e) => error_response(&e),
    }
}

pub async fn open_alerts(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(tenant_id): Path<String>,
) -> ApiResponse {
    if let Err(denied) = authorize(&headers, &tenant_id) {
        return denied;
    }
    match state.monitor.open_alerts(Some(&tenant_id)).await {
        Ok(alerts) => ok(&alerts),
        Err(e) => error_response(&e),
    }
}

pub async fn resolve_alert(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(alert_id): Path<i64>,
) -> ApiResponse {
    let alert = match state.monitor.get(alert_id).await {
        Ok(alert) => alert,
        Err(e) => return error_response(&e),
    };
    let actor = match authorize(&headers, &alert.source_tenant_id) {
        Ok(actor) => actor,
        Err(denied) => return denied,
    };
    match state.monitor.resolve_idempotent(alert_id, &actor.actor_id).await {
        Ok(alert) => ok(&alert),
        Err(e) => error_response(&e),
    }
}

pub async fn run_health_check(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path((tenant_id, check)): Path<(String, String)>,
) -> ApiResponse {
    if let Err(denied) = authorize(&headers, &tenant_id) {
        return denied;
    }
    let Some(check) = CheckType::from_str(&check) else {
        return error_response(&ComplianceError::not_found(format!("health check {}", check)));
    };
    let result = state.scheduler.run(check, Some(&tenant_id)).await;
    ok(&result)
}
