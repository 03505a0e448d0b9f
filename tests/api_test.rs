//! HTTP surface

mod common;

use axum::body::{to_bytes, Body};
use axum::http::{Request, StatusCode};
use axum::Router;
use compliance_core::api::router;
use serde_json::Value;
use tower::ServiceExt;

fn request(method: &str, uri: &str, actor: Option<(&str, &str)>) -> Request<Body> {
    let mut builder = Request::builder().method(method).uri(uri);
    if let Some((actor_id, tenant_id)) = actor {
        builder = builder.header("x-actor-id", actor_id).header("x-tenant-id", tenant_id);
    }
    builder.body(Body::empty()).expect("valid request")
}

async fn send(app: &Router, req: Request<Body>) -> Result<(StatusCode, Value), Box<dyn std::error::Error>> {
    let response = app.clone().oneshot(req).await?;
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX).await?;
    let body = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes)?
    };
    Ok((status, body))
}

#[tokio::test]
async fn test_health_endpoint() -> Result<(), Box<dyn std::error::Error>> {
    let h = common::setup().await;
    let app = router(h.state.clone());

    let (status, body) = send(&app, request("GET", "/health", None)).await?;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "healthy");
    Ok(())
}

#[tokio::test]
async fn test_verify_requires_matching_tenant() -> Result<(), Box<dyn std::error::Error>> {
    let h = common::setup().await;
    h.state.access.record_access(common::care_access("clinic-a", "p-a1")).await?;
    let app = router(h.state.clone());

    let (status, _) = send(&app, request("GET", "/tenants/clinic-a/ledger/verify", None)).await?;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, _) = send(
        &app,
        request("GET", "/tenants/clinic-a/ledger/verify", Some(("auditor-b", "clinic-b"))),
    )
    .await?;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, body) = send(
        &app,
        request("GET", "/tenants/clinic-a/ledger/verify", Some(("auditor-a", "clinic-a"))),
    )
    .await?;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["is_valid"], true);
    assert_eq!(body["total_checked"], 1);
    Ok(())
}

#[tokio::test]
async fn test_run_health_check_endpoint() -> Result<(), Box<dyn std::error::Error>> {
    let h = common::setup().await;
    let app = router(h.state.clone());
    let actor = Some(("ops-a", "clinic-a"));

    let (status, body) = send(
        &app,
        request("POST", "/tenants/clinic-a/health-checks/ledger_integrity", actor),
    )
    .await?;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "passed");
    assert_eq!(body["check_type"], "ledger_integrity");

    let (status, _) = send(&app, request("POST", "/tenants/clinic-a/health-checks/backups", actor)).await?;
    assert_eq!(status, StatusCode::NOT_FOUND);
    Ok(())
}

#[tokio::test]
async fn test_alert_listing_and_resolution() -> Result<(), Box<dyn std::error::Error>> {
    let h = common::setup().await;
    h.state.access.record_access(common::care_access("clinic-a", "p-b1")).await?;
    let app = router(h.state.clone());
    let officer = Some(("officer-a", "clinic-a"));

    let (status, body) = send(&app, request("GET", "/tenants/clinic-a/alerts", officer)).await?;
    assert_eq!(status, StatusCode::OK);
    let alerts = body.as_array().ok_or("expected a list")?;
    assert_eq!(alerts.len(), 1);
    let id = alerts[0]["id"].as_i64().ok_or("missing id")?;
    let uri = format!("/alerts/{}/resolve", id);

    // The owning tenant may not resolve an alert raised in another tenant.
    let (status, _) = send(&app, request("POST", &uri, Some(("officer-b", "clinic-b")))).await?;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, body) = send(&app, request("POST", &uri, officer)).await?;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "resolved");
    assert_eq!(body["resolved_by"], "officer-a");

    // Retries are safe.
    let (status, body) = send(&app, request("POST", &uri, officer)).await?;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["resolved_by"], "officer-a");

    let (status, _) = send(&app, request("POST", "/alerts/9999/resolve", officer)).await?;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (_, body) = send(&app, request("GET", "/tenants/clinic-a/alerts", officer)).await?;
    assert_eq!(body.as_array().map(Vec::len), Some(0));
    Ok(())
}

#[tokio::test]
async fn test_report_and_export_endpoints() -> Result<(), Box<dyn std::error::Error>> {
    let h = common::setup().await;
    h.state.access.record_access(common::care_access("clinic-a", "p-a1")).await?;
    let app = router(h.state.clone());
    let actor = Some(("auditor-a", "clinic-a"));

    let uri = "/tenants/clinic-a/report?start=2020-01-01T00:00:00Z&end=2100-01-01T00:00:00Z";
    let (status, body) = send(&app, request("GET", uri, actor)).await?;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["overall_status"], "NON-COMPLIANT");
    assert_eq!(body["counts"]["access_records"], 1);

    let bad = "/tenants/clinic-a/report?start=2100-01-01T00:00:00Z&end=2020-01-01T00:00:00Z";
    let (status, _) = send(&app, request("GET", bad, actor)).await?;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, body) = send(&app, request("GET", "/tenants/clinic-a/patients/p-a1/export", actor)).await?;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["requested_by"], "auditor-a");
    assert_eq!(body["access_records"].as_array().map(Vec::len), Some(1));
    Ok(())
}
