use std::sync::Arc;

use axum::{
    body::Body,
    http::{Request, StatusCode},
    Router,
};
use serde_json::{json, Value};
use tower::ServiceExt;

use crate::api::{router, ApiState};
use crate::fixtures::{harness, open_instant, Harness};
use crate::principal::{HeaderPrincipalResolver, HEADER_EMAIL, HEADER_ID, HEADER_NAME, HEADER_ROLE};

fn app(h: &Harness) -> Router {
    router(Arc::new(ApiState {
        engine: h.engine.clone(),
        resolver: Arc::new(HeaderPrincipalResolver),
    }))
}

fn request(method: &str, uri: &str, as_principal: Option<(&str, &str)>, body: Option<Value>) -> Request<Body> {
    let mut builder = Request::builder().method(method).uri(uri);
    if let Some((id, role)) = as_principal {
        builder = builder
            .header(HEADER_ID, id)
            .header(HEADER_NAME, id)
            .header(HEADER_EMAIL, format!("{id}@brokerage.test"))
            .header(HEADER_ROLE, role);
    }
    match body {
        Some(body) => builder
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    }
}

async fn send(app: &Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let body = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, body)
}

fn project_body() -> Value {
    json!({
        "title": "Thesis",
        "description": "Final-year report",
        "due_date": "2026-12-01",
        "team_size": 2,
        "report_copies": 1
    })
}

#[tokio::test]
async fn test_health() {
    let h = harness().await;
    let (status, body) = send(&app(&h), request("GET", "/health", None, None)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
}

#[tokio::test]
async fn test_missing_principal_is_unauthenticated() {
    let h = harness().await;
    let (status, body) = send(
        &app(&h),
        request("POST", "/projects", None, Some(project_body())),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["success"], false);
    assert_eq!(body["error"]["kind"], "unauthenticated");
}

#[tokio::test]
async fn test_project_flow_over_http() {
    let h = harness().await;
    let app = app(&h);

    let (status, body) = send(
        &app,
        request("POST", "/projects", Some(("student-1", "student")), Some(project_body())),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["success"], true);
    assert_eq!(body["data"]["status"], "pending_payment");
    let id = body["data"]["id"].as_str().unwrap().to_string();

    let payment = json!({
        "transaction_id": "T1",
        "amount": "100.00",
        "payer": { "id": "student-1", "email": "student-1@brokerage.test", "name": "student-1" }
    });
    let uri = format!("/projects/{id}/payments");
    let (status, body) = send(
        &app,
        request("POST", &uri, Some(("student-1", "student")), Some(payment.clone())),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["project"]["status"], "paid");
    assert_eq!(body["data"]["payment"]["amount"], "100.00");
    assert!(body.get("replayed").is_none());

    let (status, body) = send(
        &app,
        request("POST", &uri, Some(("student-1", "student")), Some(payment)),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["replayed"], true);

    // Completing before assignment is a conflict.
    let (status, body) = send(
        &app,
        request(
            "POST",
            &format!("/projects/{id}/complete"),
            Some(("admin-1", "admin")),
            None,
        ),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["error"]["kind"], "invalid_state");

    let (status, body) = send(
        &app,
        request(
            "POST",
            &format!("/projects/{id}/assign"),
            Some(("admin-1", "admin")),
            Some(json!({ "agent_id": "agent-1" })),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["status"], "in_progress");
}

#[tokio::test]
async fn test_malformed_body_is_bad_request() {
    let h = harness().await;
    let (status, body) = send(
        &app(&h),
        request(
            "POST",
            "/projects",
            Some(("student-1", "student")),
            Some(json!({ "title": "No due date" })),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["kind"], "validation");
}

#[tokio::test]
async fn test_purchase_when_market_closed_is_locked() {
    let h = harness().await;
    let app = app(&h);

    let (status, body) = send(
        &app,
        request(
            "POST",
            "/listings",
            Some(("student-1", "student")),
            Some(json!({ "title": "Notes", "price": 25, "original_price": "40.00" })),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["data"]["discount"], 38);
    let id = body["data"]["id"].as_str().unwrap().to_string();

    let purchase = json!({
        "transaction_id": "P1",
        "amount": 25,
        "payer": { "id": "student-2", "email": "student-2@brokerage.test", "name": "student-2" }
    });
    let uri = format!("/listings/{id}/purchases");
    let (status, body) = send(
        &app,
        request("POST", &uri, Some(("student-2", "student")), Some(purchase.clone())),
    )
    .await;
    assert_eq!(status, StatusCode::LOCKED);
    assert_eq!(body["error"]["kind"], "market_closed");

    h.clock.set(open_instant());
    let (status, body) = send(
        &app,
        request("POST", &uri, Some(("student-2", "student")), Some(purchase)),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["data"]["listing_title"], "Notes");
}

#[tokio::test]
async fn test_market_status_and_listings() {
    let h = harness().await;
    let app = app(&h);

    let (status, body) = send(&app, request("GET", "/market/status", None, None)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["is_open"], false);
    assert_eq!(body["data"]["time_remaining"], "Opens in 10 hours");

    let (status, body) = send(&app, request("GET", "/listings", None, None)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["count"], 0);
    assert_eq!(body["data"]["market"]["is_open"], false);
}

#[tokio::test]
async fn test_analytics_requires_admin() {
    let h = harness().await;
    let app = app(&h);

    let (status, body) = send(
        &app,
        request("GET", "/analytics", Some(("student-1", "student")), None),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["error"]["kind"], "forbidden");

    let (status, body) = send(
        &app,
        request("GET", "/analytics", Some(("admin-1", "admin")), None),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["revenue"]["monthly"].as_array().unwrap().len(), 6);
    assert_eq!(body["data"]["revenue"]["total"], "0.00");
}

#[tokio::test]
async fn test_principal_without_email_is_rejected() {
    let h = harness().await;
    let request = Request::builder()
        .method("GET")
        .uri("/projects")
        .header(HEADER_ID, "student-1")
        .header(HEADER_ROLE, "student")
        .body(Body::empty())
        .unwrap();
    let (status, body) = send(&app(&h), request).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["kind"], "validation");
}
