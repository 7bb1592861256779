use std::sync::Arc;

use axum::body::Body;
use http::{header, Method, Request, StatusCode};
use remoterl_relay::test_util::{create_test_account, create_test_state, TEST_ADMIN_TOKEN};
use remoterl_relay::{app, AppState};
use serde_json::{json, Value};
use tempfile::TempDir;
use tower::ServiceExt;

fn setup() -> (TempDir, Arc<AppState>) {
    let dir = tempfile::tempdir().unwrap();
    let url = dir.path().join("ledger.db");
    let state = Arc::new(create_test_state(url.to_str().unwrap()));
    (dir, state)
}

async fn send(
    state: &Arc<AppState>,
    method: Method,
    uri: &str,
    token: Option<&str>,
    body: Option<Value>,
) -> (StatusCode, Value) {
    let mut builder = Request::builder().method(method).uri(uri);
    if let Some(token) = token {
        builder = builder.header(header::AUTHORIZATION, format!("Bearer {}", token));
    }
    let body = match body {
        Some(json) => {
            builder = builder.header(header::CONTENT_TYPE, "application/json");
            Body::from(json.to_string())
        }
        None => Body::empty(),
    };

    let response = app(state.clone())
        .oneshot(builder.body(body).unwrap())
        .await
        .unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, value)
}

#[tokio::test]
async fn test_health_is_public() {
    let (_dir, state) = setup();
    let (status, body) = send(&state, Method::GET, "/health", None, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
    assert_eq!(body["region"], "local");
}

#[tokio::test]
async fn test_metrics_report_counts() {
    let (_dir, state) = setup();
    let request = Request::builder()
        .uri("/metrics")
        .body(Body::empty())
        .unwrap();
    let response = app(state).oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let text = String::from_utf8(bytes.to_vec()).unwrap();
    assert!(text.contains("remoterl_up 1"));
    assert!(text.contains("remoterl_sessions 0"));
}

#[tokio::test]
async fn test_operator_routes_require_token() {
    let (_dir, state) = setup();
    for (method, uri) in [
        (Method::GET, "/admin/accounts"),
        (Method::GET, "/dashboard/accounts"),
        (Method::GET, "/dashboard/accounts/some-id"),
    ] {
        let (status, body) = send(&state, method.clone(), uri, None, None).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED, "{} {}", method, uri);
        assert_eq!(body["error"]["code"], "AUTH-102");

        let (status, _) = send(&state, method, uri, Some("wrong"), None).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }
}

#[tokio::test]
async fn test_create_account_returns_key_once() {
    let (_dir, state) = setup();
    let (status, body) = send(
        &state,
        Method::POST,
        "/admin/accounts",
        Some(TEST_ADMIN_TOKEN),
        Some(json!({ "label": "lab", "balance_mb": 50 })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    let api_key = body["api_key"].as_str().unwrap();
    assert!(!api_key.is_empty());
    assert_eq!(body["account"]["balance_mb"], 50);

    let account = state.ledger.find_by_api_key(api_key).unwrap().unwrap();
    assert_eq!(account.label.as_deref(), Some("lab"));

    let (status, list) = send(&state, Method::GET, "/admin/accounts", Some(TEST_ADMIN_TOKEN), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(list.as_array().unwrap().len(), 1);
    assert!(list[0].get("api_key").is_none());
}

#[tokio::test]
async fn test_top_up() {
    let (_dir, state) = setup();
    let (account, _) = create_test_account(&state, 10);

    let uri = format!("/admin/accounts/{}/top-up", account.id);
    let (status, body) = send(&state, Method::POST, &uri, Some(TEST_ADMIN_TOKEN), Some(json!({ "mb": 64 }))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["balance_mb"], 74);
    assert_eq!(body["exhausted"], false);
    assert_eq!(state.ledger.get(&account.id).unwrap().unwrap().balance_mb, 74);

    let (status, _) = send(&state, Method::POST, &uri, Some(TEST_ADMIN_TOKEN), Some(json!({ "mb": 0 }))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = send(
        &state,
        Method::POST,
        "/admin/accounts/missing/top-up",
        Some(TEST_ADMIN_TOKEN),
        Some(json!({ "mb": 1 })),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_expire_account() {
    let (_dir, state) = setup();
    let (account, api_key) = create_test_account(&state, 10);

    let uri = format!("/admin/accounts/{}/status", account.id);
    let (status, body) = send(
        &state,
        Method::POST,
        &uri,
        Some(TEST_ADMIN_TOKEN),
        Some(json!({ "status": "expired" })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "expired");
    assert_eq!(body["closed_connections"], 0);

    let stored = state.ledger.find_by_api_key(&api_key).unwrap().unwrap();
    assert_eq!(stored.status, remoterl_relay::AccountStatus::Expired);
}

#[tokio::test]
async fn test_dashboard_shows_account() {
    let (_dir, state) = setup();
    let (account, _) = create_test_account(&state, 42);

    let (status, list) = send(&state, Method::GET, "/dashboard/accounts", Some(TEST_ADMIN_TOKEN), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(list[0]["account_id"], account.id.as_str());
    assert_eq!(list[0]["online"], false);

    let uri = format!("/dashboard/accounts/{}", account.id);
    let (status, body) = send(&state, Method::GET, &uri, Some(TEST_ADMIN_TOKEN), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["balance_mb"], 42);
    assert_eq!(body["exhausted"], false);
    assert_eq!(body["connections"].as_array().unwrap().len(), 0);
    assert_eq!(body["sessions"].as_array().unwrap().len(), 0);

    let (status, _) = send(&state, Method::GET, "/dashboard/accounts/nobody", Some(TEST_ADMIN_TOKEN), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}
