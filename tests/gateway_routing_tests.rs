//! Routing tests for the gateway front door
//!
//! These tests drive the gateway router in-process with `oneshot`:
//! - Introspection endpoints (`/`, `/health`, `/instances`)
//! - Identifier and credential validation on the proxy route
//! - On-demand instance creation through a proxied MCP `initialize`

use axum::{
    body::{to_bytes, Body},
    http::{Request, StatusCode},
    Router,
};
use async_trait::async_trait;
use etendo_mcp_gateway::{
    mcp::{ToolPack, ToolRegistrar},
    middleware::current_request_token,
    routes::gateway_router,
    test_utils::{test_config, StaticToolPack},
    AppState,
};
use serde_json::{json, Value};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tower::ServiceExt;

const INITIALIZE: &str = r#"{"jsonrpc":"2.0","id":1,"method":"initialize","params":{"protocolVersion":"2025-03-26","capabilities":{},"clientInfo":{"name":"gateway-test","version":"0.1.0"}}}"#;

fn gateway() -> (Router, AppState) {
    let state = AppState::new(
        test_config(Duration::from_secs(600)),
        Arc::new(StaticToolPack),
    );
    (gateway_router(state.clone()), state)
}

async fn get_json(app: Router, uri: &str) -> (StatusCode, Value) {
    let response = app
        .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
        .await
        .unwrap();
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    (status, serde_json::from_slice(&bytes).unwrap())
}

fn initialize_request(uri: &str, token: Option<(&str, &str)>) -> Request<Body> {
    let mut builder = Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .header("accept", "application/json, text/event-stream");
    if let Some((name, value)) = token {
        builder = builder.header(name, value);
    }
    builder.body(Body::from(INITIALIZE)).unwrap()
}

// ============================================================================
// Introspection
// ============================================================================

#[tokio::test]
async fn test_overview_reports_ttl_and_empty_pool() {
    let (app, _) = gateway();

    let (status, body) = get_json(app, "/").await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["message"], "Etendo Copilot Dynamic MCP Server");
    assert_eq!(body["usage"], "Access MCP instances at /{identifier}/mcp");
    assert_eq!(body["active_instances"], 0);
    assert_eq!(body["ttl_minutes"], 10.0);
    assert_eq!(
        body["port_management"],
        json!({"used_ports": 0, "available_for_reuse": 0, "total_ports_tracked": 0})
    );
}

#[tokio::test]
async fn test_health_lists_port_sets() {
    let (app, _) = gateway();

    let (status, body) = get_json(app, "/health").await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "healthy");
    assert!(body["timestamp"].is_string());
    assert_eq!(body["port_stats"]["used_ports"], json!([]));
    assert_eq!(body["port_stats"]["available_ports"], json!([]));
}

#[tokio::test]
async fn test_instances_empty_at_start() {
    let (app, _) = gateway();

    let (status, body) = get_json(app, "/instances").await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["active_instances"], 0);
    assert_eq!(body["instances"], json!({}));
}

// ============================================================================
// Proxy route validation
// ============================================================================

#[tokio::test]
async fn test_malformed_identifier_rejected_before_auth() {
    let (app, state) = gateway();

    let response = app
        .oneshot(initialize_request("/bad.id/mcp", None))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let body: Value = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(body["detail"], "Invalid identifier format");
    assert!(state.manager.is_empty().await);
}

#[tokio::test]
async fn test_missing_token_is_401_and_creates_nothing() {
    let (app, state) = gateway();

    let response = app
        .oneshot(initialize_request("/tenantA/mcp", None))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert!(state.manager.is_empty().await);
    assert!(state.manager.port_pool().snapshot().in_use.is_empty());
}

#[tokio::test]
async fn test_authorization_without_bearer_is_401() {
    let (app, _) = gateway();

    let response = app
        .oneshot(initialize_request(
            "/tenantA/mcp",
            Some(("authorization", "Basic dXNlcjpwYXNz")),
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_unknown_route_is_404() {
    let (app, _) = gateway();

    let response = app
        .oneshot(Request::builder().uri("/tenantA/other").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

// ============================================================================
// On-demand instances
// ============================================================================

#[tokio::test]
async fn test_first_request_creates_instance() {
    let (app, state) = gateway();

    let response = app
        .clone()
        .oneshot(initialize_request("/tenantA/mcp", Some(("etendo-token", "abc"))))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert!(response.headers().contains_key("mcp-session-id"));
    // Event streams are relayed chunk by chunk, never with a fixed length
    let content_type = response.headers()["content-type"].to_str().unwrap();
    assert!(content_type.starts_with("text/event-stream"));
    assert!(!response.headers().contains_key("content-length"));

    let (_, body) = get_json(app, "/instances").await;
    assert_eq!(body["active_instances"], 1);
    let info = &body["instances"]["tenantA"];
    assert_eq!(info["status"], "running");
    assert_eq!(info["ttl_minutes"], 10.0);
    let port = info["port"].as_u64().expect("port assigned");
    assert_eq!(info["url"], format!("http://localhost:{}", port));

    state.manager.cleanup().await;
}

#[tokio::test]
async fn test_trailing_slash_and_alternate_header() {
    let (app, state) = gateway();

    let response = app
        .oneshot(initialize_request("/tenantB/mcp/", Some(("x-etendo-token", "abc"))))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(state.manager.identifiers().await, vec!["tenantB".to_string()]);

    state.manager.cleanup().await;
}

#[tokio::test]
async fn test_repeat_requests_share_one_port() {
    let (app, state) = gateway();

    for _ in 0..3 {
        let response = app
            .clone()
            .oneshot(initialize_request(
                "/tenantA/mcp",
                Some(("authorization", "Bearer abc")),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    let (_, health) = get_json(app, "/health").await;
    assert_eq!(health["active_instances"], 1);
    assert_eq!(health["port_stats"]["used_ports"].as_array().unwrap().len(), 1);

    state.manager.cleanup().await;
}

/// Records the request-scoped credential visible while tools are registered
#[derive(Default)]
struct RecordingToolPack {
    seen: Mutex<Vec<Option<String>>>,
}

#[async_trait]
impl ToolPack for RecordingToolPack {
    async fn register(&self, registrar: &mut ToolRegistrar, identifier: &str, token: &str) {
        self.seen.lock().unwrap().push(current_request_token());
        StaticToolPack.register(registrar, identifier, token).await;
    }
}

#[tokio::test]
async fn test_tool_registration_sees_request_token() {
    let pack = Arc::new(RecordingToolPack::default());
    let state = AppState::new(test_config(Duration::from_secs(600)), pack.clone());
    let app = gateway_router(state.clone());

    let response = app
        .oneshot(initialize_request("/tenantA/mcp", Some(("etendo-token", "abc"))))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        *pack.seen.lock().unwrap(),
        vec![Some("Bearer abc".to_string())]
    );

    state.manager.cleanup().await;
}
