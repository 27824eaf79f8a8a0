use crate::{handlers, mcp, AppState};
use axum::{
    http::HeaderName,
    routing::{any, get},
    Router,
};
use tower_http::{cors::CorsLayer, trace::TraceLayer};

/// Assembles the gateway router: introspection endpoints plus the tenant proxy
///
/// CORS mirrors the caller's origin, methods and headers with credentials
/// allowed, and exposes the MCP session header so browser clients can resume.
pub fn gateway_router(state: AppState) -> Router {
    let cors_layer = CorsLayer::very_permissive()
        .expose_headers([HeaderName::from_static("mcp-session-id")]);

    Router::new()
        .route("/", get(handlers::overview_handler))
        .route("/health", get(handlers::health_handler))
        .route("/instances", get(handlers::instances_handler))
        // `{*path}` never matches an empty remainder, so the bare and
        // trailing-slash forms are routed explicitly
        .route("/{identifier}/mcp", any(mcp::proxy_mcp_root))
        .route("/{identifier}/mcp/", any(mcp::proxy_mcp_root))
        .route("/{identifier}/mcp/{*path}", any(mcp::proxy_mcp_path))
        .layer(cors_layer)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
