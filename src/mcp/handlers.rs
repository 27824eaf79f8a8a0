//! HTTP request handlers for the per-tenant MCP proxy
//!
//! These handlers resolve the tenant instance named in the URL path, creating
//! it on first use, and forward the request to its sub-server.

use crate::error::GatewayError;
use crate::mcp::registry::is_valid_identifier;
use crate::middleware::{extract_tenant_token, with_request_token};
use crate::AppState;
use axum::{
    body::Body,
    extract::{Path, Request, State},
    response::Response,
};

/// Proxies requests addressed to a tenant's MCP endpoint root
///
/// # Route
///
/// `GET|POST|OPTIONS /{identifier}/mcp` and `/{identifier}/mcp/`
///
/// # Returns
///
/// * `Ok(Response)` - Upstream response, streamed for event streams
/// * `Err(GatewayError::InvalidIdentifier)` - 400
/// * `Err(GatewayError::MissingCredential)` - 401
/// * `Err(GatewayError::InstanceStart)` - 500
/// * `Err(GatewayError::Upstream)` - 502
/// * `Err(GatewayError::InstanceUnavailable)` - 503
pub async fn proxy_mcp_root(
    State(state): State<AppState>,
    Path(identifier): Path<String>,
    request: Request,
) -> Result<Response, GatewayError> {
    proxy(state, identifier, String::new(), request).await
}

/// Proxies requests addressed below a tenant's MCP endpoint
///
/// # Route
///
/// `GET|POST|OPTIONS /{identifier}/mcp/{*path}`
pub async fn proxy_mcp_path(
    State(state): State<AppState>,
    Path((identifier, path)): Path<(String, String)>,
    request: Request,
) -> Result<Response, GatewayError> {
    proxy(state, identifier, path, request).await
}

async fn proxy(
    state: AppState,
    identifier: String,
    path: String,
    request: Request<Body>,
) -> Result<Response, GatewayError> {
    if !is_valid_identifier(&identifier) {
        tracing::debug!(identifier = %identifier, "Rejected malformed identifier");
        return Err(GatewayError::InvalidIdentifier(identifier));
    }

    let token = extract_tenant_token(request.headers()).ok_or_else(|| {
        tracing::debug!(identifier = %identifier, "Request without tenant credential");
        GatewayError::MissingCredential
    })?;

    with_request_token(token.clone(), async move {
        let instance = state
            .manager
            .get_or_create(&identifier, &token)
            .await
            .map_err(|e| GatewayError::from_instance(&identifier, e))?;

        instance.touch();
        state.proxy.forward(&instance, request, &path).await
    })
    .await
}
