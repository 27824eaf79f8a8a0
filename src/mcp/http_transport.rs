//! Streamable HTTP proxy between the gateway and instance sub-servers
//!
//! Forwards one inbound request to `<instance url>/mcp/<path>` and relays the
//! answer. Server-sent event streams and chunked responses are streamed
//! chunk by chunk; everything else is buffered.
//!
//! # Recovery
//!
//! ```text
//! send ──ok──────────────────────────────> relay
//!   │
//!   └─connect error─> restart instance ─> send (retry timeout)
//!                          │                 ├─ok────────────> relay
//!                          └─fail─> 503      ├─connect error─> 503
//!                                            └─other─────────> 502
//! ```

use crate::error::GatewayError;
use crate::mcp::instance::{InstanceError, McpInstance};
use crate::middleware::tenant_auth::{current_request_token, with_request_token};
use axum::{
    body::{to_bytes, Body, Bytes},
    http::{header, HeaderMap, Method, Request, Response},
};
use std::sync::Arc;
use std::time::Duration;

/// Request headers that are not forwarded upstream
const STRIPPED_REQUEST_HEADERS: [&str; 5] = [
    "host",
    "content-length",
    "transfer-encoding",
    "connection",
    "keep-alive",
];

enum SendError {
    Connect(String),
    Other(String),
}

/// HTTP client that forwards gateway requests to instance sub-servers
#[derive(Clone)]
pub struct UpstreamProxy {
    client: reqwest::Client,
    timeout: Duration,
    retry_timeout: Duration,
    max_body_bytes: usize,
}

impl UpstreamProxy {
    /// Creates a proxy
    ///
    /// # Arguments
    ///
    /// * `timeout` - Time allowed for the first attempt to produce response headers
    /// * `retry_timeout` - Same bound for the attempt after an instance restart
    /// * `max_body_bytes` - Largest request body that will be buffered
    pub fn new(timeout: Duration, retry_timeout: Duration, max_body_bytes: usize) -> Self {
        // No client-wide timeout: it would cut long-lived event streams
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());

        Self {
            client,
            timeout,
            retry_timeout,
            max_body_bytes,
        }
    }

    /// Forwards `request` to `instance`, recovering once from a dead sub-server
    ///
    /// # Arguments
    ///
    /// * `instance` - Running instance to forward to
    /// * `request` - Inbound request; its path is replaced by `/mcp/<path>`
    /// * `path` - Remainder after `/{identifier}/mcp/`, empty for the root
    ///
    /// # Errors
    ///
    /// * `GatewayError::RequestBody` - Body unreadable or over the size limit
    /// * `GatewayError::InstanceUnavailable` - Still unreachable after a restart
    /// * `GatewayError::Upstream` - Any other upstream failure, timeouts included
    pub async fn forward(
        &self,
        instance: &Arc<McpInstance>,
        request: Request<Body>,
        path: &str,
    ) -> Result<Response<Body>, GatewayError> {
        let identifier = instance.identifier().to_string();
        let (parts, body) = request.into_parts();

        let body = to_bytes(body, self.max_body_bytes)
            .await
            .map_err(|e| GatewayError::RequestBody(e.to_string()))?;

        let mut headers = parts.headers;
        for name in STRIPPED_REQUEST_HEADERS {
            headers.remove(name);
        }

        let query = parts.uri.query();
        let generation = instance.generation();

        let first = match instance.url() {
            Ok(base) => {
                let url = upstream_url(&base, path, query);
                tracing::debug!(identifier = %identifier, method = %parts.method, url = %url, "Proxying request");
                self.send(&parts.method, &url, &headers, &body, self.timeout)
                    .await
            }
            Err(e) => Err(SendError::Connect(e.to_string())),
        };

        let upstream = match first {
            Ok(response) => response,
            Err(SendError::Other(message)) => {
                tracing::error!(identifier = %identifier, error = %message, "Upstream request failed");
                return Err(GatewayError::Upstream {
                    identifier,
                    message,
                });
            }
            Err(SendError::Connect(reason)) => {
                tracing::warn!(
                    identifier = %identifier,
                    reason = %reason,
                    "MCP instance not reachable, attempting restart"
                );

                let restart = {
                    let instance = Arc::clone(instance);
                    let request_token =
                        current_request_token().unwrap_or_else(|| instance.token().to_string());
                    tokio::spawn(with_request_token(request_token, async move {
                        instance.restart(generation).await
                    }))
                };
                let restarted = restart
                    .await
                    .unwrap_or_else(|_| Err(InstanceError::StartAborted(identifier.clone())));
                if let Err(e) = restarted {
                    tracing::error!(identifier = %identifier, error = %e, "MCP instance restart failed");
                    return Err(GatewayError::InstanceUnavailable(identifier));
                }

                let base = instance
                    .url()
                    .map_err(|_| GatewayError::InstanceUnavailable(identifier.clone()))?;
                let url = upstream_url(&base, path, query);

                match self
                    .send(&parts.method, &url, &headers, &body, self.retry_timeout)
                    .await
                {
                    Ok(response) => response,
                    Err(SendError::Connect(reason)) => {
                        tracing::error!(identifier = %identifier, reason = %reason, "MCP instance still unreachable after restart");
                        return Err(GatewayError::InstanceUnavailable(identifier));
                    }
                    Err(SendError::Other(message)) => {
                        tracing::error!(identifier = %identifier, error = %message, "Upstream request failed after restart");
                        return Err(GatewayError::Upstream {
                            identifier,
                            message,
                        });
                    }
                }
            }
        };

        relay(&identifier, upstream).await
    }

    async fn send(
        &self,
        method: &Method,
        url: &str,
        headers: &HeaderMap,
        body: &Bytes,
        timeout: Duration,
    ) -> Result<reqwest::Response, SendError> {
        let mut builder = self
            .client
            .request(method.clone(), url)
            .headers(headers.clone());
        if !body.is_empty() || method_carries_body(method) {
            builder = builder.body(body.clone());
        }

        match tokio::time::timeout(timeout, builder.send()).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(e)) if e.is_connect() => Err(SendError::Connect(e.to_string())),
            Ok(Err(e)) => Err(SendError::Other(e.to_string())),
            Err(_) => Err(SendError::Other(format!(
                "timed out after {}s waiting for response",
                timeout.as_secs_f64()
            ))),
        }
    }
}

fn method_carries_body(method: &Method) -> bool {
    matches!(*method, Method::POST | Method::PUT | Method::PATCH)
}

/// `<base>/mcp/<path>[?query]`, keeping the trailing slash for an empty path
pub fn upstream_url(base: &str, path: &str, query: Option<&str>) -> String {
    let mut url = format!("{}/mcp/{}", base.trim_end_matches('/'), path.trim_start_matches('/'));
    if let Some(query) = query.filter(|q| !q.is_empty()) {
        url.push('?');
        url.push_str(query);
    }
    url
}

/// Whether the upstream response must be streamed rather than buffered
pub fn is_streaming(headers: &HeaderMap) -> bool {
    let event_stream = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.to_ascii_lowercase().contains("text/event-stream"));

    let chunked = headers
        .get(header::TRANSFER_ENCODING)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.to_ascii_lowercase().contains("chunked"));

    event_stream || chunked
}

async fn relay(identifier: &str, upstream: reqwest::Response) -> Result<Response<Body>, GatewayError> {
    let status = upstream.status();
    let mut headers = upstream.headers().clone();
    let streaming = is_streaming(&headers);

    headers.remove(header::TRANSFER_ENCODING);
    headers.remove(header::CONNECTION);

    let body = if streaming {
        headers.remove(header::CONTENT_LENGTH);
        tracing::debug!(identifier, status = status.as_u16(), "Streaming upstream response");
        Body::from_stream(upstream.bytes_stream())
    } else {
        let bytes = upstream.bytes().await.map_err(|e| GatewayError::Upstream {
            identifier: identifier.to_string(),
            message: e.to_string(),
        })?;
        Body::from(bytes)
    };

    let mut response = Response::new(body);
    *response.status_mut() = status;
    *response.headers_mut() = headers;
    Ok(response)
}
