use crate::mcp::instance::InstanceError;
use axum::{
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use serde_json::json;
use thiserror::Error;

// Type alias for Result with our GatewayError
pub type Result<T> = std::result::Result<T, GatewayError>;

/// Errors surfaced by the gateway's HTTP front door
///
/// Every variant renders as a JSON body `{"error": <code>, "detail": <message>}`.
///
/// | Variant               | Status | Code                    |
/// |-----------------------|--------|-------------------------|
/// | InvalidIdentifier     | 400    | `invalid_identifier`    |
/// | RequestBody           | 400    | `invalid_request_body`  |
/// | MissingCredential     | 401    | `missing_credential`    |
/// | InstanceStart         | 500    | `instance_start_failed` |
/// | InstanceUnavailable   | 503    | `instance_unavailable`  |
/// | Upstream              | 502    | `upstream_error`        |
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("Invalid identifier format")]
    InvalidIdentifier(String),

    #[error("Authentication required. Please provide a valid Etendo token in headers.")]
    MissingCredential,

    #[error("Failed to start MCP instance {identifier}: {source}")]
    InstanceStart {
        identifier: String,
        #[source]
        source: InstanceError,
    },

    /// The sub-server could not be reached even after a restart
    #[error("MCP instance {0} is not responding")]
    InstanceUnavailable(String),

    #[error("Error communicating with MCP instance {identifier}: {message}")]
    Upstream { identifier: String, message: String },

    #[error("Invalid request body: {0}")]
    RequestBody(String),
}

impl GatewayError {
    /// Maps an instance failure for `identifier` onto the HTTP taxonomy
    pub fn from_instance(identifier: &str, err: InstanceError) -> Self {
        match err {
            InstanceError::InvalidIdentifier(id) => GatewayError::InvalidIdentifier(id),
            source => GatewayError::InstanceStart {
                identifier: identifier.to_string(),
                source,
            },
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            GatewayError::InvalidIdentifier(_) | GatewayError::RequestBody(_) => {
                StatusCode::BAD_REQUEST
            }
            GatewayError::MissingCredential => StatusCode::UNAUTHORIZED,
            GatewayError::InstanceStart { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            GatewayError::InstanceUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            GatewayError::Upstream { .. } => StatusCode::BAD_GATEWAY,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            GatewayError::InvalidIdentifier(_) => "invalid_identifier",
            GatewayError::RequestBody(_) => "invalid_request_body",
            GatewayError::MissingCredential => "missing_credential",
            GatewayError::InstanceStart { .. } => "instance_start_failed",
            GatewayError::InstanceUnavailable(_) => "instance_unavailable",
            GatewayError::Upstream { .. } => "upstream_error",
        }
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let body = json!({
            "error": self.code(),
            "detail": self.to_string(),
        });

        (self.status(), Json(body)).into_response()
    }
}
