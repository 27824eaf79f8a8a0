use axum::http::HeaderMap;
use std::future::Future;

pub const BEARER_PREFIX: &str = "Bearer ";

/// Primary tenant credential header
pub const TENANT_TOKEN_HEADER: &str = "etendo-token";

/// Alternate tenant credential header, consulted after `Authorization`
pub const ALT_TENANT_TOKEN_HEADER: &str = "x-etendo-token";

tokio::task_local! {
    static REQUEST_TOKEN: String;
}

/// Ensures a token carries exactly one `Bearer ` prefix
///
/// # Examples
///
/// ```rust
/// use etendo_mcp_gateway::middleware::normalize_bearer;
///
/// assert_eq!(normalize_bearer("abc123"), "Bearer abc123");
/// assert_eq!(normalize_bearer("  Bearer abc123 "), "Bearer abc123");
/// assert_eq!(normalize_bearer("Bearer Bearer abc123"), "Bearer abc123");
/// assert_eq!(normalize_bearer("   "), "");
/// ```
pub fn normalize_bearer(token: &str) -> String {
    let token = token.trim();
    if token.is_empty() {
        return String::new();
    }

    let token = if token.matches(BEARER_PREFIX).count() > 1 {
        token.replace(BEARER_PREFIX, "").trim().to_string()
    } else {
        token.to_string()
    };

    if token.starts_with(BEARER_PREFIX) {
        token
    } else {
        format!("{}{}", BEARER_PREFIX, token)
    }
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|value| value.to_str().ok())
}

fn non_blank(value: &str) -> Option<&str> {
    let trimmed = value.trim();
    (!trimmed.is_empty()).then_some(trimmed)
}

/// Extract the tenant credential from request headers
///
/// Headers are consulted in priority order:
///
/// 1. `etendo-token` - normalized to Bearer form
/// 2. `Authorization` - only when it already starts with `Bearer `, used verbatim
/// 3. `x-etendo-token` - normalized to Bearer form
///
/// Header lookup is case-insensitive. Blank values and values that are not
/// valid visible ASCII are skipped.
///
/// # Returns
///
/// * `Some(token)` - Bearer-prefixed credential
/// * `None` - No acceptable header present
pub fn extract_tenant_token(headers: &HeaderMap) -> Option<String> {
    if let Some(token) = header_str(headers, TENANT_TOKEN_HEADER).and_then(non_blank) {
        return Some(normalize_bearer(token));
    }

    if let Some(auth) = header_str(headers, "authorization") {
        if let Some(rest) = auth.strip_prefix(BEARER_PREFIX) {
            if non_blank(rest).is_some() {
                return Some(auth.to_string());
            }
        }
    }

    if let Some(token) = header_str(headers, ALT_TENANT_TOKEN_HEADER).and_then(non_blank) {
        return Some(normalize_bearer(token));
    }

    None
}

/// Runs `fut` with `token` published as the current request's credential
///
/// Each gateway request gets its own slot, so concurrent tenants never see
/// each other's tokens.
pub async fn with_request_token<F>(token: String, fut: F) -> F::Output
where
    F: Future,
{
    REQUEST_TOKEN.scope(token, fut).await
}

/// The credential published by [`with_request_token`] for the running task
pub fn current_request_token() -> Option<String> {
    REQUEST_TOKEN.try_with(Clone::clone).ok()
}
