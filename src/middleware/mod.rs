pub mod tenant_auth;

pub use tenant_auth::{
    current_request_token, extract_tenant_token, normalize_bearer, with_request_token,
    ALT_TENANT_TOKEN_HEADER, BEARER_PREFIX, TENANT_TOKEN_HEADER,
};
