//! Per-tenant MCP ServerHandler and the tool-pack registration seam
//!
//! Every instance serves one [`TenantMcpService`]. Its tools are collected
//! exactly once, when the instance first starts, by handing a
//! [`ToolRegistrar`] to the configured [`ToolPack`]. The resulting
//! `ToolRouter` is frozen and shared by every session the sub-server opens.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────┐
//! │  ToolPack::register                 │
//! │  (identifier, token)                │
//! └──────────────┬──────────────────────┘
//!                │ ToolRegistrar::add(...)
//!                ▼
//! ┌─────────────────────────────────────┐
//! │  ToolRouter<TenantMcpService>       │
//! │  - tools/list                       │
//! │  - tools/call -> ToolInvocation     │
//! └─────────────────────────────────────┘
//! ```

use crate::middleware::tenant_auth::{current_request_token, extract_tenant_token};
use async_trait::async_trait;
use rmcp::handler::server::tool::{ToolCallContext, ToolRoute, ToolRouter};
use rmcp::handler::server::ServerHandler;
use rmcp::model::{
    CallToolRequestParam, CallToolResult, Content, Implementation, JsonObject, ListToolsResult,
    PaginatedRequestParam, ProtocolVersion, ServerCapabilities, ServerInfo,
};
use rmcp::service::RequestContext;
use rmcp::{ErrorData, RoleServer};
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;

pub const SERVER_NAME: &str = "etendo-copilot-mcp";

/// Supplies the tools an instance exposes
///
/// Invoked once per instance, before its sub-server accepts connections.
/// Implementations must not fail the instance: unreachable upstreams should be
/// logged and degrade to a smaller catalogue.
#[async_trait]
#[cfg_attr(test, mockall::automock)]
pub trait ToolPack: Send + Sync {
    async fn register(&self, registrar: &mut ToolRegistrar, identifier: &str, token: &str);
}

/// One `tools/call` as seen by tool code
#[derive(Debug, Clone)]
pub struct ToolInvocation {
    pub identifier: String,
    pub arguments: JsonObject,
    /// Bearer credential resolved for this call, if any
    pub credential: Option<String>,
}

impl ToolInvocation {
    fn from_context(context: &ToolCallContext<'_, TenantMcpService>) -> Self {
        let service = context.service;

        let from_headers = context
            .request_context
            .extensions
            .get::<axum::http::request::Parts>()
            .and_then(|parts| extract_tenant_token(&parts.headers));

        let credential = from_headers
            .or_else(current_request_token)
            .or_else(|| (!service.token.is_empty()).then(|| service.token.clone()));

        Self {
            identifier: service.identifier.clone(),
            arguments: context.arguments.clone().unwrap_or_default(),
            credential,
        }
    }

    /// String argument, `None` when absent or not a string
    pub fn str_arg(&self, name: &str) -> Option<&str> {
        self.arguments.get(name).and_then(Value::as_str)
    }
}

/// Collects tool definitions into a `ToolRouter`
pub struct ToolRegistrar {
    router: ToolRouter<TenantMcpService>,
}

impl Default for ToolRegistrar {
    fn default() -> Self {
        Self::new()
    }
}

impl ToolRegistrar {
    pub fn new() -> Self {
        Self {
            router: ToolRouter::new(),
        }
    }

    /// Registers a tool
    ///
    /// Re-registering a name replaces the earlier definition.
    ///
    /// # Arguments
    ///
    /// * `name` - Tool name exposed over `tools/list`
    /// * `description` - Human readable description for the model
    /// * `input_schema` - JSON Schema object for the arguments
    /// * `handler` - Async function producing the tool result
    pub fn add<F, Fut>(
        &mut self,
        name: impl Into<String>,
        description: impl Into<String>,
        input_schema: JsonObject,
        handler: F,
    ) where
        F: Fn(ToolInvocation) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<CallToolResult, ErrorData>> + Send + 'static,
    {
        let name: String = name.into();
        let description: String = description.into();
        let tool_def = rmcp::model::Tool {
            name: name.clone().into(),
            description: Some(description.into()),
            input_schema: Arc::new(input_schema),
            annotations: None,
            title: None,
            icons: None,
            output_schema: None,
        };

        let handler = Arc::new(handler);
        let route = ToolRoute::new_dyn(
            tool_def,
            move |context: ToolCallContext<'_, TenantMcpService>| {
                let handler = Arc::clone(&handler);
                let invocation = ToolInvocation::from_context(&context);
                Box::pin(async move { handler(invocation).await })
            },
        );

        tracing::debug!(tool = %name, "Registering tool");
        self.router.add_route(route);
    }

    pub fn tool_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .router
            .list_all()
            .into_iter()
            .map(|tool| tool.name.to_string())
            .collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.router.list_all().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn into_router(self) -> ToolRouter<TenantMcpService> {
        self.router
    }
}

/// Wraps a JSON value as a successful tool result
///
/// Strings are returned as plain text, anything else as serialized JSON.
pub fn json_result(value: Value) -> Result<CallToolResult, ErrorData> {
    let text = match value {
        Value::String(text) => text,
        other => other.to_string(),
    };
    Ok(CallToolResult::success(vec![Content::text(text)]))
}

/// Builds a `{"type": "object"}` input schema from `(name, type, description)` triples
///
/// Every listed property is required unless its name ends with `?`.
pub fn object_schema(properties: &[(&str, &str, &str)]) -> JsonObject {
    let mut props = serde_json::Map::new();
    let mut required = Vec::new();

    for (name, kind, description) in properties {
        let (name, optional) = match name.strip_suffix('?') {
            Some(stripped) => (stripped, true),
            None => (*name, false),
        };
        props.insert(
            name.to_string(),
            serde_json::json!({ "type": kind, "description": description }),
        );
        if !optional {
            required.push(Value::String(name.to_string()));
        }
    }

    let mut schema = serde_json::Map::new();
    schema.insert("type".to_string(), Value::String("object".to_string()));
    schema.insert("properties".to_string(), Value::Object(props));
    if !required.is_empty() {
        schema.insert("required".to_string(), Value::Array(required));
    }
    schema
}

/// MCP protocol handler for one tenant
#[derive(Clone)]
pub struct TenantMcpService {
    identifier: String,
    token: String,
    tool_router: Arc<ToolRouter<Self>>,
}

impl TenantMcpService {
    pub fn new(identifier: String, token: String, tool_router: Arc<ToolRouter<Self>>) -> Self {
        Self {
            identifier,
            token,
            tool_router,
        }
    }

    pub fn identifier(&self) -> &str {
        &self.identifier
    }
}

impl ServerHandler for TenantMcpService {
    fn get_info(&self) -> ServerInfo {
        ServerInfo {
            protocol_version: ProtocolVersion::default(),
            capabilities: ServerCapabilities::builder().enable_tools().build(),
            server_info: Implementation {
                name: SERVER_NAME.to_string(),
                version: env!("CARGO_PKG_VERSION").to_string(),
                title: None,
                website_url: None,
                icons: None,
            },
            instructions: Some(format!("Etendo Copilot MCP server for {}", self.identifier)),
        }
    }

    async fn call_tool(
        &self,
        request: CallToolRequestParam,
        context: RequestContext<RoleServer>,
    ) -> Result<CallToolResult, ErrorData> {
        tracing::debug!(identifier = %self.identifier, tool = %request.name, "Tool call");
        let tcc = ToolCallContext::new(self, request, context);
        self.tool_router.call(tcc).await
    }

    async fn list_tools(
        &self,
        _request: Option<PaginatedRequestParam>,
        _context: RequestContext<RoleServer>,
    ) -> Result<ListToolsResult, ErrorData> {
        Ok(ListToolsResult::with_all_items(self.tool_router.list_all()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockall::predicate::*;

    #[tokio::test]
    async fn test_tool_pack_contract_receives_identifier_and_token() {
        let mut pack = MockToolPack::new();
        pack.expect_register()
            .with(always(), eq("tenantA"), eq("Bearer abc"))
            .times(1)
            .returning(|registrar, _, _| {
                registrar.add("ping", "Ping", object_schema(&[]), |_| async {
                    json_result(Value::String("pong".to_string()))
                });
                Box::pin(async {})
            });

        let mut registrar = ToolRegistrar::new();
        pack.register(&mut registrar, "tenantA", "Bearer abc").await;

        assert_eq!(registrar.tool_names(), vec!["ping".to_string()]);
    }

    #[test]
    fn test_registering_same_name_replaces() {
        let mut registrar = ToolRegistrar::new();
        registrar.add("ping", "first", object_schema(&[]), |_| async {
            json_result(Value::Null)
        });
        registrar.add("ping", "second", object_schema(&[]), |_| async {
            json_result(Value::Null)
        });

        assert_eq!(registrar.len(), 1);
        let router = registrar.into_router();
        let tools = router.list_all();
        assert_eq!(tools[0].description.as_deref(), Some("second"));
    }

    #[test]
    fn test_object_schema_marks_required() {
        let schema = object_schema(&[
            ("question", "string", "The question"),
            ("conversation_id?", "string", "Conversation"),
        ]);

        assert_eq!(schema["type"], "object");
        assert!(schema["properties"]["conversation_id"].is_object());
        assert_eq!(schema["required"], serde_json::json!(["question"]));
    }

    #[test]
    fn test_empty_schema_has_no_required() {
        let schema = object_schema(&[]);
        assert!(schema.get("required").is_none());
    }

    #[test]
    fn test_json_result_text_for_strings() {
        let result = json_result(Value::String("pong".to_string())).expect("result");
        let body = serde_json::to_value(&result).expect("serialize");
        assert_eq!(body["content"][0]["text"], "pong");

        let result = json_result(serde_json::json!({"ok": true})).expect("result");
        let body = serde_json::to_value(&result).expect("serialize");
        assert_eq!(body["content"][0]["text"], r#"{"ok":true}"#);
    }

    #[test]
    fn test_server_info_names_the_tenant() {
        let service = TenantMcpService::new(
            "tenantA".to_string(),
            "Bearer abc".to_string(),
            Arc::new(ToolRouter::new()),
        );
        let info = service.get_info();
        assert_eq!(info.server_info.name, SERVER_NAME);
        assert!(info
            .instructions
            .as_deref()
            .is_some_and(|text| text.contains("tenantA")));
        assert!(info.capabilities.tools.is_some());
    }
}
