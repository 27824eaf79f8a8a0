//! Default tool catalogue for Etendo Copilot tenants
//!
//! Every instance gets `ping` and `server_info`. When the tenant's agent
//! structure can be fetched it also gets `get_agent_prompt` and an
//! `ask_agent_<Name>` tool; otherwise a generic `ask_agent` bound to the
//! identifier is registered instead.

use crate::mcp::service::{json_result, object_schema, SERVER_NAME};
use crate::mcp::{ToolInvocation, ToolPack, ToolRegistrar};
use crate::services::etendo_client::{AgentStructure, EtendoClient};
use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use rmcp::model::CallToolResult;
use rmcp::ErrorData;
use serde_json::{json, Value};
use std::sync::Arc;

static NON_ALPHANUMERIC: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[^0-9a-zA-Z]+").expect("sanitize pattern is valid"));

/// Turns an agent name into a tool-name suffix
///
/// # Examples
///
/// ```rust
/// use etendo_mcp_gateway::services::sanitize_tool_name;
///
/// assert_eq!(sanitize_tool_name("Sales Helper (v2)"), "Sales_Helper_v2");
/// assert_eq!(sanitize_tool_name("3D Modeler"), "agent_3D_Modeler");
/// assert_eq!(sanitize_tool_name("***"), "unknown_agent");
/// ```
pub fn sanitize_tool_name(name: &str) -> String {
    let sanitized = NON_ALPHANUMERIC.replace_all(name, "_");
    let sanitized = sanitized.trim_matches('_');

    if sanitized.is_empty() {
        "unknown_agent".to_string()
    } else if sanitized.starts_with(|c: char| c.is_ascii_digit()) {
        format!("agent_{}", sanitized)
    } else {
        sanitized.to_string()
    }
}

/// Copilot catalogue backed by an [`EtendoClient`]
#[derive(Clone)]
pub struct CopilotToolPack {
    client: Arc<EtendoClient>,
}

impl CopilotToolPack {
    pub fn new(client: EtendoClient) -> Self {
        Self {
            client: Arc::new(client),
        }
    }
}

#[async_trait]
impl ToolPack for CopilotToolPack {
    async fn register(&self, registrar: &mut ToolRegistrar, identifier: &str, token: &str) {
        register_basic_tools(registrar);

        match self.client.fetch_agent_structure(identifier, token).await {
            Ok(agent) => {
                register_prompt_tool(registrar, &agent, identifier);
                let agent_name = agent.name.clone().unwrap_or_else(|| identifier.to_string());
                let description = agent
                    .description
                    .clone()
                    .filter(|d| !d.trim().is_empty())
                    .unwrap_or_else(|| format!("Ask agent {}", agent_name));
                register_ask_tool(
                    registrar,
                    &self.client,
                    format!("ask_agent_{}", sanitize_tool_name(&agent_name)),
                    description,
                    identifier,
                );
            }
            Err(e) => {
                tracing::warn!(
                    identifier,
                    error = %e,
                    "Could not fetch agent structure, registering generic ask_agent"
                );
                register_ask_tool(
                    registrar,
                    &self.client,
                    "ask_agent".to_string(),
                    format!("Ask agent {}", identifier),
                    identifier,
                );
            }
        }

        tracing::info!(identifier, tools = registrar.len(), "Registered Copilot tools");
    }
}

fn register_basic_tools(registrar: &mut ToolRegistrar) {
    registrar.add(
        "ping",
        "A simple ping tool to test MCP connectivity.",
        object_schema(&[]),
        |_| async { json_result(Value::String("pong".to_string())) },
    );

    registrar.add(
        "server_info",
        "Get basic server information.",
        object_schema(&[]),
        |_| async {
            json_result(json!({
                "name": SERVER_NAME,
                "version": env!("CARGO_PKG_VERSION"),
                "description": "Etendo Copilot MCP Server with HTTP streaming",
                "transport": "http-streaming",
                "status": "running",
            }))
        },
    );
}

fn register_prompt_tool(registrar: &mut ToolRegistrar, agent: &AgentStructure, identifier: &str) {
    let agent_name = agent
        .name
        .clone()
        .unwrap_or_else(|| identifier.to_string());
    let agent_prompt = agent
        .system_prompt
        .clone()
        .filter(|p| !p.is_empty())
        .unwrap_or_else(|| "No system prompt configured".to_string());

    registrar.add(
        "get_agent_prompt",
        "Retrieve the agent's system prompt and configuration",
        object_schema(&[]),
        move |_| {
            let result = json!({
                "success": true,
                "agent_name": agent_name,
                "agent_prompt": agent_prompt,
            });
            async move { json_result(result) }
        },
    );
}

fn register_ask_tool(
    registrar: &mut ToolRegistrar,
    client: &Arc<EtendoClient>,
    name: String,
    description: String,
    app_id: &str,
) {
    let client = Arc::clone(client);
    let app_id = app_id.to_string();

    registrar.add(
        name,
        description,
        object_schema(&[
            ("question", "string", "Question to ask the agent"),
            (
                "conversation_id?",
                "string",
                "Conversation to continue; omit to start a new one",
            ),
        ]),
        move |invocation| {
            let client = Arc::clone(&client);
            let app_id = app_id.clone();
            async move { ask_agent(&client, &app_id, invocation).await }
        },
    );
}

async fn ask_agent(
    client: &EtendoClient,
    app_id: &str,
    invocation: ToolInvocation,
) -> Result<CallToolResult, ErrorData> {
    let Some(credential) = invocation.credential.as_deref() else {
        return json_result(json!({
            "success": false,
            "status_code": 401,
            "error": "No authentication token found in request headers. Authentication required.",
        }));
    };

    let Some(question) = invocation.str_arg("question") else {
        return Err(ErrorData::invalid_params(
            "missing required argument 'question'",
            None,
        ));
    };

    let conversation_id = invocation.str_arg("conversation_id");

    match client
        .ask_question(credential, app_id, question, conversation_id)
        .await
    {
        Ok(answer) if answer.success => json_result(json!({
            "success": true,
            "status_code": answer.status_code,
            "result": answer.body,
        })),
        Ok(answer) => json_result(json!({
            "success": false,
            "status_code": answer.status_code,
            "error": answer.body,
        })),
        Err(e) => {
            tracing::error!(app_id, error = %e, "Agent question failed");
            json_result(json!({ "success": false, "error": e.to_string() }))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sanitize_collapses_runs() {
        assert_eq!(sanitize_tool_name("a -- b"), "a_b");
        assert_eq!(sanitize_tool_name("__x__"), "x");
        assert_eq!(sanitize_tool_name(""), "unknown_agent");
    }

    #[test]
    fn test_sanitize_leading_digit() {
        assert_eq!(sanitize_tool_name("42"), "agent_42");
    }

    #[tokio::test]
    async fn test_unreachable_agent_system_falls_back_to_generic_ask() {
        // Nothing listens on port 9 of the loopback
        let pack = CopilotToolPack::new(EtendoClient::new("http://127.0.0.1:9/etendo"));
        let mut registrar = ToolRegistrar::new();

        pack.register(&mut registrar, "tenantA", "Bearer abc").await;

        assert_eq!(registrar.tool_names(), vec!["ask_agent", "ping", "server_info"]);
    }
}
