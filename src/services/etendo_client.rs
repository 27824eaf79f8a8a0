//! HTTP client for the Etendo agent system
//!
//! Two calls are needed by the tool catalogue:
//!
//! - `GET {host}/sws/copilot/structure?app_id=<id>` - agent configuration
//! - `POST {host}/sws/copilot/question` - ask an agent a question
//!
//! Both authenticate with the tenant's Bearer token in `Authorization`.
//!
//! # Example
//!
//! ```rust,no_run
//! use etendo_mcp_gateway::services::EtendoClient;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let client = EtendoClient::new("http://localhost:8080/etendo");
//!
//! let agent = client.fetch_agent_structure("A1B2C3", "Bearer abc").await?;
//! println!("Agent: {:?}", agent.name);
//!
//! let answer = client
//!     .ask_question("Bearer abc", "A1B2C3", "What can you do?", None)
//!     .await?;
//! println!("HTTP {}: {}", answer.status_code, answer.body);
//! # Ok(())
//! # }
//! ```

use crate::middleware::normalize_bearer;
use reqwest::header::{ACCEPT, AUTHORIZATION, CONTENT_TYPE};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;

const STRUCTURE_PATH: &str = "/sws/copilot/structure";
const QUESTION_PATH: &str = "/sws/copilot/question";
const APPLICATION_JSON: &str = "application/json";

/// Agents may take minutes to answer
pub const QUESTION_TIMEOUT: Duration = Duration::from_secs(300);
pub const STRUCTURE_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, thiserror::Error)]
pub enum EtendoClientError {
    #[error("Request failed: {0}")]
    RequestFailed(#[from] reqwest::Error),

    #[error("HTTP {status}: {body}")]
    Status { status: u16, body: String },

    #[error("Invalid agent structure: {0}")]
    InvalidStructure(String),

    #[error("No authentication token available")]
    MissingToken,
}

/// Agent configuration as served by `/sws/copilot/structure`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AgentStructure {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub system_prompt: Option<String>,
}

/// Answer to an `ask_question` call, successful or not
#[derive(Debug, Clone)]
pub struct QuestionResponse {
    pub status_code: u16,
    pub success: bool,
    /// Parsed JSON body, or the raw text when it is not JSON
    pub body: Value,
}

#[derive(Serialize)]
struct QuestionRequest<'a> {
    question: &'a str,
    app_id: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    conversation_id: Option<&'a str>,
}

#[derive(Clone)]
pub struct EtendoClient {
    client: reqwest::Client,
    base_url: String,
}

impl EtendoClient {
    /// Creates a client for the agent system rooted at `base_url`
    pub fn new(base_url: impl Into<String>) -> Self {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());

        let base_url: String = base_url.into();
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Fetches the agent configuration for `app_id`
    ///
    /// # Errors
    ///
    /// * `EtendoClientError::MissingToken` - `token` is blank
    /// * `EtendoClientError::Status` - Non-2xx answer
    /// * `EtendoClientError::InvalidStructure` - Body is not an agent structure
    /// * `EtendoClientError::RequestFailed` - Network failure or timeout
    pub async fn fetch_agent_structure(
        &self,
        app_id: &str,
        token: &str,
    ) -> Result<AgentStructure, EtendoClientError> {
        let authorization = authorization(token)?;
        let url = format!("{}{}", self.base_url, STRUCTURE_PATH);

        tracing::debug!(app_id, url = %url, "Fetching agent structure");

        let response = self
            .client
            .get(&url)
            .query(&[("app_id", app_id)])
            .header(AUTHORIZATION, authorization)
            .timeout(STRUCTURE_TIMEOUT)
            .send()
            .await?;

        let status = response.status();
        let text = response.text().await?;
        if !status.is_success() {
            return Err(EtendoClientError::Status {
                status: status.as_u16(),
                body: text,
            });
        }

        serde_json::from_str(&text).map_err(|e| EtendoClientError::InvalidStructure(e.to_string()))
    }

    /// Sends `question` to the agent `app_id`
    ///
    /// An HTTP error status is not an `Err`: it comes back with
    /// `success == false` so the caller can report the agent's own message.
    /// `conversation_id` is dropped when empty or the literal `"null"`.
    pub async fn ask_question(
        &self,
        token: &str,
        app_id: &str,
        question: &str,
        conversation_id: Option<&str>,
    ) -> Result<QuestionResponse, EtendoClientError> {
        let authorization = authorization(token)?;
        let url = format!("{}{}", self.base_url, QUESTION_PATH);

        let payload = QuestionRequest {
            question,
            app_id,
            conversation_id: conversation_id.filter(|id| !id.is_empty() && *id != "null"),
        };

        tracing::debug!(app_id, url = %url, "Asking agent");

        let response = self
            .client
            .post(&url)
            .header(CONTENT_TYPE, APPLICATION_JSON)
            .header(ACCEPT, APPLICATION_JSON)
            .header(AUTHORIZATION, authorization)
            .json(&payload)
            .timeout(QUESTION_TIMEOUT)
            .send()
            .await?;

        let status = response.status();
        let text = response.text().await?;
        let body = serde_json::from_str(&text).unwrap_or(Value::String(text));

        Ok(QuestionResponse {
            status_code: status.as_u16(),
            success: status.is_success(),
            body,
        })
    }
}

fn authorization(token: &str) -> Result<String, EtendoClientError> {
    let normalized = normalize_bearer(token);
    if normalized.is_empty() {
        return Err(EtendoClientError::MissingToken);
    }
    Ok(normalized)
}
