pub mod copilot_tools;
pub mod etendo_client;

pub use copilot_tools::{sanitize_tool_name, CopilotToolPack};
pub use etendo_client::{AgentStructure, EtendoClient, EtendoClientError, QuestionResponse};
