//! MCP `ask_question` tool parameter definition.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Parameters for the `ask_question` MCP tool.
#[derive(Debug, Serialize, Deserialize, JsonSchema)]
pub struct AskQuestionParams {
    #[schemars(description = "The question to answer, in plain language")]
    pub question: String,

    /// Continue an existing conversation instead of starting a new one.
    #[schemars(description = "Conversation to continue. Omit to start a new conversation.")]
    pub conversation_id: Option<String>,

    #[schemars(description = "Seconds to wait for the answer before returning the pending task (0-90). Defaults to 0.")]
    pub wait_seconds: Option<u64>,
}
