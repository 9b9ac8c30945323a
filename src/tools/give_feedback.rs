//! MCP `give_feedback` tool parameter definition.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Parameters for the `give_feedback` MCP tool.
#[derive(Debug, Serialize, Deserialize, JsonSchema)]
pub struct GiveFeedbackParams {
    #[schemars(description = "Conversation containing the answer")]
    pub conversation_id: String,

    #[schemars(description = "Ordinal of the assistant message being rated")]
    pub message_id: i64,

    #[schemars(description = "false if the answer was wrong; its query will no longer be reused")]
    pub helpful: bool,
}
