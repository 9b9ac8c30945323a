//! MCP `retry_message` tool parameter definition.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Parameters for the `retry_message` MCP tool.
///
/// `message_id` may point at either half of an exchange; an assistant message
/// resolves to the user message before it.
#[derive(Debug, Serialize, Deserialize, JsonSchema)]
pub struct RetryMessageParams {
    #[schemars(description = "Conversation containing the message")]
    pub conversation_id: String,

    #[schemars(description = "Ordinal of the message to retry (user or assistant)")]
    pub message_id: i64,
}
