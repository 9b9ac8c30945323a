//! Boundary to the two external collaborators of a task: the language model
//! ([`Assistant`]) and the data service that runs queries ([`ToolInvoker`]).
//!
//! Both are traits so the worker can be driven by in-process fakes in tests;
//! [`http`] holds the reqwest bindings used in production.

pub mod http;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::conversation::{Message, Role};
use crate::error::ToolInvocationError;
use crate::recall::RecallCandidate;

/// A prior turn as the assistant sees it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Turn {
    pub role: Role,
    pub content: String,
}

impl From<&Message> for Turn {
    fn from(message: &Message) -> Self {
        Self {
            role: message.role,
            content: message.content.clone(),
        }
    }
}

/// A previously answered question offered to the planner as a starting point.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecallHint {
    pub question: String,
    pub query: String,
    pub similarity: f64,
}

impl From<&RecallCandidate> for RecallHint {
    fn from(candidate: &RecallCandidate) -> Self {
        Self {
            question: candidate.matched_question.clone(),
            query: candidate.matched_query.clone(),
            similarity: candidate.similarity_score,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PlanRequest<'a> {
    pub question: &'a str,
    pub history: &'a [Turn],
    #[serde(skip_serializing_if = "Option::is_none")]
    pub recall: Option<&'a RecallHint>,
}

/// What the assistant decided to do with a question.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum Plan {
    /// The question is ambiguous; ask the user this instead.
    Clarify { question: String },
    /// Run `tool` with `args`, then compose an answer from the result.
    Query { tool: String, args: Value },
    /// Answer directly without touching the data service.
    Answer { text: String },
}

impl Plan {
    /// The query text worth remembering for recall: `args.query` when it is a
    /// string, otherwise the serialized arguments.
    pub fn recall_query(args: &Value) -> String {
        args.get("query")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| args.to_string())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ComposeRequest<'a> {
    pub question: &'a str,
    pub history: &'a [Turn],
    pub tool: &'a str,
    pub args: &'a Value,
    pub result: &'a Value,
}

#[async_trait]
pub trait Assistant: Send + Sync {
    async fn plan(&self, request: PlanRequest<'_>) -> anyhow::Result<Plan>;

    async fn compose(&self, request: ComposeRequest<'_>) -> anyhow::Result<String>;
}

#[async_trait]
pub trait ToolInvoker: Send + Sync {
    async fn invoke(&self, tool: &str, args: Value) -> Result<Value, ToolInvocationError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn plan_wire_format_is_tagged() {
        let plan: Plan = serde_json::from_value(json!({
            "action": "query",
            "tool": "query",
            "args": {"query": "SELECT 1"}
        }))
        .unwrap();
        assert_eq!(
            plan,
            Plan::Query { tool: "query".into(), args: json!({"query": "SELECT 1"}) }
        );

        let clarify = serde_json::to_value(Plan::Clarify { question: "Which season?".into() }).unwrap();
        assert_eq!(clarify, json!({"action": "clarify", "question": "Which season?"}));
    }

    #[test]
    fn recall_query_prefers_sql_text() {
        assert_eq!(Plan::recall_query(&json!({"query": "SELECT hr"})), "SELECT hr");
        assert_eq!(Plan::recall_query(&json!({"table": "batting"})), r#"{"table":"batting"}"#);
    }
}
