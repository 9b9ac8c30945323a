//! Task records and the payload served to pollers.

use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::conversation::{Feedback, Message};
use crate::error::ErrorKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Queued,
    Processing,
    Complete,
    Error,
    ClarificationNeeded,
    Cancelled,
    /// Never stored; reported for unknown or evicted ids.
    NotFound,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Processing => "processing",
            Self::Complete => "complete",
            Self::Error => "error",
            Self::ClarificationNeeded => "clarification_needed",
            Self::Cancelled => "cancelled",
            Self::NotFound => "not_found",
        }
    }

    /// Terminal states are written once and never change afterwards.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Complete | Self::Error | Self::ClarificationNeeded | Self::Cancelled
        )
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Worker progress. Declaration order is execution order; the store only
/// accepts forward moves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Step {
    Queued,
    Recalling,
    Planning,
    Querying,
    Composing,
    Saving,
}

impl Step {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Queued => "Waiting to start",
            Self::Recalling => "Searching past answers",
            Self::Planning => "Understanding the question",
            Self::Querying => "Running query",
            Self::Composing => "Writing answer",
            Self::Saving => "Saving",
        }
    }
}

/// In-memory task record. Lives in the [`TaskStore`](super::store::TaskStore) only.
#[derive(Debug, Clone)]
pub struct TaskRecord {
    pub id: String,
    pub conversation_id: String,
    /// Ordinal of the user message this task answers.
    pub message_id: i64,
    pub status: TaskStatus,
    pub step: Step,
    pub cancel_requested: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    /// Monotonic start, for the processing ceiling.
    pub started: Instant,
    /// Monotonic terminal time, for TTL eviction.
    pub finished: Option<Instant>,
    /// Ordinal of the assistant message produced on completion.
    pub result_message_id: Option<i64>,
    pub error: Option<String>,
    pub error_kind: Option<ErrorKind>,
    pub clarification: Option<String>,
    pub title: Option<String>,
    pub user_message: Message,
    pub assistant_message: Option<Message>,
}

impl TaskRecord {
    pub fn queued(id: String, user_message: Message, title: Option<String>) -> Self {
        let now = Utc::now();
        Self {
            id,
            conversation_id: user_message.conversation_id.clone(),
            message_id: user_message.id,
            status: TaskStatus::Queued,
            step: Step::Queued,
            cancel_requested: false,
            created_at: now,
            updated_at: now,
            finished_at: None,
            started: Instant::now(),
            finished: None,
            result_message_id: None,
            error: None,
            error_kind: None,
            clarification: None,
            title,
            user_message,
            assistant_message: None,
        }
    }

    pub fn view(&self) -> TaskView {
        TaskView {
            task_id: self.id.clone(),
            status: self.status,
            step: Some(self.step.label().to_string()),
            conversation_id: Some(self.conversation_id.clone()),
            user_message: Some(self.user_message.clone()),
            assistant_message: self.assistant_message.clone(),
            error: self.error.clone(),
            error_kind: self.error_kind,
            clarification: self.clarification.clone(),
            title: self.title.clone(),
        }
    }
}

/// Poll payload for `GET /tasks/{task_id}`. Built only from fields that are
/// frozen once the task is terminal, so repeated polls serialize identically.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskView {
    pub task_id: String,
    pub status: TaskStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_message: Option<Message>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assistant_message: Option<Message>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub clarification: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
}

impl TaskView {
    pub fn not_found(task_id: &str) -> Self {
        Self {
            task_id: task_id.to_string(),
            status: TaskStatus::NotFound,
            step: None,
            conversation_id: None,
            user_message: None,
            assistant_message: None,
            error: None,
            error_kind: None,
            clarification: None,
            title: None,
        }
    }
}

/// Handle returned by submit/retry/edit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskHandle {
    pub task_id: String,
    pub conversation_id: String,
    pub message_id: i64,
}

/// Result of rating an assistant message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeedbackReceipt {
    pub conversation_id: String,
    pub message_id: i64,
    pub feedback: Feedback,
    /// Whether a remembered `(question, query)` pair was demoted or restored.
    pub recall_updated: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn steps_are_ordered_by_execution() {
        assert!(Step::Queued < Step::Recalling);
        assert!(Step::Planning < Step::Querying);
        assert!(Step::Composing < Step::Saving);
    }

    #[test]
    fn terminal_states() {
        assert!(TaskStatus::ClarificationNeeded.is_terminal());
        assert!(TaskStatus::Cancelled.is_terminal());
        assert!(!TaskStatus::Processing.is_terminal());
        assert!(!TaskStatus::NotFound.is_terminal());
    }

    #[test]
    fn not_found_payload_is_minimal() {
        let json = serde_json::to_value(TaskView::not_found("t-1")).unwrap();
        assert_eq!(json, serde_json::json!({"task_id": "t-1", "status": "not_found"}));
    }
}
