//! Error taxonomy shared by the coordinator, worker and transports.
//!
//! Synchronous rejections ([`CoordinatorError`]) are returned to the caller.
//! Failures inside a running task are folded into a [`TaskFailure`], whose
//! [`TaskFailure::public_message`] is the only text a client ever sees.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors returned synchronously by the conversation coordinator.
#[derive(Debug, Error)]
pub enum CoordinatorError {
    /// Malformed or empty input. Never becomes a task.
    #[error("invalid request: {0}")]
    Validation(String),

    /// The conversation already owns a queued or processing task.
    #[error("conversation {conversation_id} already has a task in progress ({task_id})")]
    ConversationBusy {
        conversation_id: String,
        task_id: String,
    },

    #[error("{0} not found")]
    NotFound(String),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl CoordinatorError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation_error",
            Self::ConversationBusy { .. } => "conversation_busy",
            Self::NotFound(_) => "not_found",
            Self::Internal(_) => "internal_error",
        }
    }

    /// Message safe to hand to a client.
    pub fn public_message(&self) -> String {
        match self {
            Self::Internal(_) => "Internal server error".to_string(),
            other => other.to_string(),
        }
    }
}

/// Failure of a single tool invocation.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ToolInvocationError {
    #[error("tool call timed out")]
    Timeout,

    #[error("tool server returned {status}")]
    Server { status: u16 },

    #[error("tool transport failed: {0}")]
    Transport(String),

    /// The tool ran and refused the input (bad SQL, unknown table...). Not retried.
    #[error("tool rejected the request: {0}")]
    Rejected(String),
}

impl ToolInvocationError {
    /// Timeouts, 5xx and connection failures are worth another attempt.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Timeout | Self::Transport(_) => true,
            Self::Server { status } => *status >= 500,
            Self::Rejected(_) => false,
        }
    }
}

/// Failure of one recall tier. Logged and swallowed by the engine.
#[derive(Debug, Error)]
pub enum RecallBackendError {
    #[error("backend unavailable: {0}")]
    Unavailable(String),

    #[error("backend query timed out")]
    Timeout,

    #[error(transparent)]
    Query(#[from] anyhow::Error),
}

/// Machine-readable class of a task error, exposed to clients so they can offer "retry".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Timeout,
    Tool,
    Assistant,
    Internal,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Timeout => "timeout",
            Self::Tool => "tool",
            Self::Assistant => "assistant",
            Self::Internal => "internal",
        }
    }
}

/// Why a running task stopped without completing.
#[derive(Debug, Error)]
pub enum TaskFailure {
    #[error("task exceeded its processing ceiling")]
    Timeout,

    #[error("task cancelled")]
    Cancelled,

    /// The task was finalized by someone else (cancel, timeout sweep, truncation).
    #[error("task already finalized")]
    Superseded,

    #[error("tool invocation failed: {0}")]
    Tool(#[from] ToolInvocationError),

    #[error("assistant failed: {0}")]
    Assistant(String),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl TaskFailure {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Timeout => ErrorKind::Timeout,
            Self::Tool(_) => ErrorKind::Tool,
            Self::Assistant(_) => ErrorKind::Assistant,
            Self::Cancelled | Self::Superseded | Self::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Sanitized text for the task payload. Internal detail stays in the logs.
    pub fn public_message(&self) -> String {
        match self {
            Self::Timeout => "The request took too long to complete. Please retry.".into(),
            Self::Tool(e) if e.is_transient() => {
                "The data service is temporarily unavailable. Please retry.".into()
            }
            Self::Tool(_) => "The query for this question could not be run.".into(),
            Self::Assistant(_) => "The assistant could not produce an answer.".into(),
            Self::Cancelled => "The request was cancelled.".into(),
            Self::Superseded | Self::Internal(_) => {
                "Something went wrong while answering. Please retry.".into()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_classes() {
        assert!(ToolInvocationError::Timeout.is_transient());
        assert!(ToolInvocationError::Server { status: 503 }.is_transient());
        assert!(!ToolInvocationError::Server { status: 400 }.is_transient());
        assert!(!ToolInvocationError::Rejected("syntax error".into()).is_transient());
    }

    #[test]
    fn internal_detail_is_not_exposed() {
        let failure = TaskFailure::Internal(anyhow::anyhow!("db lock poisoned at store.rs:42"));
        assert!(!failure.public_message().contains("store.rs"));
        assert_eq!(failure.kind(), ErrorKind::Internal);

        let err = CoordinatorError::Internal(anyhow::anyhow!("disk I/O error"));
        assert_eq!(err.public_message(), "Internal server error");
    }

    #[test]
    fn timeout_is_distinguishable() {
        assert_eq!(TaskFailure::Timeout.kind(), ErrorKind::Timeout);
        assert_ne!(
            TaskFailure::Tool(ToolInvocationError::Timeout).kind(),
            ErrorKind::Timeout
        );
    }
}
