pub mod ask_question;
pub mod cancel_task;
pub mod get_task;
pub mod give_feedback;
pub mod retry_message;

use std::sync::Arc;
use std::time::Duration;

use ask_question::AskQuestionParams;
use cancel_task::CancelTaskParams;
use get_task::GetTaskParams;
use give_feedback::GiveFeedbackParams;
use retry_message::RetryMessageParams;
use rmcp::handler::server::tool::ToolRouter;
use rmcp::handler::server::wrapper::Parameters;
use rmcp::{tool, tool_handler, tool_router, ServerHandler};
use serde_json::json;

use crate::client::{poll_task, PollOptions, PollOutcome};
use crate::task::{ConversationCoordinator, TaskHandle};

/// Longest an `ask_question` call will block waiting for its answer.
const MAX_WAIT_SECS: u64 = 90;

/// The Blitz MCP tool handler. Exposes the conversation coordinator with the
/// same semantics as the HTTP routes.
#[derive(Clone)]
pub struct BlitzTools {
    tool_router: ToolRouter<Self>,
    coordinator: Arc<ConversationCoordinator>,
}

fn to_json<T: serde::Serialize>(value: &T) -> Result<String, String> {
    serde_json::to_string(value).map_err(|e| format!("serialization failed: {e}"))
}

#[tool_router]
impl BlitzTools {
    pub fn new(coordinator: Arc<ConversationCoordinator>) -> Self {
        Self {
            tool_router: Self::tool_router(),
            coordinator,
        }
    }

    /// Submit a question and optionally wait for the answer.
    #[tool(description = "Ask a sports statistics question. Returns a task id to poll with get_task; set wait_seconds to block until the answer is ready.")]
    async fn ask_question(
        &self,
        Parameters(params): Parameters<AskQuestionParams>,
    ) -> Result<String, String> {
        tracing::info!(
            question_len = params.question.len(),
            conversation_id = ?params.conversation_id,
            "ask_question called"
        );

        let handle = self
            .coordinator
            .submit(params.conversation_id.as_deref(), &params.question, None)
            .await
            .map_err(|e| e.public_message())?;

        let wait = params.wait_seconds.unwrap_or(0).min(MAX_WAIT_SECS);
        if wait == 0 {
            return to_json(&handle);
        }
        self.wait_for(handle, Duration::from_secs(wait)).await
    }

    /// Poll a task.
    #[tool(description = "Get the status of a task: queued, processing, complete, error, clarification_needed, cancelled or not_found.")]
    async fn get_task(&self, Parameters(params): Parameters<GetTaskParams>) -> Result<String, String> {
        to_json(&self.coordinator.get(&params.task_id))
    }

    #[tool(description = "Request cancellation of a queued or processing task.")]
    async fn cancel_task(
        &self,
        Parameters(params): Parameters<CancelTaskParams>,
    ) -> Result<String, String> {
        tracing::info!(task_id = %params.task_id, "cancel_task called");
        let ok = self.coordinator.cancel(&params.task_id);
        Ok(json!({ "ok": ok }).to_string())
    }

    /// Replace an exchange with a fresh answer.
    #[tool(description = "Retry a message: removes it and everything after it, then answers the same question again under a new task id.")]
    async fn retry_message(
        &self,
        Parameters(params): Parameters<RetryMessageParams>,
    ) -> Result<String, String> {
        tracing::info!(
            conversation_id = %params.conversation_id,
            message_id = params.message_id,
            "retry_message called"
        );
        let handle = self
            .coordinator
            .retry(&params.conversation_id, params.message_id)
            .await
            .map_err(|e| e.public_message())?;
        to_json(&handle)
    }

    #[tool(description = "Rate an answer. An unhelpful answer's query is not reused for similar questions; rating it helpful again restores it.")]
    async fn give_feedback(
        &self,
        Parameters(params): Parameters<GiveFeedbackParams>,
    ) -> Result<String, String> {
        tracing::info!(
            conversation_id = %params.conversation_id,
            message_id = params.message_id,
            helpful = params.helpful,
            "give_feedback called"
        );
        let receipt = self
            .coordinator
            .feedback(&params.conversation_id, params.message_id, params.helpful)
            .await
            .map_err(|e| e.public_message())?;
        to_json(&receipt)
    }
}

impl BlitzTools {
    async fn wait_for(&self, handle: TaskHandle, deadline: Duration) -> Result<String, String> {
        let coordinator = Arc::clone(&self.coordinator);
        let task_id = handle.task_id.clone();
        let options = PollOptions {
            interval: Duration::from_millis(250),
            deadline,
        };
        let outcome = poll_task(
            || {
                let view = coordinator.get(&task_id);
                async move { Ok(view) }
            },
            options,
            std::future::pending(),
        )
        .await
        .map_err(|e| e.to_string())?;

        match outcome {
            PollOutcome::Finished(view) => to_json(&view),
            PollOutcome::DeadlineExceeded(_) | PollOutcome::Cancelled => {
                to_json(&self.coordinator.get(&handle.task_id))
            }
        }
    }
}

#[tool_handler]
impl ServerHandler for BlitzTools {
    fn get_info(&self) -> rmcp::model::ServerInfo {
        rmcp::model::ServerInfo {
            instructions: Some(
                "Blitz answers sports statistics questions. Use ask_question to submit, \
                 get_task to poll for the answer, cancel_task to stop, retry_message \
                 to regenerate an answer and give_feedback to flag a wrong one."
                    .into(),
            ),
            capabilities: rmcp::model::ServerCapabilities::builder()
                .enable_tools()
                .build(),
            ..Default::default()
        }
    }
}
