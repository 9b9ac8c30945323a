//! Runs one task through recall → plan → query → compose → save.
//!
//! Every external call is preceded by a [`TaskStore::checkpoint`], where
//! cancellation and the processing ceiling are observed, and is bounded by
//! `call_timeout` capped by whatever remains of the ceiling. The assistant
//! message is staged in a database transaction that only commits if
//! [`TaskStore::finish_live`] accepts the same outcome, so a task finalized
//! elsewhere never gets a late assistant message.

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use rusqlite::Transaction;
use serde_json::Value;
use tracing::Instrument;

use super::store::{TaskOutcome, TaskStore};
use super::types::{Step, TaskRecord, TaskStatus};
use crate::agent::{Assistant, ComposeRequest, Plan, PlanRequest, RecallHint, ToolInvoker, Turn};
use crate::config::{AgentConfig, TaskConfig};
use crate::conversation::{store as conversations, NewMessage};
use crate::db::{self, SharedDb};
use crate::error::{TaskFailure, ToolInvocationError};
use crate::recall::engine::SemanticRecallEngine;

/// Pause between transient tool failures, multiplied by the attempt number.
const RETRY_BACKOFF: Duration = Duration::from_millis(200);

#[derive(Debug, Clone)]
pub struct WorkerSettings {
    pub call_timeout: Duration,
    pub tool_retries: u32,
    pub history_limit: usize,
    /// Only answers produced through this tool are learned for recall.
    pub sql_tool: String,
}

impl WorkerSettings {
    pub fn new(tasks: &TaskConfig, agent: &AgentConfig) -> Self {
        Self {
            call_timeout: tasks.call_timeout(),
            tool_retries: tasks.tool_retries,
            history_limit: tasks.history_limit,
            sql_tool: agent.sql_tool.clone(),
        }
    }
}

/// Why a bounded call did not return.
enum Elapsed {
    /// The processing ceiling ran out.
    Ceiling,
    /// Only the per-call bound ran out.
    Call,
}

/// How a task is about to end, before anything is persisted.
enum Ending {
    Answer(String),
    Clarify(String),
    Failed(TaskFailure),
}

pub struct Worker {
    tasks: Arc<TaskStore>,
    db: SharedDb,
    recall: Option<Arc<SemanticRecallEngine>>,
    assistant: Arc<dyn Assistant>,
    tools: Arc<dyn ToolInvoker>,
    settings: WorkerSettings,
}

impl Worker {
    pub fn new(
        tasks: Arc<TaskStore>,
        db: SharedDb,
        recall: Option<Arc<SemanticRecallEngine>>,
        assistant: Arc<dyn Assistant>,
        tools: Arc<dyn ToolInvoker>,
        settings: WorkerSettings,
    ) -> Self {
        Self { tasks, db, recall, assistant, tools, settings }
    }

    pub fn spawn(self: &Arc<Self>, task_id: String) -> tokio::task::JoinHandle<()> {
        let worker = Arc::clone(self);
        let span = tracing::info_span!("task", task_id = %task_id);
        tokio::spawn(async move { worker.run(&task_id).await }.instrument(span))
    }

    pub async fn run(&self, task_id: &str) {
        if self.tasks.start(task_id).is_err() {
            tracing::debug!("task finalized before it started");
            return;
        }
        let Some(record) = self.tasks.record(task_id) else {
            return;
        };

        let (ending, learned) = match self.execute(&record).await {
            Ok(done) => done,
            Err(failure) => (Ending::Failed(failure), None),
        };

        let status = self.end(&record, ending).await;
        if let (Some(TaskStatus::Complete), Some(query)) = (status, learned) {
            self.remember(task_id, &record.user_message.content, &query).await;
        }
    }

    /// The ending, plus the query worth remembering if the answer came from one.
    async fn execute(&self, record: &TaskRecord) -> Result<(Ending, Option<String>), TaskFailure> {
        let task_id = record.id.as_str();
        let started = record.started;
        let question = record.user_message.content.as_str();

        self.tasks.checkpoint(task_id, Step::Recalling)?;
        let hint = self.recall_hint(started, question).await?;

        let limit = self.settings.history_limit;
        let (conversation_id, before) = (record.conversation_id.clone(), record.message_id);
        let history: Vec<Turn> = db::with_conn(&self.db, move |conn| {
            conversations::history_before(conn, &conversation_id, before, limit)
        })
        .await?
        .iter()
        .map(Turn::from)
        .collect();

        self.tasks.checkpoint(task_id, Step::Planning)?;
        let plan = self
            .bounded(
                started,
                self.assistant.plan(PlanRequest {
                    question,
                    history: &history,
                    recall: hint.as_ref(),
                }),
            )
            .await
            .map_err(elapsed_to_assistant)?
            .map_err(assistant_failure)?;

        let (tool, args) = match plan {
            Plan::Clarify { question } => return Ok((Ending::Clarify(question), None)),
            Plan::Answer { text } => {
                self.tasks.checkpoint(task_id, Step::Saving)?;
                return Ok((Ending::Answer(text), None));
            }
            Plan::Query { tool, args } => (tool, args),
        };

        self.tasks.checkpoint(task_id, Step::Querying)?;
        let result = self.invoke_with_retries(task_id, started, &tool, &args).await?;

        self.tasks.checkpoint(task_id, Step::Composing)?;
        let answer = self
            .bounded(
                started,
                self.assistant.compose(ComposeRequest {
                    question,
                    history: &history,
                    tool: &tool,
                    args: &args,
                    result: &result,
                }),
            )
            .await
            .map_err(elapsed_to_assistant)?
            .map_err(assistant_failure)?;

        self.tasks.checkpoint(task_id, Step::Saving)?;
        let learned = (tool == self.settings.sql_tool).then(|| Plan::recall_query(&args));
        Ok((Ending::Answer(answer), learned))
    }

    async fn recall_hint(
        &self,
        started: Instant,
        question: &str,
    ) -> Result<Option<RecallHint>, TaskFailure> {
        let Some(engine) = &self.recall else {
            return Ok(None);
        };
        match self.bounded(started, engine.lookup(question)).await {
            Ok(candidate) => Ok(candidate.as_ref().map(RecallHint::from)),
            Err(Elapsed::Ceiling) => Err(TaskFailure::Timeout),
            Err(Elapsed::Call) => {
                tracing::warn!("recall lookup timed out, continuing without a hint");
                Ok(None)
            }
        }
    }

    async fn invoke_with_retries(
        &self,
        task_id: &str,
        started: Instant,
        tool: &str,
        args: &Value,
    ) -> Result<Value, TaskFailure> {
        let mut attempt = 0;
        loop {
            let result = match self.bounded(started, self.tools.invoke(tool, args.clone())).await {
                Ok(result) => result,
                Err(Elapsed::Ceiling) => return Err(TaskFailure::Timeout),
                Err(Elapsed::Call) => Err(ToolInvocationError::Timeout),
            };
            match result {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() && attempt < self.settings.tool_retries => {
                    attempt += 1;
                    tracing::warn!(tool, attempt, error = %e, "transient tool failure, retrying");
                    tokio::time::sleep(RETRY_BACKOFF * attempt).await;
                    self.tasks.checkpoint(task_id, Step::Querying)?;
                }
                Err(e) => {
                    tracing::warn!(tool, attempts = attempt + 1, error = %e, "tool invocation failed");
                    return Err(TaskFailure::Tool(e));
                }
            }
        }
    }

    /// Await `fut` for at most `call_timeout`, and never past the ceiling.
    async fn bounded<F: Future>(&self, started: Instant, fut: F) -> Result<F::Output, Elapsed> {
        let remaining = self.tasks.timeout().saturating_sub(started.elapsed());
        if remaining.is_zero() {
            return Err(Elapsed::Ceiling);
        }
        let (limit, on_elapsed) = if remaining <= self.settings.call_timeout {
            (remaining, Elapsed::Ceiling)
        } else {
            (self.settings.call_timeout, Elapsed::Call)
        };
        tokio::time::timeout(limit, fut).await.map_err(|_| on_elapsed)
    }

    /// Write the terminal state together with the assistant message that goes with it.
    /// Returns `None` when the task had already been finalized elsewhere.
    async fn end(&self, record: &TaskRecord, ending: Ending) -> Option<TaskStatus> {
        let fallback = match &ending {
            Ending::Failed(TaskFailure::Superseded) => {
                tracing::debug!("task finalized elsewhere; result discarded");
                return None;
            }
            Ending::Failed(TaskFailure::Cancelled) => TaskOutcome::Cancelled,
            Ending::Failed(failure) => {
                match failure {
                    TaskFailure::Internal(e) => tracing::error!(error = %e, "task failed"),
                    other => tracing::warn!(error = %other, "task failed"),
                }
                TaskOutcome::from_failure(failure)
            }
            _ => TaskOutcome::from_failure(&TaskFailure::Internal(anyhow::anyhow!(
                "assistant message could not be saved"
            ))),
        };

        let tasks = Arc::clone(&self.tasks);
        let db = SharedDb::clone(&self.db);
        let task_id = record.id.clone();
        let conversation_id = record.conversation_id.clone();

        let finished = tokio::task::spawn_blocking(move || -> Result<TaskStatus, TaskFailure> {
            // Lock order is db, then store; the store lock is only held inside `finish_live`.
            let mut conn = db::lock(&db)?;
            let tx = conn.transaction().map_err(anyhow::Error::from)?;
            let staged = stage(&tx, &conversation_id, &task_id, ending)?;
            let expected = staged.status();
            let status = tasks.finish_live(&task_id, staged)?;
            if status == expected {
                if let Err(e) = tx.commit() {
                    tracing::error!(error = %e, "task finalized but its message was not saved");
                }
            }
            Ok(status)
        })
        .await
        .map_err(|e| TaskFailure::Internal(anyhow::anyhow!("finalize task failed: {e}")))
        .and_then(|result| result);

        match finished {
            Ok(status) => Some(status),
            Err(TaskFailure::Superseded) => {
                tracing::debug!("task finalized elsewhere; result discarded");
                None
            }
            Err(e) => {
                tracing::error!(error = %e, "could not persist task result");
                // Still release the conversation.
                self.tasks.finish(&record.id, fallback);
                self.tasks.record(&record.id).map(|t| t.status)
            }
        }
    }

    async fn remember(&self, task_id: &str, question: &str, query: &str) {
        let Some(engine) = &self.recall else {
            return;
        };
        if let Err(e) = engine.record(task_id, question, query).await {
            tracing::warn!(error = %e, "failed to record answered question for recall");
        }
    }
}

/// Write the message that goes with `ending` into `tx` without committing it.
fn stage(
    tx: &Transaction<'_>,
    conversation_id: &str,
    task_id: &str,
    ending: Ending,
) -> Result<TaskOutcome, TaskFailure> {
    match ending {
        Ending::Clarify(question) => Ok(TaskOutcome::Clarification { question }),
        Ending::Failed(TaskFailure::Cancelled) => Ok(TaskOutcome::Cancelled),
        Ending::Answer(text) => {
            let message =
                conversations::insert_message(tx, conversation_id, NewMessage::assistant(&text, task_id))?;
            Ok(TaskOutcome::Complete { assistant_message: message })
        }
        Ending::Failed(failure) => {
            let text = failure.public_message();
            conversations::insert_message(
                tx,
                conversation_id,
                NewMessage::assistant_error(&text, failure.kind().as_str(), task_id),
            )?;
            Ok(TaskOutcome::from_failure(&failure))
        }
    }
}

fn elapsed_to_assistant(elapsed: Elapsed) -> TaskFailure {
    match elapsed {
        Elapsed::Ceiling => TaskFailure::Timeout,
        Elapsed::Call => TaskFailure::Assistant("assistant call timed out".into()),
    }
}

fn assistant_failure(err: anyhow::Error) -> TaskFailure {
    TaskFailure::Assistant(format!("{err:#}"))
}
