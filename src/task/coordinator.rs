//! Conversation-level operations: submit, retry, edit, truncate.
//!
//! The coordinator owns the ordering rules. A conversation's single task slot
//! is claimed in the [`TaskStore`] before any message is appended, so two
//! concurrent submits can never interleave their messages.

use std::sync::Arc;

use super::store::TaskStore;
use super::types::{FeedbackReceipt, TaskHandle, TaskRecord, TaskView};
use super::worker::Worker;
use crate::conversation::types::derive_title;
use crate::conversation::{store as conversations, Feedback, Message, NewMessage, Role};
use crate::db::{self, SharedDb};
use crate::error::CoordinatorError;
use crate::recall::engine::SemanticRecallEngine;

pub struct ConversationCoordinator {
    db: SharedDb,
    tasks: Arc<TaskStore>,
    worker: Arc<Worker>,
    recall: Option<Arc<SemanticRecallEngine>>,
    max_content_chars: usize,
}

impl ConversationCoordinator {
    pub fn new(
        db: SharedDb,
        tasks: Arc<TaskStore>,
        worker: Arc<Worker>,
        recall: Option<Arc<SemanticRecallEngine>>,
        max_content_chars: usize,
    ) -> Self {
        Self { db, tasks, worker, recall, max_content_chars }
    }

    pub fn tasks(&self) -> &Arc<TaskStore> {
        &self.tasks
    }

    fn validate_content(&self, content: &str) -> Result<(), CoordinatorError> {
        if content.trim().is_empty() {
            return Err(CoordinatorError::Validation("message content must not be empty".into()));
        }
        let len = content.chars().count();
        if len > self.max_content_chars {
            return Err(CoordinatorError::Validation(format!(
                "message content is {len} characters, limit is {}",
                self.max_content_chars
            )));
        }
        Ok(())
    }

    /// Append a user message and start answering it.
    ///
    /// Without `conversation_id` a new conversation is created; an unknown id is
    /// created as given.
    pub async fn submit(
        &self,
        conversation_id: Option<&str>,
        content: &str,
        user_id: Option<&str>,
    ) -> Result<TaskHandle, CoordinatorError> {
        self.validate_content(content)?;
        if conversation_id.is_some_and(|id| id.trim().is_empty()) {
            return Err(CoordinatorError::Validation("conversation id must not be empty".into()));
        }

        let (requested, user) = (conversation_id.map(str::to_string), user_id.map(str::to_string));
        let (conversation, created) = db::with_conn(&self.db, move |conn| {
            conversations::ensure_conversation(conn, requested.as_deref(), user.as_deref())
        })
        .await?;
        let title = conversation.title.clone().or_else(|| Some(derive_title(content)));

        let task_id = self.tasks.reserve(&conversation.id)?;
        let message = match self.append_user(&conversation.id, content, &task_id).await {
            Ok(message) => message,
            Err(e) => {
                self.tasks.release_reservation(&conversation.id, &task_id);
                return Err(e);
            }
        };

        tracing::info!(
            conversation_id = %conversation.id,
            message_id = message.id,
            task_id = %task_id,
            new_conversation = created,
            "message submitted"
        );
        Ok(self.start(task_id, message, title))
    }

    /// Re-run the exchange at `message_id`. An assistant target resolves to the
    /// user message before it. Everything from that user message on is replaced.
    pub async fn retry(
        &self,
        conversation_id: &str,
        message_id: i64,
    ) -> Result<TaskHandle, CoordinatorError> {
        let id = conversation_id.to_string();
        let target = db::with_conn(&self.db, move |conn| {
            if conversations::get_conversation(conn, &id)?.is_none() {
                return Err(CoordinatorError::NotFound(format!("conversation {id}")));
            }
            conversations::user_message_at_or_before(conn, &id, message_id)?
                .ok_or_else(|| CoordinatorError::NotFound(format!("message {message_id}")))
        })
        .await?;

        let content = target.content.clone();
        self.restart(conversation_id, target, &content).await
    }

    /// Replace the user message at `message_id` with `content` and answer it anew.
    pub async fn edit(
        &self,
        conversation_id: &str,
        message_id: i64,
        content: &str,
    ) -> Result<TaskHandle, CoordinatorError> {
        self.validate_content(content)?;

        let id = conversation_id.to_string();
        let target = db::with_conn(&self.db, move |conn| {
            conversations::get_message(conn, &id, message_id)?
                .ok_or_else(|| CoordinatorError::NotFound(format!("message {message_id}")))
        })
        .await?;
        if target.role != Role::User {
            return Err(CoordinatorError::Validation("only user messages can be edited".into()));
        }

        self.restart(conversation_id, target, content).await
    }

    async fn restart(
        &self,
        conversation_id: &str,
        target: Message,
        content: &str,
    ) -> Result<TaskHandle, CoordinatorError> {
        if let Some(active) = self.tasks.active_for(conversation_id) {
            tracing::info!(task_id = %active.id, "cancelling active task before restart");
            self.tasks.force_cancel(&active.id);
        }
        let task_id = self.tasks.reserve(conversation_id)?;

        let (id, tid, text, from) = (
            conversation_id.to_string(),
            task_id.clone(),
            content.to_string(),
            target.id,
        );
        let replaced = db::with_conn(&self.db, move |conn| -> Result<_, CoordinatorError> {
            let removed = conversations::truncate_from(conn, &id, from)?;
            let message =
                conversations::append_message(conn, &id, NewMessage::user(&text).with_task(&tid))?;
            let title = conversations::get_conversation(conn, &id)?.and_then(|c| c.title);
            Ok((removed, message, title))
        })
        .await;

        let (removed, message, title) = match replaced {
            Ok(replaced) => replaced,
            Err(e) => {
                self.tasks.release_reservation(conversation_id, &task_id);
                return Err(e);
            }
        };
        debug_assert_eq!(message.id, target.id);

        tracing::info!(
            conversation_id,
            message_id = message.id,
            removed,
            task_id = %task_id,
            "exchange restarted"
        );
        Ok(self.start(task_id, message, title))
    }

    /// Delete every message after `message_id`. Returns how many were removed.
    pub async fn truncate_after(
        &self,
        conversation_id: &str,
        message_id: i64,
    ) -> Result<usize, CoordinatorError> {
        self.require_conversation(conversation_id).await?;

        if let Some(active) = self.tasks.active_for(conversation_id) {
            if active.message_id > message_id {
                tracing::info!(task_id = %active.id, "cancelling task whose message is being removed");
                self.tasks.force_cancel(&active.id);
            }
        }

        let id = conversation_id.to_string();
        let deleted = db::with_conn(&self.db, move |conn| {
            conversations::truncate_from(conn, &id, message_id + 1)
        })
        .await?;
        tracing::info!(conversation_id, after = message_id, deleted, "conversation truncated");
        Ok(deleted)
    }

    /// Request cancellation. `false` if the task is unknown.
    pub fn cancel(&self, task_id: &str) -> bool {
        self.tasks.cancel(task_id)
    }

    pub fn get(&self, task_id: &str) -> TaskView {
        self.tasks.get(task_id)
    }

    pub async fn messages(&self, conversation_id: &str) -> Result<Vec<Message>, CoordinatorError> {
        let id = conversation_id.to_string();
        db::with_conn(&self.db, move |conn| {
            if conversations::get_conversation(conn, &id)?.is_none() {
                return Err(CoordinatorError::NotFound(format!("conversation {id}")));
            }
            Ok(conversations::list_messages(conn, &id)?)
        })
        .await
    }

    pub async fn delete_conversation(&self, conversation_id: &str) -> Result<(), CoordinatorError> {
        if let Some(active) = self.tasks.active_for(conversation_id) {
            self.tasks.force_cancel(&active.id);
        }
        let id = conversation_id.to_string();
        let deleted =
            db::with_conn(&self.db, move |conn| conversations::delete_conversation(conn, &id))
                .await?;
        if !deleted {
            return Err(CoordinatorError::NotFound(format!("conversation {conversation_id}")));
        }
        tracing::info!(conversation_id, "conversation deleted");
        Ok(())
    }

    /// Rate an assistant answer. An unhelpful answer's query is no longer
    /// offered by recall; rating it helpful again restores it.
    pub async fn feedback(
        &self,
        conversation_id: &str,
        message_id: i64,
        helpful: bool,
    ) -> Result<FeedbackReceipt, CoordinatorError> {
        let feedback = Feedback::from_helpful(helpful);
        let id = conversation_id.to_string();
        let task_id = db::with_conn(&self.db, move |conn| {
            let Some(message) = conversations::get_message(conn, &id, message_id)? else {
                return Err(CoordinatorError::NotFound(format!("message {message_id} in {id}")));
            };
            if message.role != Role::Assistant {
                return Err(CoordinatorError::Validation(
                    "only assistant messages can be rated".into(),
                ));
            }
            conversations::set_feedback(conn, &id, message_id, feedback)?;
            Ok(message.task_id)
        })
        .await?;

        let recall_updated = match (&self.recall, task_id) {
            (Some(engine), Some(task_id)) => engine
                .apply_feedback(&task_id, helpful)
                .await
                .unwrap_or_else(|e| {
                    tracing::warn!(task_id = %task_id, error = %e, "could not apply feedback to recall");
                    false
                }),
            _ => false,
        };
        tracing::info!(
            conversation_id,
            message_id,
            feedback = feedback.as_str(),
            recall_updated,
            "feedback recorded"
        );

        Ok(FeedbackReceipt {
            conversation_id: conversation_id.to_string(),
            message_id,
            feedback,
            recall_updated,
        })
    }

    async fn require_conversation(&self, conversation_id: &str) -> Result<(), CoordinatorError> {
        let id = conversation_id.to_string();
        db::with_conn(&self.db, move |conn| {
            match conversations::get_conversation(conn, &id)? {
                Some(_) => Ok(()),
                None => Err(CoordinatorError::NotFound(format!("conversation {id}"))),
            }
        })
        .await
    }

    async fn append_user(
        &self,
        conversation_id: &str,
        content: &str,
        task_id: &str,
    ) -> Result<Message, CoordinatorError> {
        let (id, text, tid) = (conversation_id.to_string(), content.to_string(), task_id.to_string());
        db::with_conn(&self.db, move |conn| {
            conversations::append_message(conn, &id, NewMessage::user(&text).with_task(&tid))
        })
        .await
        .map_err(CoordinatorError::from)
    }

    fn start(&self, task_id: String, message: Message, title: Option<String>) -> TaskHandle {
        let handle = TaskHandle {
            task_id: task_id.clone(),
            conversation_id: message.conversation_id.clone(),
            message_id: message.id,
        };
        self.tasks.insert(TaskRecord::queued(task_id.clone(), message, title));
        self.worker.spawn(task_id);
        handle
    }
}
