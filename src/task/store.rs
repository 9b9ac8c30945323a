//! In-memory task registry with TTL eviction and per-conversation ownership.
//!
//! One `std::sync::Mutex` guards both the task map and the ownership map, so
//! claiming a conversation, finalizing a task and releasing its conversation are
//! each a single atomic step. The lock is never held across an `.await`.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use chrono::Utc;

use super::types::{Step, TaskRecord, TaskStatus, TaskView};
use crate::conversation::Message;
use crate::error::{CoordinatorError, ErrorKind, TaskFailure};

/// How a task ends.
#[derive(Debug, Clone)]
pub enum TaskOutcome {
    Complete { assistant_message: Message },
    Failed { kind: ErrorKind, message: String },
    Clarification { question: String },
    Cancelled,
}

impl TaskOutcome {
    pub fn status(&self) -> TaskStatus {
        match self {
            Self::Complete { .. } => TaskStatus::Complete,
            Self::Failed { .. } => TaskStatus::Error,
            Self::Clarification { .. } => TaskStatus::ClarificationNeeded,
            Self::Cancelled => TaskStatus::Cancelled,
        }
    }

    pub fn from_failure(failure: &TaskFailure) -> Self {
        match failure {
            TaskFailure::Cancelled => Self::Cancelled,
            other => Self::Failed {
                kind: other.kind(),
                message: other.public_message(),
            },
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepReport {
    pub timed_out: usize,
    pub evicted: usize,
}

#[derive(Default)]
struct Inner {
    tasks: HashMap<String, TaskRecord>,
    /// conversation_id → task_id of its single non-terminal task.
    owners: HashMap<String, String>,
}

pub struct TaskStore {
    inner: Mutex<Inner>,
    timeout: Duration,
    ttl_margin: Duration,
}

impl TaskStore {
    /// `ttl_margin` must exceed `timeout`; config validation enforces it.
    pub fn new(timeout: Duration, ttl_margin: Duration) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            timeout,
            ttl_margin,
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        // A panic elsewhere must not wedge every poller; the maps stay consistent
        // because every mutation is a single insert/remove.
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Claim `conversation_id` for a new task id. Fails if it already owns a
    /// non-terminal task (after applying the timeout ceiling to that task).
    pub fn reserve(&self, conversation_id: &str) -> Result<String, CoordinatorError> {
        let mut inner = self.lock();
        if let Some(owner) = inner.owners.get(conversation_id).cloned() {
            self.expire_if_overdue(&mut inner, &owner);
            if let Some(owner) = inner.owners.get(conversation_id) {
                return Err(CoordinatorError::ConversationBusy {
                    conversation_id: conversation_id.to_string(),
                    task_id: owner.clone(),
                });
            }
        }
        let task_id = uuid::Uuid::now_v7().to_string();
        inner
            .owners
            .insert(conversation_id.to_string(), task_id.clone());
        Ok(task_id)
    }

    /// Undo a [`reserve`](Self::reserve) whose task record was never inserted.
    pub fn release_reservation(&self, conversation_id: &str, task_id: &str) {
        let mut inner = self.lock();
        if inner.owners.get(conversation_id).map(String::as_str) == Some(task_id)
            && !inner.tasks.contains_key(task_id)
        {
            inner.owners.remove(conversation_id);
        }
    }

    pub fn insert(&self, record: TaskRecord) {
        tracing::debug!(task_id = %record.id, conversation_id = %record.conversation_id, "task queued");
        self.lock().tasks.insert(record.id.clone(), record);
    }

    /// Poll payload. Unknown or evicted ids yield `not_found`, never an error.
    pub fn get(&self, task_id: &str) -> TaskView {
        let mut inner = self.lock();
        self.expire_if_overdue(&mut inner, task_id);
        inner
            .tasks
            .get(task_id)
            .map(TaskRecord::view)
            .unwrap_or_else(|| TaskView::not_found(task_id))
    }

    pub fn record(&self, task_id: &str) -> Option<TaskRecord> {
        self.lock().tasks.get(task_id).cloned()
    }

    /// The conversation's non-terminal task, if any.
    pub fn active_for(&self, conversation_id: &str) -> Option<TaskRecord> {
        let mut inner = self.lock();
        let owner = inner.owners.get(conversation_id).cloned()?;
        self.expire_if_overdue(&mut inner, &owner);
        inner
            .tasks
            .get(&owner)
            .filter(|t| !t.status.is_terminal())
            .cloned()
    }

    /// Request cooperative cancellation. Returns `false` for unknown ids.
    /// Terminal tasks are left untouched so their payload stays frozen.
    pub fn cancel(&self, task_id: &str) -> bool {
        let mut inner = self.lock();
        match inner.tasks.get_mut(task_id) {
            Some(task) => {
                if !task.status.is_terminal() && !task.cancel_requested {
                    task.cancel_requested = true;
                    task.updated_at = Utc::now();
                    tracing::info!(task_id, "cancellation requested");
                }
                true
            }
            None => false,
        }
    }

    /// `queued → processing`. Fails if the task is gone or already finalized.
    pub fn start(&self, task_id: &str) -> Result<(), TaskFailure> {
        let mut inner = self.lock();
        let task = inner.tasks.get_mut(task_id).ok_or(TaskFailure::Superseded)?;
        if task.status != TaskStatus::Queued {
            return Err(TaskFailure::Superseded);
        }
        task.status = TaskStatus::Processing;
        task.updated_at = Utc::now();
        Ok(())
    }

    /// Evaluate cancellation and the ceiling, then publish `step`.
    ///
    /// Does not finalize: the caller turns `Cancelled`/`Timeout` into an outcome
    /// via [`finish`](Self::finish). `Superseded` means someone else already did.
    pub fn checkpoint(&self, task_id: &str, step: Step) -> Result<(), TaskFailure> {
        let mut inner = self.lock();
        let task = inner.tasks.get_mut(task_id).ok_or(TaskFailure::Superseded)?;
        if task.status.is_terminal() {
            return Err(TaskFailure::Superseded);
        }
        if task.cancel_requested {
            return Err(TaskFailure::Cancelled);
        }
        if task.started.elapsed() >= self.timeout {
            return Err(TaskFailure::Timeout);
        }
        if step > task.step {
            task.step = step;
            task.updated_at = Utc::now();
            tracing::debug!(task_id, step = step.label(), "task progressed");
        }
        Ok(())
    }

    /// Write the terminal state once and release the conversation.
    /// Returns `false` if the task was already terminal or unknown.
    pub fn finish(&self, task_id: &str, outcome: TaskOutcome) -> bool {
        let mut inner = self.lock();
        Self::finalize(&mut inner, task_id, outcome)
    }

    /// Finalize a worker's outcome if the task is still live.
    ///
    /// A cancel request observed here wins and the task ends `cancelled`; the
    /// returned status tells the caller which outcome was recorded, so it can
    /// commit or roll back whatever it staged for `outcome`. `Superseded` means
    /// the task was already finalized elsewhere (or evicted).
    pub fn finish_live(&self, task_id: &str, outcome: TaskOutcome) -> Result<TaskStatus, TaskFailure> {
        let mut inner = self.lock();
        let task = inner.tasks.get(task_id).ok_or(TaskFailure::Superseded)?;
        if task.status.is_terminal() {
            return Err(TaskFailure::Superseded);
        }
        let outcome = if task.cancel_requested {
            TaskOutcome::Cancelled
        } else {
            outcome
        };
        let status = outcome.status();
        Self::finalize(&mut inner, task_id, outcome);
        Ok(status)
    }

    /// Finalize as `cancelled` immediately. Used by the coordinator before a
    /// retry, edit or truncation so the conversation is free right away; the
    /// worker notices at its next checkpoint and discards its work.
    pub fn force_cancel(&self, task_id: &str) -> bool {
        let mut inner = self.lock();
        if let Some(task) = inner.tasks.get_mut(task_id) {
            task.cancel_requested = true;
        }
        Self::finalize(&mut inner, task_id, TaskOutcome::Cancelled)
    }

    /// Force-timeout stuck tasks and evict terminal ones past the TTL margin.
    pub fn sweep(&self) -> SweepReport {
        let mut inner = self.lock();
        let mut report = SweepReport::default();

        let overdue: Vec<String> = inner
            .tasks
            .values()
            .filter(|t| !t.status.is_terminal() && t.started.elapsed() >= self.timeout)
            .map(|t| t.id.clone())
            .collect();
        for id in overdue {
            if self.expire_if_overdue(&mut inner, &id) {
                report.timed_out += 1;
            }
        }

        let ttl = self.ttl_margin;
        let before = inner.tasks.len();
        inner
            .tasks
            .retain(|_, t| t.finished.map_or(true, |at| at.elapsed() < ttl));
        report.evicted = before - inner.tasks.len();

        if report != SweepReport::default() {
            tracing::debug!(timed_out = report.timed_out, evicted = report.evicted, "task sweep");
        }
        report
    }

    /// Run [`sweep`](Self::sweep) every `interval` until the handle is aborted.
    pub fn spawn_sweeper(self: &Arc<Self>, interval: Duration) -> tokio::task::JoinHandle<()> {
        let store = Arc::clone(self);
        tokio::spawn(async move {
            // `interval` panics on zero.
            let mut ticker = tokio::time::interval(interval.max(Duration::from_millis(1)));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                store.sweep();
            }
        })
    }

    pub fn len(&self) -> usize {
        self.lock().tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn expire_if_overdue(&self, inner: &mut Inner, task_id: &str) -> bool {
        let overdue = inner
            .tasks
            .get(task_id)
            .is_some_and(|t| !t.status.is_terminal() && t.started.elapsed() >= self.timeout);
        if !overdue {
            return false;
        }
        tracing::warn!(task_id, "task exceeded processing ceiling");
        Self::finalize(
            inner,
            task_id,
            TaskOutcome::from_failure(&TaskFailure::Timeout),
        )
    }

    fn finalize(inner: &mut Inner, task_id: &str, outcome: TaskOutcome) -> bool {
        let Some(task) = inner.tasks.get_mut(task_id) else {
            return false;
        };
        if task.status.is_terminal() {
            return false;
        }

        let now = Utc::now();
        task.status = outcome.status();
        task.updated_at = now;
        task.finished_at = Some(now);
        task.finished = Some(Instant::now());
        match outcome {
            TaskOutcome::Complete { assistant_message } => {
                task.result_message_id = Some(assistant_message.id);
                task.assistant_message = Some(assistant_message);
            }
            TaskOutcome::Failed { kind, message } => {
                task.error_kind = Some(kind);
                task.error = Some(message);
            }
            TaskOutcome::Clarification { question } => {
                task.clarification = Some(question);
            }
            TaskOutcome::Cancelled => {}
        }

        let conversation_id = task.conversation_id.clone();
        let status = task.status;
        if inner.owners.get(&conversation_id).map(String::as_str) == Some(task_id) {
            inner.owners.remove(&conversation_id);
        }
        tracing::info!(task_id, conversation_id = %conversation_id, status = %status, "task finished");
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conversation::Role;

    fn user_message(conversation_id: &str, id: i64) -> Message {
        Message {
            id,
            conversation_id: conversation_id.to_string(),
            role: Role::User,
            content: "How many home runs did Judge hit?".into(),
            created_at: Utc::now().to_rfc3339(),
            error: false,
            error_message: None,
            task_id: None,
            feedback: None,
        }
    }

    fn store(timeout_ms: u64) -> TaskStore {
        TaskStore::new(
            Duration::from_millis(timeout_ms),
            Duration::from_millis(timeout_ms * 4),
        )
    }

    fn queued(store: &TaskStore, conversation_id: &str) -> String {
        let id = store.reserve(conversation_id).unwrap();
        store.insert(TaskRecord::queued(id.clone(), user_message(conversation_id, 1), None));
        id
    }

    #[test]
    fn unknown_task_is_not_found() {
        let store = store(1000);
        assert_eq!(store.get("nope").status, TaskStatus::NotFound);
        assert!(!store.cancel("nope"));
    }

    #[test]
    fn second_reservation_is_busy() {
        let store = store(1000);
        let first = queued(&store, "c1");
        match store.reserve("c1") {
            Err(CoordinatorError::ConversationBusy { task_id, .. }) => assert_eq!(task_id, first),
            other => panic!("expected busy, got {other:?}"),
        }
        // other conversations are unaffected
        assert!(store.reserve("c2").is_ok());
    }

    #[test]
    fn terminal_state_is_write_once() {
        let store = store(1000);
        let id = queued(&store, "c1");
        assert!(store.finish(&id, TaskOutcome::Clarification { question: "Which season?".into() }));
        assert!(!store.finish(&id, TaskOutcome::Cancelled));
        assert_eq!(store.get(&id).status, TaskStatus::ClarificationNeeded);
        // clarification releases the conversation
        assert!(store.reserve("c1").is_ok());
    }

    #[test]
    fn cancel_is_observed_at_checkpoint() {
        let store = store(1000);
        let id = queued(&store, "c1");
        store.start(&id).unwrap();
        store.checkpoint(&id, Step::Recalling).unwrap();
        assert!(store.cancel(&id));
        assert!(matches!(store.checkpoint(&id, Step::Planning), Err(TaskFailure::Cancelled)));
        // still processing until the worker finalizes
        assert_eq!(store.get(&id).status, TaskStatus::Processing);
    }

    #[test]
    fn cancel_of_terminal_task_keeps_payload() {
        let store = store(1000);
        let id = queued(&store, "c1");
        store.finish(
            &id,
            TaskOutcome::Failed { kind: ErrorKind::Tool, message: "nope".into() },
        );
        let before = serde_json::to_string(&store.get(&id)).unwrap();
        assert!(store.cancel(&id));
        let after = serde_json::to_string(&store.get(&id)).unwrap();
        assert_eq!(before, after);
    }

    #[test]
    fn step_never_regresses() {
        let store = store(1000);
        let id = queued(&store, "c1");
        store.start(&id).unwrap();
        store.checkpoint(&id, Step::Querying).unwrap();
        store.checkpoint(&id, Step::Planning).unwrap();
        assert_eq!(store.record(&id).unwrap().step, Step::Querying);
    }

    #[test]
    fn finish_live_prefers_pending_cancel() {
        let store = store(1000);
        let id = queued(&store, "c1");
        store.start(&id).unwrap();
        store.cancel(&id);
        let status = store
            .finish_live(&id, TaskOutcome::Clarification { question: "Which season?".into() })
            .unwrap();
        assert_eq!(status, TaskStatus::Cancelled);
        assert!(store.get(&id).clarification.is_none());
    }

    #[test]
    fn finish_live_after_force_cancel_is_superseded() {
        let store = store(1000);
        let id = queued(&store, "c1");
        assert!(store.force_cancel(&id));
        assert!(store.reserve("c1").is_ok());
        assert!(matches!(
            store.finish_live(&id, TaskOutcome::Cancelled),
            Err(TaskFailure::Superseded)
        ));
    }

    #[tokio::test]
    async fn sweeper_survives_zero_interval() {
        let store = Arc::new(store(20));
        let id = queued(&store, "c1");
        let sweeper = store.spawn_sweeper(Duration::ZERO);
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(!sweeper.is_finished());
        assert_eq!(store.record(&id).unwrap().status, TaskStatus::Error);
        sweeper.abort();
    }

    #[test]
    fn overdue_task_reads_as_timeout() {
        let store = store(20);
        let id = queued(&store, "c1");
        std::thread::sleep(Duration::from_millis(40));
        let view = store.get(&id);
        assert_eq!(view.status, TaskStatus::Error);
        assert_eq!(view.error_kind, Some(ErrorKind::Timeout));
        assert!(store.reserve("c1").is_ok());
    }

    #[test]
    fn sweep_times_out_then_evicts() {
        let store = store(20);
        let id = queued(&store, "c1");
        std::thread::sleep(Duration::from_millis(30));
        assert_eq!(store.sweep().timed_out, 1);
        // still pollable inside the TTL margin
        assert_eq!(store.get(&id).status, TaskStatus::Error);

        std::thread::sleep(Duration::from_millis(100));
        assert_eq!(store.sweep().evicted, 1);
        assert_eq!(store.get(&id).status, TaskStatus::NotFound);
    }

    #[test]
    fn released_reservation_frees_conversation() {
        let store = store(1000);
        let id = store.reserve("c1").unwrap();
        store.release_reservation("c1", &id);
        assert!(store.reserve("c1").is_ok());
    }
}
