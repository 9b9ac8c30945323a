//! Asynchronous answering of conversation messages.
//!
//! A submit returns a [`types::TaskHandle`] at once; the answer is produced by a
//! [`worker::Worker`] in the background and observed by polling the
//! [`store::TaskStore`]:
//!
//! ```text
//! queued → processing → complete | error | clarification_needed
//!                     ↘ cancelled            (cancel seen at a checkpoint)
//! queued | processing → error(timeout)      (processing ceiling elapsed)
//! ```
//!
//! Terminal states are written once. A conversation owns at most one
//! non-terminal task; `clarification_needed` releases it like any terminal state.

pub mod coordinator;
pub mod store;
pub mod types;
pub mod worker;

pub use coordinator::ConversationCoordinator;
pub use store::{TaskOutcome, TaskStore};
pub use types::{FeedbackReceipt, Step, TaskHandle, TaskStatus, TaskView};
pub use worker::{Worker, WorkerSettings};
