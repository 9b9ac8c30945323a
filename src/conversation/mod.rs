//! Conversations and their ordered messages, the durable half of the engine.

pub mod store;
pub mod types;

pub use types::{Conversation, Feedback, Message, NewMessage, Role};
