//! Durable conversation records.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "user" => Ok(Self::User),
            "assistant" => Ok(Self::Assistant),
            _ => Err(format!("unknown role: {s}")),
        }
    }
}

/// A row of the `conversations` table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conversation {
    /// UUID v7.
    pub id: String,
    pub user_id: Option<String>,
    /// First user message, shortened. `None` until the first message lands.
    pub title: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

/// A row of the `messages` table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Ordinal within the conversation, starting at 1, gap-free.
    pub id: i64,
    pub conversation_id: String,
    pub role: Role,
    pub content: String,
    pub created_at: String,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub error: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    /// Task that produced (assistant) or was started by (user) this message.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub feedback: Option<Feedback>,
}

/// A user's verdict on an assistant answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Feedback {
    Helpful,
    Unhelpful,
}

impl Feedback {
    pub fn from_helpful(helpful: bool) -> Self {
        if helpful {
            Self::Helpful
        } else {
            Self::Unhelpful
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Helpful => "helpful",
            Self::Unhelpful => "unhelpful",
        }
    }
}

impl std::str::FromStr for Feedback {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "helpful" => Ok(Self::Helpful),
            "unhelpful" => Ok(Self::Unhelpful),
            _ => Err(format!("unknown feedback: {s}")),
        }
    }
}

/// Fields needed to append a message; the ordinal and timestamp are assigned by the store.
#[derive(Debug, Clone)]
pub struct NewMessage<'a> {
    pub role: Role,
    pub content: &'a str,
    pub error_message: Option<&'a str>,
    pub task_id: Option<&'a str>,
}

impl<'a> NewMessage<'a> {
    pub fn user(content: &'a str) -> Self {
        Self {
            role: Role::User,
            content,
            error_message: None,
            task_id: None,
        }
    }

    pub fn assistant(content: &'a str, task_id: &'a str) -> Self {
        Self {
            role: Role::Assistant,
            content,
            error_message: None,
            task_id: Some(task_id),
        }
    }

    pub fn assistant_error(content: &'a str, error: &'a str, task_id: &'a str) -> Self {
        Self {
            role: Role::Assistant,
            content,
            error_message: Some(error),
            task_id: Some(task_id),
        }
    }

    pub fn with_task(mut self, task_id: &'a str) -> Self {
        self.task_id = Some(task_id);
        self
    }
}

/// Title derived from the first user message.
pub fn derive_title(content: &str) -> String {
    const MAX_TITLE_CHARS: usize = 60;
    let line = content
        .lines()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .unwrap_or("");
    if line.chars().count() <= MAX_TITLE_CHARS {
        line.to_string()
    } else {
        let cut: String = line.chars().take(MAX_TITLE_CHARS - 3).collect();
        format!("{}...", cut.trim_end())
    }
}
