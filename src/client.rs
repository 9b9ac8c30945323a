//! Client side of the HTTP contract, used by `blitz ask`.
//!
//! [`poll_task`] is the only way this crate waits on a task: it stops at a
//! terminal status, at its deadline, or when the caller's cancel future
//! resolves, whichever comes first.

use std::future::Future;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;
use serde_json::json;

use crate::task::{TaskHandle, TaskStatus, TaskView};

#[derive(Debug, Clone, Copy)]
pub struct PollOptions {
    pub interval: Duration,
    /// Total time to wait before giving up.
    pub deadline: Duration,
}

impl Default for PollOptions {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(500),
            deadline: Duration::from_secs(120),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum PollOutcome {
    /// Terminal or `not_found`.
    Finished(TaskView),
    /// Deadline reached; carries the last payload seen, if any.
    DeadlineExceeded(Option<TaskView>),
    /// The cancel future resolved first.
    Cancelled,
}

/// Poll with `fetch` every `options.interval` until the task settles.
pub async fn poll_task<F, Fut, C>(mut fetch: F, options: PollOptions, cancel: C) -> Result<PollOutcome>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<TaskView>>,
    C: Future<Output = ()>,
{
    let deadline = tokio::time::Instant::now() + options.deadline;
    tokio::pin!(cancel);
    let mut last = None;

    loop {
        let view = tokio::select! {
            _ = &mut cancel => return Ok(PollOutcome::Cancelled),
            _ = tokio::time::sleep_until(deadline) => return Ok(PollOutcome::DeadlineExceeded(last)),
            view = fetch() => view?,
        };
        if view.status.is_terminal() || view.status == TaskStatus::NotFound {
            return Ok(PollOutcome::Finished(view));
        }
        tracing::debug!(task_id = %view.task_id, status = %view.status, step = ?view.step, "task pending");
        last = Some(view);

        tokio::select! {
            _ = &mut cancel => return Ok(PollOutcome::Cancelled),
            _ = tokio::time::sleep_until(deadline) => return Ok(PollOutcome::DeadlineExceeded(last)),
            _ = tokio::time::sleep(options.interval) => {}
        }
    }
}

#[derive(Deserialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Deserialize)]
struct ErrorDetail {
    code: String,
    message: String,
}

#[derive(Deserialize)]
struct CancelBody {
    ok: bool,
}

pub struct BlitzClient {
    http: reqwest::Client,
    base_url: String,
}

impl BlitzClient {
    pub fn new(base_url: &str) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .context("failed to build HTTP client")?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    async fn decode<T: serde::de::DeserializeOwned>(response: reqwest::Response) -> Result<T> {
        let status = response.status();
        if status.is_success() {
            return response.json::<T>().await.context("unreadable response body");
        }
        match response.json::<ErrorBody>().await {
            Ok(body) => anyhow::bail!("{} ({status}): {}", body.error.code, body.error.message),
            Err(_) => anyhow::bail!("server returned {status}"),
        }
    }

    pub async fn submit(&self, conversation_id: Option<&str>, content: &str) -> Result<TaskHandle> {
        let url = match conversation_id {
            Some(id) => format!("{}/conversations/{id}/messages", self.base_url),
            None => format!("{}/conversations/messages", self.base_url),
        };
        let response = self
            .http
            .post(&url)
            .json(&json!({ "content": content }))
            .send()
            .await
            .with_context(|| format!("could not reach {url}"))?;
        Self::decode(response).await
    }

    pub async fn get_task(&self, task_id: &str) -> Result<TaskView> {
        let url = format!("{}/tasks/{task_id}", self.base_url);
        let response = self
            .http
            .get(&url)
            .send()
            .await
            .with_context(|| format!("could not reach {url}"))?;
        Self::decode(response).await
    }

    pub async fn cancel(&self, task_id: &str) -> Result<bool> {
        let url = format!("{}/tasks/{task_id}/cancel", self.base_url);
        let response = self
            .http
            .post(&url)
            .send()
            .await
            .with_context(|| format!("could not reach {url}"))?;
        let body: CancelBody = Self::decode(response).await?;
        Ok(body.ok)
    }
}
