//! reqwest bindings for the assistant and the data service.
//!
//! Wire contract:
//!
//! - `POST {assistant_url}/plan` with a [`PlanRequest`], answers with a [`Plan`].
//! - `POST {assistant_url}/compose` with a [`ComposeRequest`], answers `{"answer": "..."}`.
//! - `POST {tools_url}` with `{"tool": ..., "args": ...}`, answers with the tool result.

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};

use super::{Assistant, ComposeRequest, Plan, PlanRequest, ToolInvoker};
use crate::error::ToolInvocationError;

fn client(timeout: Duration) -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(timeout)
        .user_agent(concat!("blitz/", env!("CARGO_PKG_VERSION")))
        .build()
        .context("failed to build HTTP client")
}

pub struct HttpAssistant {
    http: reqwest::Client,
    base_url: String,
}

#[derive(Deserialize)]
struct ComposeResponse {
    answer: String,
}

impl HttpAssistant {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        Ok(Self {
            http: client(timeout)?,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    async fn post<B: serde::Serialize + Sync, T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T> {
        let url = format!("{}/{path}", self.base_url);
        let response = self
            .http
            .post(&url)
            .json(body)
            .send()
            .await
            .with_context(|| format!("assistant request to {url} failed"))?
            .error_for_status()
            .with_context(|| format!("assistant at {url} returned an error"))?;
        response
            .json::<T>()
            .await
            .with_context(|| format!("assistant at {url} returned an unreadable body"))
    }
}

#[async_trait]
impl Assistant for HttpAssistant {
    async fn plan(&self, request: PlanRequest<'_>) -> Result<Plan> {
        self.post("plan", &request).await
    }

    async fn compose(&self, request: ComposeRequest<'_>) -> Result<String> {
        let response: ComposeResponse = self.post("compose", &request).await?;
        Ok(response.answer)
    }
}

pub struct HttpToolInvoker {
    http: reqwest::Client,
    url: String,
}

impl HttpToolInvoker {
    pub fn new(url: &str, timeout: Duration) -> Result<Self> {
        Ok(Self {
            http: client(timeout)?,
            url: url.to_string(),
        })
    }
}

fn classify_send_error(err: reqwest::Error) -> ToolInvocationError {
    if err.is_timeout() {
        ToolInvocationError::Timeout
    } else {
        ToolInvocationError::Transport(err.to_string())
    }
}

#[async_trait]
impl ToolInvoker for HttpToolInvoker {
    async fn invoke(&self, tool: &str, args: Value) -> Result<Value, ToolInvocationError> {
        let response = self
            .http
            .post(&self.url)
            .json(&json!({ "tool": tool, "args": args }))
            .send()
            .await
            .map_err(classify_send_error)?;

        let status = response.status();
        if status.is_server_error() {
            return Err(ToolInvocationError::Server { status: status.as_u16() });
        }
        if status.is_client_error() {
            let body = response.text().await.unwrap_or_default();
            return Err(ToolInvocationError::Rejected(body.chars().take(500).collect()));
        }

        response.json::<Value>().await.map_err(classify_send_error)
    }
}
