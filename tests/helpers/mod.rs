#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use blitz::agent::{Assistant, ComposeRequest, Plan, PlanRequest, ToolInvoker};
use blitz::client::{poll_task, PollOptions, PollOutcome};
use blitz::config::BlitzConfig;
use blitz::db::{self, SharedDb};
use blitz::embedding::hashing::HashingEmbeddingProvider;
use blitz::error::ToolInvocationError;
use blitz::server::Services;
use blitz::task::TaskView;
use serde_json::{json, Value};

/// Open a fresh in-memory database with schema and migrations applied.
pub fn test_db() -> SharedDb {
    db::shared(db::open_memory_database().unwrap())
}

/// Generate a deterministic 384-dim embedding with a spike at position `seed`.
pub fn test_embedding(seed: u8) -> Vec<f32> {
    let mut v = vec![0.0f32; 384];
    v[seed as usize % 384] = 1.0;
    v
}

/// Config tuned for tests: recall on, short ceilings, no network.
pub fn test_config() -> BlitzConfig {
    let mut config = BlitzConfig::default();
    config.embedding.provider = "hashing".into();
    config.tasks.timeout_secs = 5;
    config.tasks.ttl_margin_secs = 60;
    config.tasks.call_timeout_secs = 2;
    config
}

/// Assistant that plans a SQL query for every question (or whatever was
/// scripted) and echoes the tool result back as the answer.
#[derive(Default)]
pub struct ScriptedAssistant {
    plans: Mutex<VecDeque<Plan>>,
    pub plan_delay: Option<Duration>,
    pub compose_delay: Option<Duration>,
    pub fail_compose: bool,
    pub seen_recall: Mutex<Vec<Option<String>>>,
    pub seen_history: Mutex<Vec<usize>>,
}

impl ScriptedAssistant {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn then(self, plan: Plan) -> Self {
        self.plans.lock().unwrap().push_back(plan);
        self
    }

    pub fn slow_plan(mut self, delay: Duration) -> Self {
        self.plan_delay = Some(delay);
        self
    }

    pub fn slow_compose(mut self, delay: Duration) -> Self {
        self.compose_delay = Some(delay);
        self
    }
}

#[async_trait]
impl Assistant for ScriptedAssistant {
    async fn plan(&self, request: PlanRequest<'_>) -> anyhow::Result<Plan> {
        self.seen_recall
            .lock()
            .unwrap()
            .push(request.recall.map(|hint| hint.query.clone()));
        self.seen_history.lock().unwrap().push(request.history.len());
        if let Some(delay) = self.plan_delay {
            tokio::time::sleep(delay).await;
        }
        let scripted = self.plans.lock().unwrap().pop_front();
        Ok(scripted.unwrap_or_else(|| Plan::Query {
            tool: "query".into(),
            args: json!({ "query": format!("SELECT answer FROM facts -- {}", request.question) }),
        }))
    }

    async fn compose(&self, request: ComposeRequest<'_>) -> anyhow::Result<String> {
        if let Some(delay) = self.compose_delay {
            tokio::time::sleep(delay).await;
        }
        if self.fail_compose {
            anyhow::bail!("model overloaded");
        }
        Ok(format!("Answer to '{}': {}", request.question, request.result))
    }
}

/// Tool invoker that fails the first `failures.len()` calls with the given
/// errors, then returns `{"rows": [[42]]}`.
#[derive(Default)]
pub struct ScriptedTools {
    failures: Mutex<VecDeque<ToolInvocationError>>,
    pub calls: AtomicUsize,
    pub delay: Option<Duration>,
}

impl ScriptedTools {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing(errors: Vec<ToolInvocationError>) -> Self {
        Self {
            failures: Mutex::new(errors.into()),
            ..Self::default()
        }
    }

    pub fn slow(delay: Duration) -> Self {
        Self {
            delay: Some(delay),
            ..Self::default()
        }
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ToolInvoker for ScriptedTools {
    async fn invoke(&self, _tool: &str, _args: Value) -> Result<Value, ToolInvocationError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(err) = self.failures.lock().unwrap().pop_front() {
            return Err(err);
        }
        Ok(json!({ "rows": [[42]] }))
    }
}

pub fn services(
    config: &BlitzConfig,
    assistant: Arc<ScriptedAssistant>,
    tools: Arc<ScriptedTools>,
) -> Services {
    Services::assemble(
        config,
        test_db(),
        Arc::new(HashingEmbeddingProvider::new()),
        assistant,
        tools,
    )
    .unwrap()
}

/// Poll in-process until the task settles; panics after `secs`.
pub async fn settle(services: &Services, task_id: &str, secs: u64) -> TaskView {
    let coordinator = Arc::clone(&services.coordinator);
    let outcome = poll_task(
        || {
            let view = coordinator.get(task_id);
            async move { Ok(view) }
        },
        PollOptions {
            interval: Duration::from_millis(10),
            deadline: Duration::from_secs(secs),
        },
        std::future::pending(),
    )
    .await
    .unwrap();
    match outcome {
        PollOutcome::Finished(view) => view,
        other => panic!("task {task_id} did not settle: {other:?}"),
    }
}

/// Wait until the task has moved past `queued`/the given step label.
pub async fn wait_for_step(services: &Services, task_id: &str, label: &str) {
    for _ in 0..500 {
        if services.coordinator.get(task_id).step.as_deref() == Some(label) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("task {task_id} never reached step {label}");
}

/// Wait until `count` pairs are stored for recall. Recording runs just after
/// a task completes, so a settled task may not have been learned yet.
pub async fn wait_for_recorded(services: &Services, count: usize) {
    for _ in 0..200 {
        let stored: i64 = {
            let conn = db::lock(&services.db).unwrap();
            conn.query_row("SELECT COUNT(*) FROM recall_links", [], |row| row.get(0))
                .unwrap()
        };
        if stored as usize >= count {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("expected {count} recorded recall pairs");
}
