//! Process wiring for the HTTP and MCP (stdio) transports.
//!
//! Both transports share one [`Services`] bundle: database, task store,
//! recall engine, worker and coordinator. The task sweeper and recall pruner
//! are owned here and aborted when the transport stops.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use rmcp::ServiceExt;
use tokio::task::JoinHandle;

use crate::agent::http::{HttpAssistant, HttpToolInvoker};
use crate::agent::{Assistant, ToolInvoker};
use crate::api::{self, ApiState};
use crate::config::BlitzConfig;
use crate::db::{self, SharedDb};
use crate::embedding::{self, EmbeddingProvider};
use crate::recall::engine::SemanticRecallEngine;
use crate::task::{ConversationCoordinator, TaskStore, Worker, WorkerSettings};
use crate::tools::BlitzTools;

pub struct Services {
    pub db: SharedDb,
    pub tasks: Arc<TaskStore>,
    pub recall: Option<Arc<SemanticRecallEngine>>,
    pub coordinator: Arc<ConversationCoordinator>,
}

impl Services {
    /// Assemble everything around already-constructed collaborators.
    pub fn assemble(
        config: &BlitzConfig,
        db: SharedDb,
        embedder: Arc<dyn EmbeddingProvider>,
        assistant: Arc<dyn Assistant>,
        tools: Arc<dyn ToolInvoker>,
    ) -> Result<Self> {
        let recall = if config.recall.enabled {
            let engine =
                SemanticRecallEngine::from_config(&config.recall, SharedDb::clone(&db), embedder)?;
            Some(Arc::new(engine))
        } else {
            tracing::info!("semantic recall disabled");
            None
        };

        let tasks = Arc::new(TaskStore::new(
            config.tasks.timeout(),
            config.tasks.ttl_margin(),
        ));
        let worker = Arc::new(Worker::new(
            Arc::clone(&tasks),
            SharedDb::clone(&db),
            recall.clone(),
            assistant,
            tools,
            WorkerSettings::new(&config.tasks, &config.agent),
        ));
        let coordinator = Arc::new(ConversationCoordinator::new(
            SharedDb::clone(&db),
            Arc::clone(&tasks),
            worker,
            recall.clone(),
            config.tasks.max_content_chars,
        ));

        Ok(Self { db, tasks, recall, coordinator })
    }

    /// Start the task sweeper and, if retention is on, the recall pruner.
    /// The caller aborts the handles on shutdown.
    pub fn spawn_maintenance(&self, config: &BlitzConfig) -> Vec<JoinHandle<()>> {
        let mut handles = vec![self
            .tasks
            .spawn_sweeper(Duration::from_secs(config.tasks.sweep_interval_secs))];
        match (&self.recall, config.recall.max_entry_age()) {
            (Some(engine), Some(max_age)) => handles.push(engine.spawn_pruner(
                max_age,
                Duration::from_secs(config.recall.prune_interval_secs),
            )),
            (Some(_), None) => tracing::info!("recall retention disabled"),
            (None, _) => {}
        }
        handles
    }

    /// Open the configured database and connect the HTTP-backed collaborators.
    pub fn from_config(config: &BlitzConfig) -> Result<Self> {
        let db_path = config.resolved_db_path();
        let conn = db::open_database(&db_path)?;
        tracing::info!(db = %db_path.display(), "database ready");

        let embedder: Arc<dyn EmbeddingProvider> = Arc::from(
            embedding::create_provider(&config.embedding).context(
                "embedding provider unavailable; run `blitz model download` or set embedding.provider = \"hashing\"",
            )?,
        );

        if let Ok(Some(stored)) = db::migrations::get_embedding_model(&conn) {
            if stored != embedder.model_id() {
                tracing::warn!(
                    stored = %stored,
                    configured = %embedder.model_id(),
                    "embedding model changed; entries recorded with the old model are ignored by recall"
                );
            }
        }
        tracing::info!(model = %embedder.model_id(), "embedding provider ready");

        let call_timeout = config.tasks.call_timeout();
        let assistant_url = config
            .agent
            .assistant_url
            .as_deref()
            .context("agent.assistant_url is not configured (or set BLITZ_ASSISTANT_URL)")?;
        let tools_url = config
            .agent
            .tools_url
            .as_deref()
            .context("agent.tools_url is not configured (or set BLITZ_TOOLS_URL)")?;
        let assistant: Arc<dyn Assistant> = Arc::new(HttpAssistant::new(assistant_url, call_timeout)?);
        let tools: Arc<dyn ToolInvoker> = Arc::new(HttpToolInvoker::new(tools_url, call_timeout)?);

        Self::assemble(config, db::shared(conn), embedder, assistant, tools)
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!(error = %e, "failed to listen for ctrl-c");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutting down");
}

/// Serve the HTTP API until ctrl-c.
pub async fn serve_http(config: BlitzConfig) -> Result<()> {
    let bind_addr = format!("{}:{}", config.server.host, config.server.port);
    let services = Services::from_config(&config)?;
    let maintenance = services.spawn_maintenance(&config);

    let router = api::router(ApiState {
        coordinator: Arc::clone(&services.coordinator),
    });
    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("failed to bind {bind_addr}"))?;
    tracing::info!(addr = %bind_addr, "Blitz listening at http://{bind_addr}");

    let served = axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await;
    maintenance.iter().for_each(JoinHandle::abort);
    served?;
    Ok(())
}

/// Serve the MCP tools over stdio until the client disconnects.
pub async fn serve_mcp_stdio(config: BlitzConfig) -> Result<()> {
    tracing::info!("starting Blitz MCP server on stdio");

    let services = Services::from_config(&config)?;
    let maintenance = services.spawn_maintenance(&config);

    let tools = BlitzTools::new(Arc::clone(&services.coordinator));
    let server = tools.serve(rmcp::transport::stdio()).await?;
    tracing::info!("MCP server running, waiting for client");

    let result = server.waiting().await;
    maintenance.iter().for_each(JoinHandle::abort);
    result?;
    tracing::info!("MCP server shut down");
    Ok(())
}
