//! Conversation task engine for a SQL sports-analytics assistant.
//!
//! A user message is accepted immediately and answered in the background; the
//! caller polls a task until it settles. Each conversation runs at most one task
//! at a time, tasks can be cancelled cooperatively, and a processing ceiling
//! turns stuck work into a visible timeout.
//!
//! Before planning an answer, the worker looks for a previously answered
//! question that means the same thing:
//!
//! | Tier | Backend | Default threshold |
//! |------|---------|-------------------|
//! | 1 | sqlite-vec KNN over question embeddings | 0.82 |
//! | 2 | FTS5 BM25 candidates reranked by cosine | 0.82 |
//! | 3 | In-memory token/trigram overlap | 0.5 |
//!
//! # Architecture
//!
//! - **Storage**: SQLite (WAL) for conversations, messages and recall entries,
//!   with FTS5 and [sqlite-vec](https://github.com/asg017/sqlite-vec); tasks live in memory
//! - **Embeddings**: Local ONNX Runtime with all-MiniLM-L6-v2 (384 dimensions)
//! - **Transport**: HTTP (axum) and MCP over stdio
//!
//! # Modules
//!
//! - [`config`]: Configuration loading from TOML files and environment variables
//! - [`db`]: SQLite initialization, schema, migrations, and health checks
//! - [`embedding`]: Text-to-vector embedding pipeline
//! - [`conversation`]: Durable conversations and gap-free message ordinals
//! - [`task`]: Task store, worker pipeline and the conversation coordinator
//! - [`recall`]: Tiered semantic recall of answered questions
//! - [`agent`]: Assistant and tool boundaries
//! - [`api`]: HTTP routes
//! - [`client`]: HTTP client and the bounded polling primitive

pub mod agent;
pub mod api;
pub mod cli;
pub mod client;
pub mod config;
pub mod conversation;
pub mod db;
pub mod embedding;
pub mod error;
pub mod recall;
pub mod server;
pub mod task;
pub mod tools;
