//! Tiered semantic recall of previously answered questions.
//!
//! A question is matched against past `(question, query)` pairs by a chain of
//! [`RecallBackend`]s tried in priority order by the [`engine::SemanticRecallEngine`]:
//!
//! | Tier | Backend | Similarity | Default threshold |
//! |------|---------|------------|-------------------|
//! | 1 | [`vector::VectorIndexBackend`] | cosine via sqlite-vec KNN | 0.82 |
//! | 2 | [`document::DocumentStoreBackend`] | FTS5 BM25 candidates, cosine rerank | 0.82 |
//! | 3 | [`lexical::LexicalBackend`] | token + trigram overlap, in memory | 0.5 |
//!
//! A backend error never escapes the chain; it only moves the search to the next tier.

pub mod document;
pub mod engine;
pub mod entries;
pub mod lexical;
pub mod vector;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::error::RecallBackendError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RecallTier {
    VectorIndex,
    DocumentStore,
    Lexical,
}

impl RecallTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::VectorIndex => "vector_index",
            Self::DocumentStore => "document_store",
            Self::Lexical => "lexical",
        }
    }

    /// Whether the tier compares embeddings (and so needs one to run).
    pub fn needs_embedding(&self) -> bool {
        !matches!(self, Self::Lexical)
    }
}

impl std::fmt::Display for RecallTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a backend searches with.
#[derive(Debug, Clone, Copy)]
pub struct RecallQuery<'a> {
    pub text: &'a str,
    /// `None` when the embedding provider failed; embedding tiers then bow out.
    pub embedding: Option<&'a [f32]>,
    /// Model the embedding came from. Entries of other models are skipped.
    pub model_id: &'a str,
    pub top_k: usize,
}

/// One scored historical pair as produced by a backend.
#[derive(Debug, Clone, PartialEq)]
pub struct RecallHit {
    pub question: String,
    pub query: String,
    pub similarity: f64,
    /// When the pair was recorded; newer wins ties.
    pub stored_at: DateTime<Utc>,
}

/// The accepted match returned by the engine. Transient, never persisted.
#[derive(Debug, Clone, Serialize)]
pub struct RecallCandidate {
    #[serde(skip)]
    pub question_embedding: Option<Vec<f32>>,
    pub matched_question: String,
    pub matched_query: String,
    pub similarity_score: f64,
    pub source_tier: RecallTier,
    pub stored_at: DateTime<Utc>,
    pub retrieved_at: DateTime<Utc>,
}

/// Uniform capability: "find past questions similar to this one".
#[async_trait]
pub trait RecallBackend: Send + Sync {
    fn tier(&self) -> RecallTier;

    /// Up to `query.top_k` hits, any order. Errors are logged by the engine.
    async fn search(&self, query: RecallQuery<'_>) -> Result<Vec<RecallHit>, RecallBackendError>;
}

/// Parse an RFC 3339 timestamp as stored by [`entries`]; unparsable values sort oldest.
pub(crate) fn parse_stored_at(value: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}
