mod helpers;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use blitz::config::RecallConfig;
use blitz::embedding::hashing::HashingEmbeddingProvider;
use blitz::embedding::EmbeddingProvider;
use blitz::error::RecallBackendError;
use blitz::recall::engine::SemanticRecallEngine;
use blitz::recall::lexical::LexicalBackend;
use blitz::recall::{RecallBackend, RecallHit, RecallQuery, RecallTier};
use chrono::Utc;

/// Backend with a fixed answer.
enum Stub {
    Fails,
    Hangs,
    Scores(f64),
}

struct StubBackend {
    tier: RecallTier,
    behavior: Stub,
}

#[async_trait]
impl RecallBackend for StubBackend {
    fn tier(&self) -> RecallTier {
        self.tier
    }

    async fn search(&self, query: RecallQuery<'_>) -> Result<Vec<RecallHit>, RecallBackendError> {
        match self.behavior {
            Stub::Fails => Err(RecallBackendError::Unavailable("index offline".into())),
            Stub::Hangs => {
                tokio::time::sleep(Duration::from_secs(30)).await;
                Ok(Vec::new())
            }
            Stub::Scores(similarity) => Ok(vec![RecallHit {
                question: format!("stored for {}", query.text),
                query: format!("SELECT {similarity}"),
                similarity,
                stored_at: Utc::now(),
            }]),
        }
    }
}

fn stub(tier: RecallTier, behavior: Stub) -> Arc<dyn RecallBackend> {
    Arc::new(StubBackend { tier, behavior })
}

struct BrokenEmbedder;

impl EmbeddingProvider for BrokenEmbedder {
    fn embed(&self, _text: &str) -> anyhow::Result<Vec<f32>> {
        anyhow::bail!("onnx session poisoned")
    }

    fn model_id(&self) -> &str {
        "broken"
    }
}

/// Returns the direction-less vector a symbol-only question hashes to.
struct ZeroEmbedder;

impl EmbeddingProvider for ZeroEmbedder {
    fn embed(&self, _text: &str) -> anyhow::Result<Vec<f32>> {
        Ok(vec![0.0; 384])
    }

    fn model_id(&self) -> &str {
        "zero"
    }
}

fn hashing() -> Arc<dyn EmbeddingProvider> {
    Arc::new(HashingEmbeddingProvider::new())
}

#[tokio::test]
async fn failing_primary_falls_through_to_document_tier() {
    let config = RecallConfig::default();
    let engine = SemanticRecallEngine::new(hashing(), &config)
        .with_tier(stub(RecallTier::VectorIndex, Stub::Fails), 0.82)
        .with_tier(stub(RecallTier::DocumentStore, Stub::Scores(0.9)), 0.82);

    let found = engine.lookup("home runs by Judge in 2024").await.unwrap();
    assert_eq!(found.source_tier, RecallTier::DocumentStore);
    assert!((found.similarity_score - 0.9).abs() < 1e-9);
    assert_eq!(found.matched_query, "SELECT 0.9");
}

#[tokio::test]
async fn hanging_tier_is_abandoned_after_backend_timeout() {
    let mut config = RecallConfig::default();
    config.backend_timeout_secs = 1;
    let engine = SemanticRecallEngine::new(hashing(), &config)
        .with_tier(stub(RecallTier::VectorIndex, Stub::Hangs), 0.82)
        .with_tier(stub(RecallTier::Lexical, Stub::Scores(0.6)), 0.5);

    let started = std::time::Instant::now();
    let found = engine.lookup("Lakers rebounds").await.unwrap();
    assert_eq!(found.source_tier, RecallTier::Lexical);
    assert!(started.elapsed() < Duration::from_secs(5));
}

#[tokio::test]
async fn below_threshold_everywhere_is_no_match() {
    let config = RecallConfig::default();
    let engine = SemanticRecallEngine::new(hashing(), &config)
        .with_tier(stub(RecallTier::VectorIndex, Stub::Scores(0.81)), 0.82)
        .with_tier(stub(RecallTier::DocumentStore, Stub::Scores(0.5)), 0.82)
        .with_tier(stub(RecallTier::Lexical, Stub::Scores(0.49)), 0.5);

    assert!(engine.lookup("Celtics wins 2008").await.is_none());
}

#[tokio::test]
async fn embedding_failure_leaves_only_lexical_tier() {
    let config = RecallConfig::default();
    let lexical = Arc::new(LexicalBackend::new(16));
    lexical.push("home runs by Judge in 2024", "SELECT hr FROM batting");

    let engine = SemanticRecallEngine::new(Arc::new(BrokenEmbedder), &config)
        .with_tier(stub(RecallTier::VectorIndex, Stub::Scores(0.99)), 0.82)
        .with_tier(lexical, 0.5);

    let found = engine.lookup("Aaron Judge home runs 2024").await.unwrap();
    assert_eq!(found.source_tier, RecallTier::Lexical);
    assert_eq!(found.matched_query, "SELECT hr FROM batting");
    assert!(found.question_embedding.is_none());
}

#[tokio::test]
async fn recorded_pair_is_found_by_standard_chain() {
    let db = helpers::test_db();
    let engine =
        SemanticRecallEngine::from_config(&RecallConfig::default(), db.clone(), hashing()).unwrap();

    assert!(engine.lookup("home runs by Judge in 2024").await.is_none());

    engine
        .record("t1", "home runs by Judge in 2024", "SELECT hr FROM batting WHERE season = 2024")
        .await
        .unwrap();

    let exact = engine.lookup("home runs by Judge in 2024").await.unwrap();
    assert_eq!(exact.source_tier, RecallTier::VectorIndex);
    assert!(exact.similarity_score > 0.99);

    let reordered = engine.lookup("Aaron Judge home runs 2024").await.unwrap();
    assert_eq!(reordered.matched_query, "SELECT hr FROM batting WHERE season = 2024");

    assert!(engine.lookup("Lakers rebounds per game").await.is_none());
}

#[tokio::test]
async fn lexical_corpus_is_seeded_from_storage() {
    let db = helpers::test_db();
    {
        let first =
            SemanticRecallEngine::from_config(&RecallConfig::default(), db.clone(), hashing())
                .unwrap();
        first.record("t1", "Ohtani stolen bases 2024", "SELECT sb").await.unwrap();
    }

    // A restarted engine with a broken embedder can still answer from the seeded corpus.
    let restarted = SemanticRecallEngine::from_config(
        &RecallConfig::default(),
        db,
        Arc::new(BrokenEmbedder),
    )
    .unwrap();
    let found = restarted.lookup("stolen bases Ohtani 2024").await.unwrap();
    assert_eq!(found.source_tier, RecallTier::Lexical);
    assert_eq!(found.matched_query, "SELECT sb");
}

#[tokio::test]
async fn zero_vector_question_skips_embedding_tiers() {
    let engine = SemanticRecallEngine::new(Arc::new(ZeroEmbedder), &RecallConfig::default())
        .with_tier(stub(RecallTier::VectorIndex, Stub::Scores(1.0)), 0.82)
        .with_tier(stub(RecallTier::Lexical, Stub::Scores(0.9)), 0.5);

    let found = engine.lookup("??!").await.unwrap();
    assert_eq!(found.source_tier, RecallTier::Lexical);
    assert_eq!(found.matched_query, "SELECT 0.9");
    assert!(found.question_embedding.is_none());
}
