//! Orchestrates the recall chain: thresholds, tie-breaks, failure isolation.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::Utc;

use super::document::DocumentStoreBackend;
use super::entries;
use super::lexical::LexicalBackend;
use super::vector::VectorIndexBackend;
use super::{RecallBackend, RecallCandidate, RecallHit, RecallQuery};
use crate::config::RecallConfig;
use crate::db::{self, SharedDb};
use crate::embedding::{has_direction, EmbeddingProvider};
use crate::error::RecallBackendError;

struct Tier {
    backend: Arc<dyn RecallBackend>,
    threshold: f64,
}

/// Where answered questions are written back to.
struct Recorder {
    db: SharedDb,
    lexical: Option<Arc<LexicalBackend>>,
}

pub struct SemanticRecallEngine {
    embedder: Arc<dyn EmbeddingProvider>,
    tiers: Vec<Tier>,
    recorder: Option<Recorder>,
    top_k: usize,
    tie_epsilon: f64,
    backend_timeout: Duration,
}

/// Highest similarity wins; scores within `epsilon` of each other go to the
/// most recently stored hit.
pub fn select_best(hits: Vec<RecallHit>, epsilon: f64) -> Option<RecallHit> {
    hits.into_iter().fold(None, |best, hit| match best {
        None => Some(hit),
        Some(current) => {
            let delta = hit.similarity - current.similarity;
            if delta > epsilon || (delta.abs() <= epsilon && hit.stored_at > current.stored_at) {
                Some(hit)
            } else {
                Some(current)
            }
        }
    })
}

impl SemanticRecallEngine {
    /// An engine with no tiers; add them in priority order with [`with_tier`](Self::with_tier).
    pub fn new(embedder: Arc<dyn EmbeddingProvider>, config: &RecallConfig) -> Self {
        Self {
            embedder,
            tiers: Vec::new(),
            recorder: None,
            top_k: config.top_k,
            tie_epsilon: config.tie_epsilon,
            backend_timeout: config.backend_timeout(),
        }
    }

    pub fn with_tier(mut self, backend: Arc<dyn RecallBackend>, threshold: f64) -> Self {
        self.tiers.push(Tier { backend, threshold });
        self
    }

    pub fn with_recorder(mut self, db: SharedDb, lexical: Option<Arc<LexicalBackend>>) -> Self {
        self.recorder = Some(Recorder { db, lexical });
        self
    }

    /// The standard chain: vector index → document store → lexical fallback,
    /// with the lexical corpus seeded from the most recent stored entries.
    pub fn from_config(
        config: &RecallConfig,
        db: SharedDb,
        embedder: Arc<dyn EmbeddingProvider>,
    ) -> Result<Self> {
        let seed = {
            let conn = db::lock(&db)?;
            entries::list_recent(&conn, config.lexical_corpus_size)?
        };
        tracing::info!(entries = seed.len(), "lexical recall corpus loaded");
        let lexical = Arc::new(LexicalBackend::from_entries(seed, config.lexical_corpus_size));

        Ok(Self::new(embedder, config)
            .with_tier(
                Arc::new(VectorIndexBackend::new(SharedDb::clone(&db))),
                config.primary_threshold,
            )
            .with_tier(
                Arc::new(DocumentStoreBackend::new(SharedDb::clone(&db))),
                config.primary_threshold,
            )
            .with_tier(lexical.clone(), config.lexical_threshold)
            .with_recorder(db, Some(lexical)))
    }

    async fn embed(&self, text: &str) -> Option<Vec<f32>> {
        let embedder = Arc::clone(&self.embedder);
        let text = text.to_string();
        match tokio::task::spawn_blocking(move || embedder.embed(&text)).await {
            Ok(Ok(embedding)) if !has_direction(&embedding) => {
                tracing::warn!("question embedding has zero norm; embedding tiers skipped");
                None
            }
            Ok(Ok(embedding)) => Some(embedding),
            Ok(Err(e)) => {
                tracing::warn!(error = %e, "question embedding failed; embedding tiers skipped");
                None
            }
            Err(e) => {
                tracing::warn!(error = %e, "embedding task failed; embedding tiers skipped");
                None
            }
        }
    }

    /// Best historical match for `question`, or `None`. Never fails.
    pub async fn lookup(&self, question: &str) -> Option<RecallCandidate> {
        let embedding = self.embed(question).await;

        for tier in &self.tiers {
            let name = tier.backend.tier();
            if name.needs_embedding() && embedding.is_none() {
                tracing::debug!(tier = %name, "skipping tier without embedding");
                continue;
            }

            let query = RecallQuery {
                text: question,
                embedding: embedding.as_deref(),
                model_id: self.embedder.model_id(),
                top_k: self.top_k,
            };
            let searched = tokio::time::timeout(self.backend_timeout, tier.backend.search(query))
                .await
                .unwrap_or(Err(RecallBackendError::Timeout));
            let hits = match searched {
                Ok(hits) => hits,
                Err(e) => {
                    tracing::warn!(tier = %name, error = %e, "recall tier failed, falling through");
                    continue;
                }
            };

            match select_best(hits, self.tie_epsilon) {
                Some(best) if best.similarity >= tier.threshold => {
                    tracing::info!(
                        tier = %name,
                        similarity = best.similarity,
                        matched = %best.question,
                        "recall hit"
                    );
                    return Some(RecallCandidate {
                        question_embedding: embedding,
                        matched_question: best.question,
                        matched_query: best.query,
                        similarity_score: best.similarity,
                        source_tier: name,
                        stored_at: best.stored_at,
                        retrieved_at: Utc::now(),
                    });
                }
                Some(best) => {
                    tracing::debug!(
                        tier = %name,
                        similarity = best.similarity,
                        threshold = tier.threshold,
                        "best hit below threshold"
                    );
                }
                None => tracing::debug!(tier = %name, "no hits"),
            }
        }

        None
    }

    /// Remember that `question` was answered with `query` by `task_id`.
    pub async fn record(&self, task_id: &str, question: &str, query: &str) -> Result<()> {
        let Some(recorder) = &self.recorder else {
            return Ok(());
        };

        let embedder = Arc::clone(&self.embedder);
        let db = SharedDb::clone(&recorder.db);
        let (task, q, sql) = (task_id.to_string(), question.to_string(), query.to_string());
        let recorded = tokio::task::spawn_blocking(move || -> Result<Option<(bool, bool)>> {
            let embedding = embedder.embed(&q)?;
            if !has_direction(&embedding) {
                return Ok(None);
            }
            let mut conn = db::lock(&db)?;
            let result = entries::record_entry(&mut conn, &q, &sql, embedder.model_id(), &embedding)?;
            let rejected = entries::link_task(&conn, &task, &result.id)?;
            Ok(Some((result.duplicate, rejected)))
        })
        .await??;

        match recorded {
            None => tracing::debug!(task_id, "question has no embeddable content; not recorded"),
            Some((false, false)) => {
                if let Some(lexical) = &recorder.lexical {
                    lexical.push(question, query);
                }
            }
            Some(_) => {}
        }
        Ok(())
    }

    /// Apply a user's verdict on the answer produced by `task_id`. An unhelpful
    /// answer's pair leaves every tier; a helpful one is restored. Returns
    /// whether a stored pair was affected.
    pub async fn apply_feedback(&self, task_id: &str, helpful: bool) -> Result<bool> {
        let Some(recorder) = &self.recorder else {
            return Ok(false);
        };

        let db = SharedDb::clone(&recorder.db);
        let task = task_id.to_string();
        let entry = tokio::task::spawn_blocking(move || {
            let conn = db::lock(&db)?;
            entries::set_unhelpful_for_task(&conn, &task, !helpful)
        })
        .await??;

        let Some(entry) = entry else {
            return Ok(false);
        };
        if let Some(lexical) = &recorder.lexical {
            if helpful {
                lexical.restore(&entry);
            } else {
                lexical.remove(&entry.question, &entry.query);
            }
        }
        tracing::info!(task_id, entry_id = %entry.id, helpful, "recall feedback applied");
        Ok(true)
    }

    /// Forget pairs stored more than `max_age` ago. Returns how many went.
    pub async fn prune(&self, max_age: chrono::Duration) -> Result<usize> {
        let Some(recorder) = &self.recorder else {
            return Ok(0);
        };

        let cutoff = Utc::now() - max_age;
        let db = SharedDb::clone(&recorder.db);
        let removed = tokio::task::spawn_blocking(move || {
            let mut conn = db::lock(&db)?;
            entries::prune_older_than(&mut conn, cutoff)
        })
        .await??;

        if let Some(lexical) = &recorder.lexical {
            for entry in &removed {
                lexical.remove(&entry.question, &entry.query);
            }
            lexical.retain_newer(cutoff);
        }
        if !removed.is_empty() {
            tracing::info!(removed = removed.len(), "pruned old recall entries");
        }
        Ok(removed.len())
    }

    /// Prune every `interval` until aborted.
    pub fn spawn_pruner(
        self: &Arc<Self>,
        max_age: chrono::Duration,
        interval: Duration,
    ) -> tokio::task::JoinHandle<()> {
        let engine = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval.max(Duration::from_millis(1)));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if let Err(e) = engine.prune(max_age).await {
                    tracing::warn!(error = %e, "recall pruning failed");
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conversation::{store, NewMessage};
    use crate::embedding::hashing::HashingEmbeddingProvider;
    use chrono::{DateTime, Duration as ChronoDuration};

    fn hit(query: &str, similarity: f64, stored_at: DateTime<Utc>) -> RecallHit {
        RecallHit {
            question: query.to_string(),
            query: query.to_string(),
            similarity,
            stored_at,
        }
    }

    #[test]
    fn highest_similarity_wins() {
        let now = Utc::now();
        let best = select_best(vec![hit("a", 0.7, now), hit("b", 0.9, now)], 1e-4).unwrap();
        assert_eq!(best.query, "b");
    }

    #[test]
    fn near_tie_prefers_most_recent() {
        let old = Utc::now() - ChronoDuration::days(3);
        let new = Utc::now();
        let best = select_best(
            vec![hit("old", 0.90004, old), hit("new", 0.9, new)],
            1e-4,
        )
        .unwrap();
        assert_eq!(best.query, "new");

        // outside epsilon the score decides
        let best = select_best(vec![hit("old", 0.91, old), hit("new", 0.9, new)], 1e-4).unwrap();
        assert_eq!(best.query, "old");
    }

    #[test]
    fn empty_hits_select_nothing() {
        assert!(select_best(Vec::new(), 1e-4).is_none());
    }

    fn engine() -> (SemanticRecallEngine, SharedDb) {
        let db = db::shared(db::open_memory_database().unwrap());
        let embedder: Arc<dyn EmbeddingProvider> = Arc::new(HashingEmbeddingProvider::new());
        let engine =
            SemanticRecallEngine::from_config(&RecallConfig::default(), SharedDb::clone(&db), embedder)
                .unwrap();
        (engine, db)
    }

    fn answered(db: &SharedDb, task_id: &str) {
        let mut conn = db::lock(db).unwrap();
        let (conv, _) = store::ensure_conversation(&conn, None, None).unwrap();
        store::append_message(&mut conn, &conv.id, NewMessage::user("q")).unwrap();
        store::append_message(&mut conn, &conv.id, NewMessage::assistant("58", task_id)).unwrap();
    }

    #[tokio::test]
    async fn symbol_only_question_is_not_a_vector_hit() {
        let (engine, db) = engine();
        // Recorded directly so a zero vector sits in the index.
        {
            let mut conn = db::lock(&db).unwrap();
            let zero = vec![0.0f32; crate::embedding::EMBEDDING_DIM];
            let model = HashingEmbeddingProvider::new().model_id().to_string();
            entries::record_entry(&mut conn, "?!", "SELECT 1", &model, &zero).unwrap();
        }
        assert!(engine.embed("??!").await.is_none());
        assert!(engine.lookup("??!").await.is_none());
    }

    #[tokio::test]
    async fn zero_norm_question_is_not_recorded() {
        let (engine, db) = engine();
        engine.record("t1", "??!", "SELECT 1").await.unwrap();
        assert!(entries::list_recent(&db::lock(&db).unwrap(), 10).unwrap().is_empty());
    }

    #[tokio::test]
    async fn unhelpful_answer_leaves_every_tier() {
        let (engine, db) = engine();
        let question = "How many home runs did Aaron Judge hit in 2024?";
        answered(&db, "t1");
        engine.record("t1", question, "SELECT 58").await.unwrap();
        assert!(engine.lookup(question).await.is_some());

        assert!(engine.apply_feedback("t1", false).await.unwrap());
        assert!(engine.lookup(question).await.is_none());

        assert!(engine.apply_feedback("t1", true).await.unwrap());
        let again = engine.lookup(question).await.unwrap();
        assert_eq!(again.matched_query, "SELECT 58");
        assert!(!engine.apply_feedback("unknown", false).await.unwrap());
    }

    #[tokio::test]
    async fn prune_forgets_old_pairs() {
        let (engine, db) = engine();
        let question = "How many home runs did Aaron Judge hit in 2024?";
        engine.record("t1", question, "SELECT 58").await.unwrap();
        db::lock(&db)
            .unwrap()
            .execute("UPDATE recall_entries SET created_at = '2020-01-01T00:00:00+00:00'", [])
            .unwrap();

        assert_eq!(engine.prune(ChronoDuration::days(90)).await.unwrap(), 1);
        assert!(engine.lookup(question).await.is_none());
    }
}
