//! Tier 1: nearest neighbours from the sqlite-vec index.

use async_trait::async_trait;
use rusqlite::params;

use super::{parse_stored_at, RecallBackend, RecallHit, RecallQuery, RecallTier};
use crate::db::{self, embedding_to_bytes, SharedDb};
use crate::error::RecallBackendError;

/// Over-fetch factor so filtering out other models still leaves `top_k` hits.
const MODEL_FILTER_HEADROOM: usize = 4;

pub struct VectorIndexBackend {
    db: SharedDb,
}

impl VectorIndexBackend {
    pub fn new(db: SharedDb) -> Self {
        Self { db }
    }
}

/// vec0 reports L2 distance; for unit vectors cosine = 1 - d²/2.
pub fn l2_distance_to_cosine(distance: f64) -> f64 {
    1.0 - (distance * distance) / 2.0
}

fn knn(
    conn: &rusqlite::Connection,
    embedding: &[f32],
    model_id: &str,
    top_k: usize,
) -> anyhow::Result<Vec<RecallHit>> {
    let mut stmt = conn.prepare(
        "SELECT e.question, e.query, e.created_at, knn.distance \
         FROM (SELECT id, distance FROM recall_vec \
               WHERE embedding MATCH ?1 ORDER BY distance LIMIT ?2) AS knn \
         JOIN recall_entries e ON e.id = knn.id \
         WHERE e.embedding_model = ?3 AND e.unhelpful = 0 \
         ORDER BY knn.distance",
    )?;
    let hits = stmt
        .query_map(
            params![
                embedding_to_bytes(embedding),
                (top_k * MODEL_FILTER_HEADROOM) as i64,
                model_id
            ],
            |row| {
                let stored_at: String = row.get(2)?;
                let distance: f64 = row.get(3)?;
                Ok(RecallHit {
                    question: row.get(0)?,
                    query: row.get(1)?,
                    similarity: l2_distance_to_cosine(distance),
                    stored_at: parse_stored_at(&stored_at),
                })
            },
        )?
        .take(top_k)
        .collect::<Result<Vec<_>, _>>()?;
    Ok(hits)
}

#[async_trait]
impl RecallBackend for VectorIndexBackend {
    fn tier(&self) -> RecallTier {
        RecallTier::VectorIndex
    }

    async fn search(&self, query: RecallQuery<'_>) -> Result<Vec<RecallHit>, RecallBackendError> {
        let embedding = query
            .embedding
            .ok_or_else(|| RecallBackendError::Unavailable("no question embedding".into()))?
            .to_vec();
        let model_id = query.model_id.to_string();
        let top_k = query.top_k;
        let db = SharedDb::clone(&self.db);

        let hits = tokio::task::spawn_blocking(move || {
            let conn = db::lock(&db)?;
            knn(&conn, &embedding, &model_id, top_k)
        })
        .await
        .map_err(|e| RecallBackendError::Unavailable(format!("vector search task failed: {e}")))??;
        Ok(hits)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::EMBEDDING_DIM;
    use crate::recall::entries::record_entry;

    fn spike(i: usize) -> Vec<f32> {
        let mut v = vec![0.0f32; EMBEDDING_DIM];
        v[i] = 1.0;
        v
    }

    #[test]
    fn distance_conversion() {
        assert!((l2_distance_to_cosine(0.0) - 1.0).abs() < 1e-12);
        assert!(l2_distance_to_cosine(std::f64::consts::SQRT_2).abs() < 1e-12);
    }

    #[tokio::test]
    async fn nearest_entry_scores_highest_and_other_models_are_skipped() {
        let mut conn = db::open_memory_database().unwrap();
        record_entry(&mut conn, "judge home runs", "SELECT 1", "m", &spike(0)).unwrap();
        record_entry(&mut conn, "lakers rebounds", "SELECT 2", "m", &spike(5)).unwrap();
        record_entry(&mut conn, "judge home runs (old model)", "SELECT 3", "other", &spike(0)).unwrap();
        let backend = VectorIndexBackend::new(db::shared(conn));

        let query_vec = spike(0);
        let hits = backend
            .search(RecallQuery {
                text: "judge home runs",
                embedding: Some(&query_vec),
                model_id: "m",
                top_k: 5,
            })
            .await
            .unwrap();

        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].query, "SELECT 1");
        assert!((hits[0].similarity - 1.0).abs() < 1e-4);
        assert!(hits.iter().all(|h| h.query != "SELECT 3"));
    }

    #[tokio::test]
    async fn unhelpful_entries_are_not_returned() {
        let mut conn = db::open_memory_database().unwrap();
        let bad = record_entry(&mut conn, "judge home runs", "SELECT 1", "m", &spike(0)).unwrap();
        conn.execute("UPDATE recall_entries SET unhelpful = 1 WHERE id = ?1", [&bad.id])
            .unwrap();
        let backend = VectorIndexBackend::new(db::shared(conn));

        let query_vec = spike(0);
        let hits = backend
            .search(RecallQuery {
                text: "judge home runs",
                embedding: Some(&query_vec),
                model_id: "m",
                top_k: 5,
            })
            .await
            .unwrap();
        assert!(hits.is_empty());
    }

    #[tokio::test]
    async fn missing_embedding_is_unavailable() {
        let backend = VectorIndexBackend::new(db::shared(db::open_memory_database().unwrap()));
        let err = backend
            .search(RecallQuery { text: "x", embedding: None, model_id: "m", top_k: 5 })
            .await
            .unwrap_err();
        assert!(matches!(err, RecallBackendError::Unavailable(_)));
    }
}
