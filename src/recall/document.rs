//! Tier 2: keyword candidates from FTS5 (BM25), reranked by cosine similarity
//! against the stored question embedding.

use async_trait::async_trait;
use rusqlite::params;

use super::{parse_stored_at, RecallBackend, RecallHit, RecallQuery, RecallTier};
use crate::db::{self, bytes_to_embedding, SharedDb};
use crate::embedding::cosine_similarity;
use crate::error::RecallBackendError;

/// BM25 candidates fetched per requested hit before reranking.
const CANDIDATES_PER_HIT: usize = 4;

pub struct DocumentStoreBackend {
    db: SharedDb,
}

impl DocumentStoreBackend {
    pub fn new(db: SharedDb) -> Self {
        Self { db }
    }
}

/// Quote every word and OR them together so FTS5 never sees user syntax and
/// a partial overlap still produces candidates.
fn escape_fts_query(query: &str) -> String {
    query
        .split(|c: char| !c.is_alphanumeric())
        .filter(|word| !word.is_empty())
        .map(|word| format!("\"{}\"", word.to_lowercase()))
        .collect::<Vec<_>>()
        .join(" OR ")
}

fn keyword_candidates(
    conn: &rusqlite::Connection,
    text: &str,
    model_id: &str,
    limit: usize,
) -> anyhow::Result<Vec<(String, String, String, Vec<f32>)>> {
    let match_expr = escape_fts_query(text);
    if match_expr.is_empty() {
        return Ok(Vec::new());
    }
    let mut stmt = conn.prepare(
        "SELECT e.question, e.query, e.created_at, e.embedding \
         FROM recall_fts f JOIN recall_entries e ON e.rowid = f.rowid \
         WHERE recall_fts MATCH ?1 AND e.embedding_model = ?2 AND e.unhelpful = 0 \
         ORDER BY f.rank LIMIT ?3",
    )?;
    let rows = stmt
        .query_map(params![match_expr, model_id, limit as i64], |row| {
            let blob: Vec<u8> = row.get(3)?;
            Ok((row.get(0)?, row.get(1)?, row.get(2)?, bytes_to_embedding(&blob)))
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

#[async_trait]
impl RecallBackend for DocumentStoreBackend {
    fn tier(&self) -> RecallTier {
        RecallTier::DocumentStore
    }

    async fn search(&self, query: RecallQuery<'_>) -> Result<Vec<RecallHit>, RecallBackendError> {
        let embedding = query
            .embedding
            .ok_or_else(|| RecallBackendError::Unavailable("no question embedding".into()))?
            .to_vec();
        let text = query.text.to_string();
        let model_id = query.model_id.to_string();
        let top_k = query.top_k;
        let db = SharedDb::clone(&self.db);

        let candidates = tokio::task::spawn_blocking(move || {
            let conn = db::lock(&db)?;
            keyword_candidates(&conn, &text, &model_id, top_k * CANDIDATES_PER_HIT)
        })
        .await
        .map_err(|e| RecallBackendError::Unavailable(format!("document search task failed: {e}")))??;

        let mut hits: Vec<RecallHit> = candidates
            .into_iter()
            .map(|(question, query, created_at, stored)| RecallHit {
                similarity: cosine_similarity(&embedding, &stored),
                question,
                query,
                stored_at: parse_stored_at(&created_at),
            })
            .collect();
        hits.sort_by(|a, b| b.similarity.total_cmp(&a.similarity));
        hits.truncate(top_k);
        Ok(hits)
    }
}
