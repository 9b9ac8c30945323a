//! CLI `learn` command: seed the recall corpus from a JSON file.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::Path;
use std::sync::Arc;

use crate::config::BlitzConfig;
use crate::db;
use crate::embedding;
use crate::recall::entries;

/// One answered question. The file holds a JSON array of these.
#[derive(Debug, Deserialize)]
struct LearnEntry {
    question: String,
    query: String,
}

/// Embed and store each `(question, query)` pair. Identical pairs are skipped.
pub async fn learn(config: &BlitzConfig, file: &Path) -> Result<()> {
    let json = std::fs::read_to_string(file)
        .with_context(|| format!("failed to read file: {}", file.display()))?;
    let pairs: Vec<LearnEntry> = serde_json::from_str(&json)
        .context("expected a JSON array of {\"question\", \"query\"} objects")?;

    let (shared, embedder) = super::open_recall_store(config)?;
    println!("Learning {} question(s)...", pairs.len());

    let mut stored = 0u64;
    let mut skipped = 0u64;
    let mut rejected = 0u64;

    for pair in pairs {
        if pair.question.trim().is_empty() || pair.query.trim().is_empty() {
            rejected += 1;
            continue;
        }

        let ep = Arc::clone(&embedder);
        let question = pair.question.clone();
        let embedding = tokio::task::spawn_blocking(move || ep.embed(&question)).await??;
        if !embedding::has_direction(&embedding) {
            tracing::warn!(question = %pair.question, "question has no embeddable content; skipped");
            rejected += 1;
            continue;
        }

        let mut conn = db::lock(&shared)?;
        let result = entries::record_entry(
            &mut conn,
            &pair.question,
            &pair.query,
            embedder.model_id(),
            &embedding,
        )?;
        if result.duplicate {
            skipped += 1;
        } else {
            stored += 1;
        }
    }

    println!("Learn complete:");
    println!("  Stored:   {stored}");
    println!("  Skipped:  {skipped} (already known)");
    if rejected > 0 {
        println!("  Rejected: {rejected} (empty question or query)");
    }
    Ok(())
}
