use anyhow::Result;

use crate::config::BlitzConfig;
use crate::recall::engine::SemanticRecallEngine;

/// Run the recall chain for `question` against the local database and print the match.
pub async fn recall(config: &BlitzConfig, question: &str) -> Result<()> {
    let (db, embedder) = super::open_recall_store(config)?;
    let engine = SemanticRecallEngine::from_config(&config.recall, db, embedder)?;

    match engine.lookup(question).await {
        Some(candidate) => {
            println!("Match via {} (similarity {:.4})", candidate.source_tier, candidate.similarity_score);
            println!("  Question: {}", candidate.matched_question);
            println!("  Query:    {}", candidate.matched_query);
            println!("  Stored:   {}", candidate.stored_at.to_rfc3339());
        }
        None => println!("No match above threshold."),
    }
    Ok(())
}
