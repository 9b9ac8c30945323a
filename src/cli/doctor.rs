//! CLI `doctor` command: run database diagnostics and print a health report.

use anyhow::{Context, Result};

use crate::config::BlitzConfig;
use crate::db;
use crate::embedding;

/// Run database diagnostics and print a health report.
pub fn doctor(config: &BlitzConfig) -> Result<()> {
    let db_path = config.resolved_db_path();

    if !db_path.exists() {
        println!("Database: not found at {}", db_path.display());
        println!("Run `blitz serve` to initialize.");
        return Ok(());
    }

    let file_size = std::fs::metadata(&db_path).map(|m| m.len()).unwrap_or(0);

    let conn = db::open_database(&db_path).context("failed to open database (may be corrupt)")?;
    let report = db::check_database_health(&conn).context("failed to run health check")?;

    println!("Blitz Health Report");
    println!("===================");
    println!();
    println!("Database:          {}", db_path.display());
    println!("File size:         {}", format_bytes(file_size));
    println!("Schema version:    {}", report.schema_version);
    println!("sqlite-vec:        v{}", report.sqlite_vec_version);
    println!();

    // The provider may be unavailable (model not downloaded); report instead of failing.
    let configured = match embedding::create_provider(&config.embedding) {
        Ok(provider) => provider.model_id().to_string(),
        Err(e) => {
            println!("Embedding provider: UNAVAILABLE ({e:#})");
            config.embedding.model.clone()
        }
    };
    println!("Embedding model:");
    println!("  Stored:          {}", report.embedding_model.as_deref().unwrap_or("(not set)"));
    println!("  Configured:      {configured}");
    if let Some(stored) = &report.embedding_model {
        if stored != &configured {
            println!("  WARNING: model mismatch; recall ignores entries from the stored model.");
        } else {
            println!("  Status:          OK (match)");
        }
    }
    println!();
    println!("Row counts:");
    println!("  Conversations:   {}", report.conversation_count);
    println!("  Messages:        {}", report.message_count);
    println!("  Recall entries:  {}", report.recall_entry_count);
    println!("    unhelpful:     {}", report.unhelpful_entry_count);
    match config.recall.max_entry_age_days {
        0 => println!("    retention:     forever"),
        days => println!("    retention:     {days} days"),
    }
    println!();
    println!("Agent endpoints:");
    println!("  Assistant:       {}", config.agent.assistant_url.as_deref().unwrap_or("(not set)"));
    println!("  Tools:           {}", config.agent.tools_url.as_deref().unwrap_or("(not set)"));
    println!();
    if report.integrity_ok {
        println!("Integrity check:   PASSED");
    } else {
        println!("Integrity check:   FAILED ({})", report.integrity_details);
        println!();
        println!("Recovery steps:");
        println!("  1. Stop the server and restore from a backup of {}", db_path.display());
        println!("  2. Or move the file aside; `blitz serve` creates a fresh database");
        println!("     and `blitz learn` can reload recall entries.");
    }

    Ok(())
}

fn format_bytes(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{bytes} B")
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    }
}
