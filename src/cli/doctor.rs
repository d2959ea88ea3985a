//! CLI `doctor` command: run database diagnostics and print a health report.

use anyhow::{Context, Result};
use strata::storage::LocalStore;
use strata::StrataConfig;

use super::format_bytes;

pub async fn doctor(config: &StrataConfig) -> Result<()> {
    let db_path = config.resolved_db_path();

    if !db_path.exists() {
        println!("Database: not found at {}", db_path.display());
        println!("Run `strata store` or `strata serve` to initialize.");
        return Ok(());
    }

    let file_size = std::fs::metadata(&db_path).map(|m| m.len()).unwrap_or(0);
    let store = LocalStore::open(&db_path).context("failed to open database (may be corrupt)")?;
    let report = store.health().await.context("failed to run health check")?;

    println!("Strata Health Report");
    println!("====================");
    println!();
    println!("Database:          {}", db_path.display());
    println!("File size:         {}", format_bytes(file_size));
    println!("Schema version:    {}", report.schema_version);
    println!();
    println!("Embedding model:");
    println!("  Stored:          {}", report.embedding_model.as_deref().unwrap_or("(not set)"));
    println!("  Configured:      {}", config.embedding.model);
    if let Some(ref stored) = report.embedding_model {
        if stored != &config.embedding.model {
            println!("  WARNING: model mismatch! Stored vectors are not comparable to new ones.");
        } else {
            println!("  Status:          OK (match)");
        }
    }
    println!();
    println!("Row counts:");
    println!("  Memories:        {}", report.memory_count);
    println!("  Projects:        {}", report.project_count);
    println!("  Clusters:        {}", report.cluster_count);
    println!("  Patterns:        {}", report.pattern_count);
    println!();
    println!("Sync outbox:");
    println!("  Pending:         {}", report.outbox_pending);
    println!("  Dead letters:    {}", report.dead_letters);
    if report.dead_letters > 0 {
        println!("  Run `strata dead-letters --requeue` once the remote is reachable.");
    }
    println!();
    if report.integrity_ok {
        println!("Integrity check:   PASSED");
    } else {
        println!("Integrity check:   FAILED");
        println!();
        println!("Recovery steps:");
        println!("  1. Restore from a backup: cp backup.db ~/.strata/memory.db");
        println!("  2. Or delete the local cache; queued writes not yet synced are lost.");
    }

    Ok(())
}
