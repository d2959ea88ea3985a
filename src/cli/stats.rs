use anyhow::Result;
use strata::StrataConfig;

use super::{format_bytes, open_engine};

/// Print per-project statistics, or the store-wide summary.
pub async fn stats(config: &StrataConfig, project: Option<&str>) -> Result<()> {
    let engine = open_engine(config).await?;
    let projects = match project {
        Some(p) => vec![engine.project_stats(p).await?],
        None => engine.local().store_stats().await?.projects,
    };

    println!("Memory Statistics");
    println!("{}", "=".repeat(40));
    for p in &projects {
        println!("Project {}", p.project_id);
        println!("  Memories:            {}", p.memories);
        println!("  Compressed:          {}", p.compressed);
        println!("  Footprint:           {}", format_bytes(p.footprint_bytes));
        println!("  Clusters:            {}", p.clusters);
        println!("  Patterns:            {}", p.patterns);
        for (kind, count) in &p.by_type {
            println!("    {kind:<16} {count}");
        }
        for (state, count) in &p.by_sync_state {
            println!("    sync {state:<11} {count}");
        }
        if let Some(ref oldest) = p.oldest_memory {
            println!("  Oldest memory:       {oldest}");
        }
        if let Some(ref newest) = p.newest_memory {
            println!("  Newest memory:       {newest}");
        }
        println!();
    }

    let metrics = engine.get_metrics().await?;
    println!("Outbox pending:        {}", metrics.outbox.pending());
    println!("Outbox dead letters:   {}", metrics.outbox.dead_letter);
    Ok(())
}
