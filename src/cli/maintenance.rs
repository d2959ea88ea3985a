//! CLI maintenance commands: one-shot runs of the background jobs.

use anyhow::Result;
use strata::StrataConfig;

use super::{format_bytes, open_engine};

/// Drain the outbox until nothing due remains or a cycle makes no progress.
pub async fn sync(config: &StrataConfig) -> Result<()> {
    let engine = open_engine(config).await?;
    let mut total = 0;
    loop {
        let Some(report) = engine.run_sync_cycle().await? else {
            break;
        };
        total += report.synced;
        if report.claimed == 0 || report.synced == 0 {
            println!(
                "Synced {total} item(s); {} failed, {} dead-lettered this cycle.",
                report.failed, report.dead_lettered
            );
            break;
        }
    }
    Ok(())
}

pub async fn optimize(config: &StrataConfig, project: Option<&str>) -> Result<()> {
    let engine = open_engine(config).await?;
    let projects = match project {
        Some(p) => vec![p.to_string()],
        None => engine.projects().await?,
    };
    for project in projects {
        let Some(report) = engine.optimize_project(&project).await? else {
            continue;
        };
        println!("Project {project}:");
        println!(
            "  Footprint:   {} -> {} (ceiling {})",
            format_bytes(report.footprint_before),
            format_bytes(report.footprint_after),
            format_bytes(report.ceiling),
        );
        println!("  Pruned:      {}", report.pruned);
        println!("  Merged:      {}{}", report.merged, if report.merge_skipped { " (skipped)" } else { "" });
        println!("  Compressed:  {} ({} saved)", report.compressed, format_bytes(report.bytes_saved));
        if report.budget_exceeded {
            println!("  WARNING: budget still exceeded; ceiling raised temporarily.");
        }
    }
    Ok(())
}

pub async fn cluster(config: &StrataConfig, project: Option<&str>) -> Result<()> {
    let engine = open_engine(config).await?;
    let projects = match project {
        Some(p) => vec![p.to_string()],
        None => engine.projects().await?,
    };
    for project in projects {
        let Some(report) = engine.cluster_project(&project).await? else {
            continue;
        };
        println!(
            "Project {project}: {} cluster(s), {} bridge(s), {}/{} records clustered",
            report.clusters, report.bridges, report.clustered_records, report.total_records
        );
        for c in engine.local().load_clusters(&project).await? {
            println!("  {} [{} members, stability {:.2}]", c.label, c.member_ids.len(), c.stability);
        }
        for b in engine.local().load_bridges(&project).await? {
            println!("  bridge {} spans {} clusters", b.memory_id, b.cluster_ids.len());
        }
    }
    Ok(())
}

pub async fn dead_letters(config: &StrataConfig, requeue: bool, limit: usize) -> Result<()> {
    let engine = open_engine(config).await?;
    if requeue {
        let n = engine.requeue_dead_letters().await?;
        println!("Requeued {n} dead-lettered item(s).");
        return Ok(());
    }
    let items = engine.dead_letters(limit).await?;
    if items.is_empty() {
        println!("No dead-lettered items.");
        return Ok(());
    }
    for item in items {
        println!(
            "  #{} {} {} (project {}, {} attempts): {}",
            item.id,
            item.operation.as_str(),
            item.record_id,
            item.project_id,
            item.attempts,
            item.last_error.as_deref().unwrap_or("-"),
        );
    }
    Ok(())
}
