//! CLI `store` and `search` commands.

use anyhow::Result;
use strata::{InteractionType, MemoryMetadata, RequestContext, SearchOptions, StoreRequest, StrataConfig};

use super::{open_engine, preview};

pub struct StoreArgs<'a> {
    pub project: &'a str,
    pub content: &'a str,
    pub kind: InteractionType,
    pub files: Vec<String>,
    pub tools: Vec<String>,
    pub success: Option<f32>,
    pub language: Option<String>,
}

pub async fn store(config: &StrataConfig, args: StoreArgs<'_>) -> Result<()> {
    let engine = open_engine(config).await?;
    let ctx = RequestContext::new(args.project);
    let mut request = StoreRequest::new(args.kind)
        .with_metadata(MemoryMetadata {
            language: args.language,
            ..Default::default()
        })
        .with_files(args.files)
        .with_tools(args.tools);
    if let Some(score) = args.success {
        request = request.with_success(score);
    }

    let record = engine.store(&ctx, args.content, request).await?;
    println!("Stored {} ({}) in project {}", record.id, record.interaction_type, record.project_id);
    Ok(())
}

pub async fn search(
    config: &StrataConfig,
    project: &str,
    query: &str,
    limit: Option<usize>,
    file: Option<String>,
) -> Result<()> {
    let engine = open_engine(config).await?;
    let ctx = RequestContext::new(project);
    let options = SearchOptions {
        limit,
        current_file: file,
        ..Default::default()
    };
    let response = engine.search(&ctx, query, options).await?;

    if response.results.is_empty() {
        println!("No results found.");
        return Ok(());
    }
    if response.degraded {
        println!("(remote tier unavailable; local results only)");
    }
    println!("Found {} result(s)\n", response.results.len());

    for (i, result) in response.results.iter().enumerate() {
        println!(
            "  {}. [{}] {} (similarity: {:.3}, boost: {:.2}, score: {:.3})",
            i + 1,
            result.record.interaction_type,
            result.record.id,
            result.similarity,
            result.boost,
            result.score,
        );
        println!("     {}", preview(&result.record.content, 120));
        println!();
    }

    if !response.patterns.is_empty() {
        println!("Suggested workflows:");
        for m in &response.patterns {
            println!(
                "  {} (seen {}x, success {:.0}%{})",
                m.pattern.action_sequence.join(" -> "),
                m.pattern.occurrence_count,
                m.pattern.success_rate * 100.0,
                if m.pattern.auto_apply { ", auto-apply" } else { "" },
            );
        }
    }
    Ok(())
}
