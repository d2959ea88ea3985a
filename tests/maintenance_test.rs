mod helpers;

use strata::memory::cosine_similarity;
use strata::monitor::Health;
use strata::{MemoryMetadata, RequestContext, SearchOptions, StoreRequest};

#[tokio::test]
async fn duplicates_merge_into_one_representative() {
    let engine = helpers::local_engine().await;
    let ctx = RequestContext::new("alpha");
    let text = "always run migrations inside a transaction";
    let a = engine.store(&ctx, text, StoreRequest::default()).await.unwrap();
    let b = engine.store(&ctx, text, StoreRequest::default()).await.unwrap();
    engine
        .store(&ctx, "kubernetes liveness checks need a grace period", StoreRequest::default())
        .await
        .unwrap();

    let report = engine.optimize_project("alpha").await.unwrap().unwrap();
    assert_eq!(report.merged, 1);
    assert_eq!(engine.project_stats("alpha").await.unwrap().memories, 2);

    let survivor = match engine.get_by_id(&ctx, &a.id).await.unwrap() {
        Some(r) => r,
        None => engine.get_by_id(&ctx, &b.id).await.unwrap().unwrap(),
    };
    assert_eq!(survivor.access_count, 2);
    assert_eq!(survivor.metadata.merged_from.len(), 1);

    // The cached working set was refreshed with the merged state.
    let response = engine.search(&ctx, text, SearchOptions::default()).await.unwrap();
    assert_eq!(
        response.results.iter().filter(|r| r.record.content == text).count(),
        1
    );
}

#[tokio::test]
async fn prune_respects_pins_and_minimum_retention() {
    let mut config = helpers::test_config();
    config.optimizer.max_project_bytes = 1;
    config.optimizer.min_retained = 2;
    let engine = helpers::engine_with(config, None).await;
    let ctx = RequestContext::new("alpha");

    let pinned = engine
        .store(
            &ctx,
            "production database credentials rotate quarterly",
            StoreRequest::default().with_metadata(MemoryMetadata {
                pinned: true,
                ..Default::default()
            }),
        )
        .await
        .unwrap();
    for text in [
        "lunch order for friday",
        "the office plant needs water",
        "weekly standup moved to tuesday",
        "parking garage closes early",
    ] {
        engine.store(&ctx, text, StoreRequest::default()).await.unwrap();
    }

    let report = engine.optimize_project("alpha").await.unwrap().unwrap();
    assert_eq!(report.pruned, 3);
    assert!(report.budget_exceeded);
    assert_eq!(engine.project_stats("alpha").await.unwrap().memories, 2);
    assert!(engine.get_by_id(&ctx, &pinned.id).await.unwrap().is_some());

    // The ceiling is raised so the next run does not keep hammering the project.
    assert!(report.footprint_after > 1);
    let again = engine.optimize_project("alpha").await.unwrap().unwrap();
    assert_eq!(again.pruned, 0);
}

#[tokio::test]
async fn tight_budget_never_prunes_protected_records() {
    let mut config = helpers::test_config();
    config.optimizer.max_project_bytes = 1;
    config.optimizer.min_retained = 0;
    let engine = helpers::engine_with(config.clone(), None).await;
    let ctx = RequestContext::new("alpha");

    let important = engine
        .store(
            &ctx,
            "rollback runbook lives in ops/rollback.md",
            StoreRequest::default().with_metadata(MemoryMetadata {
                important: true,
                ..Default::default()
            }),
        )
        .await
        .unwrap();
    let stored = engine.get_by_id(&ctx, &important.id).await.unwrap().unwrap();
    let score = strata::optimizer::prune::retention_score(&stored, chrono::Utc::now(), &config.optimizer);
    assert!(score >= config.optimizer.protect_threshold, "score {score}");

    for text in [
        "lunch order for friday",
        "the office plant needs water",
        "parking garage closes early",
    ] {
        engine.store(&ctx, text, StoreRequest::default()).await.unwrap();
    }

    let report = engine.optimize_project("alpha").await.unwrap().unwrap();
    assert_eq!(report.pruned, 3);
    assert!(report.budget_exceeded);
    assert_eq!(engine.project_stats("alpha").await.unwrap().memories, 1);
    assert!(engine.get_by_id(&ctx, &important.id).await.unwrap().is_some());
}

#[tokio::test]
async fn compressed_records_read_back_intact() {
    let mut config = helpers::test_config();
    config.optimizer.compress_age_days = 0;
    config.optimizer.compress_min_bytes = 64;
    let engine = helpers::engine_with(config, None).await;
    let ctx = RequestContext::new("alpha");

    let content = "the retry loop backs off exponentially from one second up to five minutes \
                   and gives up after eight attempts, parking the item for an operator";
    let original = engine.store(&ctx, content, StoreRequest::default()).await.unwrap();

    let report = engine.optimize_project("alpha").await.unwrap().unwrap();
    assert_eq!(report.compressed, 1);

    let stored = engine.get_by_id(&ctx, &original.id).await.unwrap().unwrap();
    assert!(stored.compressed);
    assert_eq!(stored.content, content);
    let fidelity = cosine_similarity(&stored.embedding, &original.embedding);
    assert!(fidelity >= 0.95f32.sqrt() - 1e-4, "fidelity {fidelity}");

    let hits = engine
        .search(&ctx, "retry loop backs off exponentially", SearchOptions::default())
        .await
        .unwrap();
    assert_eq!(hits.results[0].record.id, original.id);
}

#[tokio::test]
async fn critical_health_skips_merge() {
    let engine = helpers::local_engine().await;
    let ctx = RequestContext::new("alpha");
    let text = "document every public function";
    engine.store(&ctx, text, StoreRequest::default()).await.unwrap();
    engine.store(&ctx, text, StoreRequest::default()).await.unwrap();

    engine.monitor().record_isolation(false);
    assert_eq!(engine.monitor().health(), Health::Critical);

    let report = engine.optimize_project("alpha").await.unwrap().unwrap();
    assert!(report.merge_skipped);
    assert_eq!(report.merged, 0);
    assert_eq!(engine.project_stats("alpha").await.unwrap().memories, 2);
}
