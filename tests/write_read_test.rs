mod helpers;

use strata::memory::types::{ResultSource, SyncState};
use strata::{
    InteractionType, MemoryError, MemoryMetadata, RequestContext, SearchOptions, StoreRequest,
};

#[tokio::test]
async fn store_and_search_returns_relevant_first() {
    let engine = helpers::local_engine().await;
    let ctx = RequestContext::new("alpha");

    let wanted = engine
        .store(
            &ctx,
            "sqlite migration failed because the schema_meta table was missing",
            StoreRequest::new(InteractionType::ErrorFix),
        )
        .await
        .unwrap();
    engine
        .store(&ctx, "prefer tabs in the makefile", StoreRequest::default())
        .await
        .unwrap();

    let response = engine
        .search(&ctx, "sqlite migration schema_meta missing", SearchOptions::default())
        .await
        .unwrap();
    assert_eq!(response.results[0].record.id, wanted.id);
    assert_eq!(response.results[0].source, ResultSource::Local);
    assert!(!response.degraded);
}

#[tokio::test]
async fn projects_never_see_each_other() {
    let engine = helpers::local_engine().await;
    let a = RequestContext::new("project-a");
    let b = RequestContext::new("project-b");

    for text in [
        "cache invalidation bug in the session store",
        "cache warmup on startup",
        "cache keys include the tenant id",
    ] {
        engine.store(&a, text, StoreRequest::default()).await.unwrap();
    }
    for text in ["cache eviction policy is lru", "cache size is 512 entries"] {
        engine.store(&b, text, StoreRequest::default()).await.unwrap();
    }

    let in_a = engine.search(&a, "cache", SearchOptions::default()).await.unwrap();
    assert_eq!(in_a.results.len(), 3);
    assert!(in_a.results.iter().all(|r| r.record.project_id == "project-a"));

    let in_b = engine.search(&b, "cache", SearchOptions::default()).await.unwrap();
    assert_eq!(in_b.results.len(), 2);
    assert!(in_b.results.iter().all(|r| r.record.project_id == "project-b"));
}

#[tokio::test]
async fn deprecated_records_score_at_most_half() {
    let engine = helpers::local_engine().await;
    let ctx = RequestContext::new("alpha");
    let text = "use the builder pattern for config structs";

    let fresh = engine.store(&ctx, text, StoreRequest::default()).await.unwrap();
    let old = engine
        .store(
            &ctx,
            text,
            StoreRequest::default().with_metadata(MemoryMetadata {
                deprecated: true,
                ..Default::default()
            }),
        )
        .await
        .unwrap();

    let response = engine.search(&ctx, text, SearchOptions::default()).await.unwrap();
    let score = |id: &str| {
        response
            .results
            .iter()
            .find(|r| r.record.id == id)
            .map(|r| r.score)
            .unwrap()
    };
    assert_eq!(response.results[0].record.id, fresh.id);
    assert!(score(&old.id) <= 0.5 * score(&fresh.id) + 1e-6);
}

#[tokio::test]
async fn current_file_boosts_matching_records() {
    let engine = helpers::local_engine().await;
    let ctx = RequestContext::new("alpha");
    let text = "wrap rusqlite errors with context";

    engine.store(&ctx, text, StoreRequest::default()).await.unwrap();
    let in_file = engine
        .store(&ctx, text, StoreRequest::default().with_files(["src/db/mod.rs"]))
        .await
        .unwrap();

    let options = SearchOptions {
        current_file: Some("/home/dev/strata/src/db/mod.rs".into()),
        ..Default::default()
    };
    let response = engine.search(&ctx, text, options).await.unwrap();
    assert_eq!(response.results[0].record.id, in_file.id);
    let ratio = response.results[0].boost / response.results[1].boost;
    assert!((ratio - 1.5).abs() < 1e-4, "ratio was {ratio}");
}

#[tokio::test]
async fn project_context_persists_and_boosts() {
    let engine = helpers::local_engine().await;
    let ctx = RequestContext::new("alpha");
    let text = "handle sigterm gracefully";

    engine.store(&ctx, text, StoreRequest::default()).await.unwrap();
    let in_file = engine
        .store(&ctx, text, StoreRequest::default().with_files(["src/main.rs"]))
        .await
        .unwrap();
    engine
        .set_current_context(&ctx, Some("src/main.rs".into()), None)
        .await
        .unwrap();

    let response = engine.search(&ctx, text, SearchOptions::default()).await.unwrap();
    assert_eq!(response.results[0].record.id, in_file.id);
    let settings = engine.local().load_settings("alpha").await.unwrap().unwrap();
    assert_eq!(settings.current_file.as_deref(), Some("src/main.rs"));
}

#[tokio::test]
async fn search_records_access_per_user() {
    let engine = helpers::local_engine().await;
    let alice = RequestContext::new("alpha").with_user("alice");
    let bob = RequestContext::new("alpha").with_user("bob");

    let record = engine
        .store(&alice, "run clippy with -D warnings", StoreRequest::default())
        .await
        .unwrap();
    engine.search(&alice, "clippy warnings", SearchOptions::default()).await.unwrap();
    engine.search(&bob, "clippy warnings", SearchOptions::default()).await.unwrap();

    let stored = engine.get_by_id(&alice, &record.id).await.unwrap().unwrap();
    assert_eq!(stored.access_count, 3);
    assert!(stored.metadata.accessed_by.contains("alice"));
    assert!(stored.metadata.accessed_by.contains("bob"));
    assert!(stored.last_accessed_at >= record.last_accessed_at);
}

#[tokio::test]
async fn repeated_workflows_become_patterns() {
    let engine = helpers::local_engine().await;
    let ctx = RequestContext::new("alpha");
    let tools = ["cargo fmt", "cargo clippy", "cargo test"];

    for _ in 0..3 {
        engine
            .store(
                &ctx,
                "prepare the release branch",
                StoreRequest::new(InteractionType::Pattern)
                    .with_tools(tools)
                    .with_success(1.0),
            )
            .await
            .unwrap();
    }

    let response = engine
        .search(&ctx, "prepare the release branch", SearchOptions::default())
        .await
        .unwrap();
    assert_eq!(response.patterns.len(), 1);
    let pattern = &response.patterns[0].pattern;
    assert_eq!(pattern.occurrence_count, 3);
    assert!(pattern.auto_apply);
    assert_eq!(pattern.action_sequence, tools.map(String::from).to_vec());
    // Records with the same tool chain get the pattern boost.
    assert!(response.results.iter().all(|r| r.boost > 1.0));
}

#[tokio::test]
async fn cross_project_lookups_fail_loudly() {
    let engine = helpers::local_engine().await;
    let a = RequestContext::new("project-a");
    let b = RequestContext::new("project-b");
    let record = engine.store(&a, "secret of a", StoreRequest::default()).await.unwrap();

    let err = engine.get_by_id(&b, &record.id).await.unwrap_err();
    assert!(matches!(err, MemoryError::IsolationViolation { .. }));
    let err = engine.delete(&b, &record.id).await.unwrap_err();
    assert!(matches!(err, MemoryError::IsolationViolation { .. }));

    // The record is untouched and the violation was counted.
    assert!(engine.get_by_id(&a, &record.id).await.unwrap().is_some());
    assert_eq!(engine.get_metrics().await.unwrap().monitor.isolation_violations, 2);
}

#[tokio::test]
async fn synced_records_are_merged_across_tiers() {
    let (engine, remote) = helpers::remote_engine().await;
    let ctx = RequestContext::new("alpha");
    let record = engine
        .store(&ctx, "rotate the api keys monthly", StoreRequest::default())
        .await
        .unwrap();
    assert_eq!(record.sync_state, SyncState::Queued);

    engine.run_sync_cycle().await.unwrap().unwrap();
    assert_eq!(remote.len(), 1);

    let response = engine
        .search(&ctx, "rotate api keys", SearchOptions::default())
        .await
        .unwrap();
    assert_eq!(response.results.len(), 1);
    assert!(matches!(response.results[0].source, ResultSource::Merged { .. }));
}

#[tokio::test]
async fn switching_projects_reports_previous() {
    let engine = helpers::local_engine().await;
    assert_eq!(engine.switch_project("alpha").await.unwrap(), None);
    assert_eq!(engine.switch_project("beta").await.unwrap().as_deref(), Some("alpha"));
    assert_eq!(engine.active_project().await.as_deref(), Some("beta"));
}

#[tokio::test]
async fn versions_increase_monotonically() {
    let engine = helpers::local_engine().await;
    let ctx = RequestContext::new("alpha");
    let mut last = 0;
    for i in 0..50 {
        let record = engine
            .store(&ctx, &format!("note number {i}"), StoreRequest::default())
            .await
            .unwrap();
        assert!(record.version > last);
        last = record.version;
    }
}
