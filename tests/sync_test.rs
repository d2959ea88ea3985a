mod helpers;

use std::time::Duration;
use strata::memory::types::SyncState;
use strata::monitor::AlertKind;
use strata::storage::StorageAdapter;
use strata::{RequestContext, SearchOptions, StoreRequest};

async fn backoff_elapses() {
    tokio::time::sleep(Duration::from_millis(20)).await;
}

#[tokio::test]
async fn writes_reach_remote_after_partition_heals() {
    let (engine, remote) = helpers::remote_engine().await;
    let ctx = RequestContext::new("alpha");
    remote.set_reachable(false);

    let record = engine
        .store(&ctx, "pin the toolchain version", StoreRequest::default())
        .await
        .unwrap();
    let report = engine.run_sync_cycle().await.unwrap().unwrap();
    assert_eq!(report.failed, 1);
    let stored = engine.local().get_by_id(&record.id).await.unwrap().unwrap();
    assert_eq!(stored.sync_state, SyncState::Failed);

    remote.set_reachable(true);
    backoff_elapses().await;
    let report = engine.run_sync_cycle().await.unwrap().unwrap();
    assert_eq!(report.synced, 1);

    let stored = engine.local().get_by_id(&record.id).await.unwrap().unwrap();
    assert_eq!(stored.sync_state, SyncState::Synced);
    assert_eq!(remote.get_by_id(&record.id).await.unwrap().unwrap().content, record.content);
}

#[tokio::test]
async fn dead_lettered_records_stay_readable() {
    let (engine, remote) = helpers::remote_engine().await;
    let ctx = RequestContext::new("alpha");
    remote.set_reachable(false);

    let record = engine
        .store(&ctx, "vendor the protobuf definitions", StoreRequest::default())
        .await
        .unwrap();
    for _ in 0..3 {
        engine.run_sync_cycle().await.unwrap().unwrap();
        backoff_elapses().await;
    }

    let dead = engine.dead_letters(10).await.unwrap();
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].record_id, record.id);
    assert_eq!(dead[0].attempts, 3);
    let metrics = engine.get_metrics().await.unwrap();
    assert!(metrics
        .monitor
        .recent_alerts
        .iter()
        .any(|a| a.kind == AlertKind::DeadLetter));

    // Still served locally, and no longer retried.
    let stored = engine.get_by_id(&ctx, &record.id).await.unwrap().unwrap();
    assert_eq!(stored.sync_state, SyncState::DeadLetter);
    let hits = engine
        .search(&ctx, "protobuf definitions", SearchOptions::default())
        .await
        .unwrap();
    assert_eq!(hits.results[0].record.id, record.id);
    assert_eq!(engine.run_sync_cycle().await.unwrap().unwrap().claimed, 0);

    // Operator requeue after the remote recovers.
    remote.set_reachable(true);
    assert_eq!(engine.requeue_dead_letters().await.unwrap(), 1);
    assert_eq!(engine.run_sync_cycle().await.unwrap().unwrap().synced, 1);
    assert_eq!(remote.len(), 1);
}

#[tokio::test]
async fn concurrent_edits_are_reconciled_field_by_field() {
    let (engine, remote) = helpers::remote_engine().await;
    let ctx = RequestContext::new("alpha");
    let record = engine
        .store(&ctx, "original wording", StoreRequest::default())
        .await
        .unwrap();
    engine.run_sync_cycle().await.unwrap().unwrap();

    // Another writer updates the remote copy with a newer version.
    let mut theirs = remote.get_by_id(&record.id).await.unwrap().unwrap();
    theirs.content = "remote wording".into();
    theirs.version = record.version + 1_000_000;
    theirs.access_count = 7;
    remote.put(&theirs).await.unwrap();

    // Meanwhile this writer touched the record locally.
    let mut ours = engine.local().get_by_id(&record.id).await.unwrap().unwrap();
    ours.metadata.accessed_by.insert("carol".into());
    engine.local().put(&ours).await.unwrap();

    let report = engine.run_sync_cycle().await.unwrap().unwrap();
    assert_eq!(report.reconciled, 1);

    let local = engine.local().get_by_id(&record.id).await.unwrap().unwrap();
    let remote_copy = remote.get_by_id(&record.id).await.unwrap().unwrap();
    assert_eq!(local.content, "remote wording");
    assert_eq!(local.access_count, 7);
    assert!(local.metadata.accessed_by.contains("carol"));
    assert_eq!(remote_copy.content, local.content);
    assert!(remote_copy.metadata.accessed_by.contains("carol"));
}

#[tokio::test]
async fn deletes_propagate() {
    let (engine, remote) = helpers::remote_engine().await;
    let ctx = RequestContext::new("alpha");
    let record = engine
        .store(&ctx, "temporary note", StoreRequest::default())
        .await
        .unwrap();
    engine.run_sync_cycle().await.unwrap().unwrap();
    assert_eq!(remote.len(), 1);

    assert!(engine.delete(&ctx, &record.id).await.unwrap());
    engine.run_sync_cycle().await.unwrap().unwrap();
    assert!(remote.is_empty());
    assert!(engine.get_by_id(&ctx, &record.id).await.unwrap().is_none());
}

#[tokio::test]
async fn slow_remote_degrades_search_to_local() {
    let (engine, remote) = helpers::remote_engine().await;
    let ctx = RequestContext::new("alpha");
    engine
        .store(&ctx, "feature flags live in launchdarkly", StoreRequest::default())
        .await
        .unwrap();
    remote.set_latency(Duration::from_millis(1_000));

    let response = engine
        .search(&ctx, "feature flags", SearchOptions::default())
        .await
        .unwrap();
    assert!(response.degraded);
    assert_eq!(response.results.len(), 1);
    assert!(engine.get_metrics().await.unwrap().monitor.remote_timeouts >= 1);
}

#[tokio::test]
async fn unreachable_remote_still_serves_local_results() {
    let (engine, remote) = helpers::remote_engine().await;
    let ctx = RequestContext::new("alpha");
    remote.set_reachable(false);
    engine
        .store(&ctx, "nightly backups run at 02:00", StoreRequest::default())
        .await
        .unwrap();

    let response = engine
        .search(&ctx, "nightly backups", SearchOptions::default())
        .await
        .unwrap();
    assert!(response.degraded);
    assert_eq!(response.results.len(), 1);
}
