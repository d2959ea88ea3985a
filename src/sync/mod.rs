//! Background reconciliation between the local tier and the remote store.
//!
//! Per-item state machine:
//!
//! ```text
//! QUEUED ─claim─▶ IN_FLIGHT ─ok─▶ SYNCED
//!    ▲                │
//!    └── backoff ── FAILED ──(attempts ≥ max)──▶ DEAD_LETTER
//! ```
//!
//! Outcomes commit one item at a time. Items orphaned in flight by a crash are
//! returned to the queue by [`SyncEngine::recover`].

pub mod conflict;
pub mod outbox;

use anyhow::{anyhow, Context, Result};
use chrono::Utc;
use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::clock::HybridClock;
use crate::config::SyncConfig;
use crate::memory::types::{MemoryRecord, SyncOperation, SyncQueueItem};
use crate::monitor::PerformanceMonitor;
use crate::storage::{LocalStore, SharedStore, StorageAdapter};
use conflict::reconcile;
pub use outbox::OutboxStats;

/// Settled outbox rows are kept this long for inspection, then purged on an idle cycle.
const SYNCED_RETENTION_HOURS: i64 = 24;

/// Counters from one [`SyncEngine::run_cycle`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SyncReport {
    pub claimed: usize,
    pub synced: usize,
    pub failed: usize,
    pub dead_lettered: usize,
    /// Puts that found a remote copy and were reconciled field by field.
    pub reconciled: usize,
}

pub struct SyncEngine {
    local: LocalStore,
    remote: Option<SharedStore>,
    config: SyncConfig,
    remote_timeout: Duration,
    clock: Arc<HybridClock>,
    monitor: Arc<PerformanceMonitor>,
}

impl SyncEngine {
    pub fn new(
        local: LocalStore,
        remote: Option<SharedStore>,
        config: SyncConfig,
        remote_timeout: Duration,
        clock: Arc<HybridClock>,
        monitor: Arc<PerformanceMonitor>,
    ) -> Self {
        Self {
            local,
            remote,
            config,
            remote_timeout,
            clock,
            monitor,
        }
    }

    /// Return items left in flight by an unclean shutdown to the queue.
    pub async fn recover(&self) -> Result<usize> {
        let moved = self.local.requeue_in_flight().await?;
        if moved > 0 {
            tracing::warn!(items = moved, "requeued sync items orphaned in flight");
        }
        Ok(moved)
    }

    /// Delay before the attempt following `attempts` failures.
    pub fn backoff(&self, attempts: u32) -> Duration {
        let exp = attempts.saturating_sub(1).min(20);
        let delay = self.config.backoff_base_ms.saturating_mul(1u64 << exp);
        Duration::from_millis(delay.min(self.config.backoff_max_ms))
    }

    /// Claim one batch of due items and push each to the remote.
    pub async fn run_cycle(&self) -> Result<SyncReport> {
        let items = self
            .local
            .claim_due(self.config.batch_size, Utc::now())
            .await?;
        let mut report = SyncReport {
            claimed: items.len(),
            ..Default::default()
        };
        if items.is_empty() {
            let purged = self
                .local
                .purge_synced(Utc::now() - chrono::Duration::hours(SYNCED_RETENTION_HOURS))
                .await?;
            if purged > 0 {
                tracing::debug!(purged, "purged settled outbox rows");
            }
            return Ok(report);
        }

        let Some(remote) = self.remote.clone() else {
            // No remote tier: the local store is the durable copy.
            for item in items {
                self.local.mark_synced(item).await?;
                report.synced += 1;
            }
            return Ok(report);
        };

        for item in items {
            let started = Instant::now();
            let outcome = self.push(remote.as_ref(), &item).await;
            self.monitor.record_sync(started.elapsed());

            match outcome {
                Ok(reconciled) => {
                    self.local.mark_synced(item).await?;
                    report.synced += 1;
                    if reconciled {
                        report.reconciled += 1;
                    }
                }
                Err(e) => {
                    if self.fail(item, &e).await? {
                        report.dead_lettered += 1;
                    } else {
                        report.failed += 1;
                    }
                }
            }
        }

        tracing::info!(
            claimed = report.claimed,
            synced = report.synced,
            failed = report.failed,
            dead_lettered = report.dead_lettered,
            "sync cycle complete"
        );
        Ok(report)
    }

    /// Apply one outbox item to the remote. Returns whether a conflict was reconciled.
    async fn push(&self, remote: &dyn StorageAdapter, item: &SyncQueueItem) -> Result<bool> {
        match item.operation {
            SyncOperation::Delete => {
                self.bounded(remote.delete(&item.record_id)).await?;
                Ok(false)
            }
            SyncOperation::Put => {
                let snapshot: MemoryRecord = serde_json::from_value(item.payload.clone())
                    .context("outbox payload is not a memory record")?;
                // Push the freshest local state; the snapshot only covers deleted rows.
                let local = match self.local.get_by_id(&item.record_id).await? {
                    Some(mut row) => {
                        // A row compressed while queued holds a lossy embedding; the
                        // snapshot still has the original for this version.
                        if row.compressed && row.version == snapshot.version {
                            row.embedding = snapshot.embedding;
                            row.compressed = false;
                        }
                        row
                    }
                    None => snapshot,
                };

                match self.bounded(remote.get_by_id(&item.record_id)).await? {
                    None => {
                        let mut outgoing = local;
                        outgoing.compressed = false;
                        self.bounded(remote.put(&outgoing)).await?;
                        Ok(false)
                    }
                    Some(existing) => {
                        self.clock.observe(existing.version);
                        let merged = reconcile(&local, &existing);
                        if merged.remote_changed {
                            self.bounded(remote.put(&merged.record)).await?;
                        }
                        if merged.local_changed {
                            // Only fields the read observed are folded back; anything
                            // written locally meanwhile is kept.
                            self.local
                                .apply_reconciled(merged.record.clone(), local.version)
                                .await?;
                        }
                        tracing::debug!(
                            record_id = %item.record_id,
                            local_changed = merged.local_changed,
                            remote_changed = merged.remote_changed,
                            "reconciled conflicting copies"
                        );
                        Ok(true)
                    }
                }
            }
        }
    }

    /// Run a remote call under the configured timeout.
    async fn bounded<T>(&self, call: impl Future<Output = Result<T>>) -> Result<T> {
        match tokio::time::timeout(self.remote_timeout, call).await {
            Ok(result) => result,
            Err(_) => {
                self.monitor.record_remote_timeout();
                Err(anyhow!(
                    "remote call timed out after {}ms",
                    self.remote_timeout.as_millis()
                ))
            }
        }
    }

    /// Record a failed attempt. Returns `true` when the item was dead-lettered.
    async fn fail(&self, item: SyncQueueItem, error: &anyhow::Error) -> Result<bool> {
        let attempts = item.attempts + 1;
        let message = format!("{error:#}");

        if attempts >= self.config.max_attempts {
            let dead = crate::error::MemoryError::SyncDeadLetter {
                item_id: item.id,
                record_id: item.record_id.clone(),
                attempts,
            };
            tracing::warn!(
                item_id = item.id,
                record_id = %item.record_id,
                project = %item.project_id,
                attempts,
                error = %message,
                "{dead}"
            );
            self.monitor
                .record_dead_letter(&item.record_id, &item.project_id, attempts);
            self.local.mark_dead_letter(item, message).await?;
            return Ok(true);
        }

        let delay = self.backoff(attempts);
        let next = Utc::now()
            + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero());
        tracing::debug!(
            item_id = item.id,
            record_id = %item.record_id,
            attempts,
            retry_in_ms = delay.as_millis() as u64,
            error = %message,
            "sync attempt failed"
        );
        self.local.mark_failed(item, message, next).await?;
        Ok(false)
    }

    /// Give every dead-lettered item a fresh set of attempts.
    pub async fn requeue_dead_letters(&self) -> Result<usize> {
        let moved = self.local.requeue_dead_letters().await?;
        tracing::info!(items = moved, "requeued dead-lettered sync items");
        Ok(moved)
    }

    pub async fn dead_letters(&self, limit: usize) -> Result<Vec<SyncQueueItem>> {
        self.local.list_dead_letters(limit).await
    }

    pub async fn stats(&self) -> Result<OutboxStats> {
        self.local.outbox_stats().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MonitorConfig;
    use crate::memory::store::tests::sample_record;
    use crate::memory::types::SyncState;
    use crate::storage::InMemoryRemoteStore;

    fn engine(remote: Option<SharedStore>, max_attempts: u32) -> (SyncEngine, LocalStore) {
        let local = LocalStore::in_memory().unwrap();
        let config = SyncConfig {
            max_attempts,
            backoff_base_ms: 0,
            ..Default::default()
        };
        let engine = SyncEngine::new(
            local.clone(),
            remote,
            config,
            Duration::from_millis(200),
            Arc::new(HybridClock::new()),
            Arc::new(PerformanceMonitor::new(MonitorConfig::default())),
        );
        (engine, local)
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let (mut engine, _) = engine(None, 8);
        engine.config.backoff_base_ms = 1_000;
        engine.config.backoff_max_ms = 5_000;
        assert_eq!(engine.backoff(1), Duration::from_secs(1));
        assert_eq!(engine.backoff(2), Duration::from_secs(2));
        assert_eq!(engine.backoff(3), Duration::from_secs(4));
        assert_eq!(engine.backoff(4), Duration::from_secs(5));
        assert_eq!(engine.backoff(60), Duration::from_secs(5));
    }

    #[tokio::test]
    async fn without_remote_items_settle_locally() {
        let (engine, local) = engine(None, 8);
        let r = sample_record("alpha", "local only", vec![1.0, 0.0]);
        local.put(&r).await.unwrap();

        let report = engine.run_cycle().await.unwrap();
        assert_eq!(report.synced, 1);
        assert_eq!(local.get_by_id(&r.id).await.unwrap().unwrap().sync_state, SyncState::Synced);
    }

    #[tokio::test]
    async fn delete_propagates() {
        let remote = Arc::new(InMemoryRemoteStore::new());
        let (engine, local) = engine(Some(remote.clone()), 8);
        let r = sample_record("alpha", "short lived", vec![1.0, 0.0]);
        local.put(&r).await.unwrap();
        engine.run_cycle().await.unwrap();
        assert_eq!(remote.len(), 1);

        local.delete(&r.id).await.unwrap();
        engine.run_cycle().await.unwrap();
        assert!(remote.is_empty());
    }

    #[tokio::test]
    async fn slow_remote_times_out_and_retries() {
        let remote = Arc::new(InMemoryRemoteStore::new());
        remote.set_latency(Duration::from_millis(500));
        let (engine, local) = engine(Some(remote.clone()), 8);
        let r = sample_record("alpha", "slow", vec![1.0, 0.0]);
        local.put(&r).await.unwrap();

        let report = engine.run_cycle().await.unwrap();
        assert_eq!(report.failed, 1);
        assert_eq!(engine.monitor.snapshot().remote_timeouts, 1);

        remote.set_latency(Duration::ZERO);
        let report = engine.run_cycle().await.unwrap();
        assert_eq!(report.synced, 1);
    }

    /// A local record at v5 and a newer remote copy at v9 behind a slow link.
    async fn slow_conflict() -> (Arc<SyncEngine>, LocalStore, Arc<InMemoryRemoteStore>, MemoryRecord) {
        let remote = Arc::new(InMemoryRemoteStore::new());
        let (engine, local) = engine(Some(remote.clone()), 8);

        let mut r = sample_record("alpha", "v1", vec![1.0, 0.0]);
        r.version = 5;
        local.put(&r).await.unwrap();
        let mut theirs = r.clone();
        theirs.content = "v2 from another node".into();
        theirs.version = 9;
        remote.put(&theirs).await.unwrap();
        remote.set_latency(Duration::from_millis(80));
        (Arc::new(engine), local, remote, r)
    }

    fn spawn_cycle(engine: &Arc<SyncEngine>) -> tokio::task::JoinHandle<Result<SyncReport>> {
        let engine = Arc::clone(engine);
        tokio::spawn(async move { engine.run_cycle().await })
    }

    #[tokio::test]
    async fn reads_during_reconcile_are_kept() {
        let (engine, local, _remote, r) = slow_conflict().await;
        let cycle = spawn_cycle(&engine);

        tokio::time::sleep(Duration::from_millis(20)).await;
        for _ in 0..3 {
            local
                .record_access(vec![r.id.clone()], Some("ana".into()), Utc::now())
                .await
                .unwrap();
        }
        assert_eq!(cycle.await.unwrap().unwrap().reconciled, 1);

        let mine = local.get_by_id(&r.id).await.unwrap().unwrap();
        assert_eq!(mine.access_count, 4);
        assert_eq!(mine.content, "v2 from another node");
        assert!(mine.metadata.accessed_by.contains("ana"));
    }

    #[tokio::test]
    async fn delete_during_reconcile_stays_deleted() {
        let (engine, local, remote, r) = slow_conflict().await;
        let cycle = spawn_cycle(&engine);

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(local.delete(&r.id).await.unwrap());
        cycle.await.unwrap().unwrap();
        assert!(local.get_by_id(&r.id).await.unwrap().is_none());

        remote.set_latency(Duration::ZERO);
        engine.run_cycle().await.unwrap();
        assert!(remote.is_empty());
    }

    #[tokio::test]
    async fn compressed_while_queued_pushes_original_embedding() {
        let remote = Arc::new(InMemoryRemoteStore::new());
        remote.set_reachable(false);
        let (engine, local) = engine(Some(remote.clone()), 8);

        let mut embedding = vec![0.01f32; 64];
        embedding[0] = 5.0;
        embedding[7] = -3.0;
        let r = sample_record("alpha", &"stack frame\n".repeat(100), embedding.clone());
        local.put(&r).await.unwrap();
        assert_eq!(engine.run_cycle().await.unwrap().failed, 1);

        local.apply_compression(r.clone(), 0.1, 0.95).await.unwrap();
        let lossy = local.get_by_id(&r.id).await.unwrap().unwrap();
        assert!(lossy.compressed);
        assert_ne!(lossy.embedding, embedding);

        remote.set_reachable(true);
        assert_eq!(engine.run_cycle().await.unwrap().synced, 1);
        let pushed = remote.get_by_id(&r.id).await.unwrap().unwrap();
        assert_eq!(pushed.embedding, embedding);
        assert_eq!(pushed.content, r.content);
    }

    #[tokio::test]
    async fn remote_conflict_is_reconciled() {
        let remote = Arc::new(InMemoryRemoteStore::new());
        let (engine, local) = engine(Some(remote.clone()), 8);

        let mut r = sample_record("alpha", "v1", vec![1.0, 0.0]);
        r.version = 5;
        local.put(&r).await.unwrap();

        let mut theirs = r.clone();
        theirs.content = "v2 from another node".into();
        theirs.version = 9;
        theirs.access_count = 1;
        remote.put(&theirs).await.unwrap();

        let report = engine.run_cycle().await.unwrap();
        assert_eq!(report.reconciled, 1);
        let mine = local.get_by_id(&r.id).await.unwrap().unwrap();
        assert_eq!(mine.content, "v2 from another node");
        assert_eq!(mine.version, 9);
        assert_eq!(mine.sync_state, SyncState::Synced);
    }
}
