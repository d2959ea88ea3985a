//! Per-project footprint control: prune, merge, compress.
//!
//! Each pass reads a fresh snapshot of the project, plans against that copy, and
//! applies its changes one batch (or one merge group) per transaction. Cancellation is
//! checked between batches, so an interrupted run leaves every row either untouched or
//! fully rewritten.

pub mod compress;
pub mod merge;
pub mod prune;

use anyhow::Result;
use chrono::Utc;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;

use crate::clock::HybridClock;
use crate::config::OptimizerConfig;
use crate::error::MemoryError;
use crate::memory::forget::DeleteReason;
use crate::monitor::{DegradationMode, PerformanceMonitor};
use crate::storage::LocalStore;

#[derive(Debug, Clone, Default, Serialize)]
pub struct OptimizationReport {
    pub project_id: String,
    pub footprint_before: u64,
    pub footprint_after: u64,
    /// Ceiling in force for this run (base, or a previously raised one).
    pub ceiling: u64,
    pub pruned: usize,
    /// Records absorbed into representatives.
    pub merged: usize,
    pub compressed: usize,
    pub bytes_saved: u64,
    pub merge_skipped: bool,
    pub budget_exceeded: bool,
    pub cancelled: bool,
}

pub struct MemoryOptimizer {
    store: LocalStore,
    config: OptimizerConfig,
    clock: Arc<HybridClock>,
    monitor: Arc<PerformanceMonitor>,
    /// Temporarily raised ceilings, per project.
    raised: Mutex<HashMap<String, u64>>,
}

impl MemoryOptimizer {
    pub fn new(
        store: LocalStore,
        config: OptimizerConfig,
        clock: Arc<HybridClock>,
        monitor: Arc<PerformanceMonitor>,
    ) -> Self {
        Self {
            store,
            config,
            clock,
            monitor,
            raised: Mutex::new(HashMap::new()),
        }
    }

    /// Ceiling currently enforced for `project_id`.
    pub fn effective_ceiling(&self, project_id: &str) -> u64 {
        self.raised
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(project_id)
            .copied()
            .unwrap_or(self.config.max_project_bytes)
    }

    fn set_raised(&self, project_id: &str, ceiling: Option<u64>) {
        let mut raised = self.raised.lock().unwrap_or_else(|e| e.into_inner());
        match ceiling {
            Some(c) => {
                raised.insert(project_id.to_string(), c);
            }
            None => {
                raised.remove(project_id);
            }
        }
    }

    /// Run all three passes over one project.
    pub async fn optimize_project(
        &self,
        project_id: &str,
        mode: DegradationMode,
        cancel: &CancellationToken,
    ) -> Result<OptimizationReport> {
        let ceiling = self.effective_ceiling(project_id);
        let mut report = OptimizationReport {
            project_id: project_id.to_string(),
            footprint_before: self.store.project_footprint(project_id).await?,
            ceiling,
            ..Default::default()
        };

        self.prune(project_id, report.footprint_before, ceiling, cancel, &mut report)
            .await?;
        if !report.cancelled {
            if mode.merge_disabled {
                report.merge_skipped = true;
                tracing::info!(project = project_id, "degraded: merge pass skipped");
            } else {
                self.merge(project_id, cancel, &mut report).await?;
            }
        }
        if !report.cancelled {
            self.compress(project_id, cancel, &mut report).await?;
        }

        report.footprint_after = self.store.project_footprint(project_id).await?;
        report.bytes_saved = report.footprint_before.saturating_sub(report.footprint_after);

        if report.cancelled {
            tracing::info!(project = project_id, "optimization cancelled between batches");
            return Ok(report);
        }
        self.settle_budget(&mut report);

        tracing::info!(
            project = project_id,
            before = report.footprint_before,
            after = report.footprint_after,
            pruned = report.pruned,
            merged = report.merged,
            compressed = report.compressed,
            "optimization complete"
        );
        Ok(report)
    }

    async fn prune(
        &self,
        project_id: &str,
        footprint: u64,
        ceiling: u64,
        cancel: &CancellationToken,
        report: &mut OptimizationReport,
    ) -> Result<()> {
        if footprint <= ceiling {
            return Ok(());
        }
        let snapshot = self.store.project_snapshot(project_id).await?;
        let plan = prune::plan_prune(&snapshot, footprint, ceiling, &self.config, Utc::now());
        tracing::debug!(
            project = project_id,
            candidates = plan.ids.len(),
            reaches_budget = plan.reaches_budget,
            "prune planned"
        );

        for batch in plan.ids.chunks(self.config.batch_size.max(1)) {
            if cancel.is_cancelled() {
                report.cancelled = true;
                break;
            }
            report.pruned += self
                .store
                .delete_many(batch.to_vec(), DeleteReason::Pruned)
                .await?;
        }
        Ok(())
    }

    async fn merge(
        &self,
        project_id: &str,
        cancel: &CancellationToken,
        report: &mut OptimizationReport,
    ) -> Result<()> {
        let snapshot = self.store.project_snapshot(project_id).await?;
        let records: Vec<_> = snapshot.into_iter().map(|s| s.record).collect();
        let groups = merge::find_groups(&records, self.config.merge_threshold);

        for group in groups {
            if cancel.is_cancelled() {
                report.cancelled = true;
                break;
            }
            let representative = merge::build_representative(&group, self.clock.now());
            let absorbed = group.absorbed_versions();
            let count = absorbed.len();
            let applied = self
                .store
                .apply_merge(representative, group.representative.version, absorbed)
                .await?;
            if applied {
                report.merged += count;
            } else {
                tracing::debug!(
                    project = project_id,
                    representative = %group.representative.id,
                    "merge group changed since snapshot, skipped"
                );
            }
        }
        Ok(())
    }

    async fn compress(
        &self,
        project_id: &str,
        cancel: &CancellationToken,
        report: &mut OptimizationReport,
    ) -> Result<()> {
        let snapshot = self.store.project_snapshot(project_id).await?;
        for record in compress::candidates(&snapshot, &self.config, Utc::now()) {
            if cancel.is_cancelled() {
                report.cancelled = true;
                break;
            }
            self.store
                .apply_compression(
                    record,
                    self.config.embedding_keep_ratio,
                    self.config.embedding_min_energy,
                )
                .await?;
            report.compressed += 1;
        }
        Ok(())
    }

    /// Raise the ceiling when every pass together could not reach it; drop a raise once
    /// the project fits under the base ceiling again.
    fn settle_budget(&self, report: &mut OptimizationReport) {
        let project_id = report.project_id.as_str();
        let base = self.config.max_project_bytes;

        if report.footprint_after <= base {
            if report.ceiling > base {
                tracing::info!(project = project_id, "footprint back under base ceiling");
            }
            self.set_raised(project_id, None);
            return;
        }
        if report.footprint_after <= report.ceiling {
            return;
        }

        report.budget_exceeded = true;
        let err = MemoryError::BudgetExceeded {
            project_id: project_id.to_string(),
            footprint_bytes: report.footprint_after,
            ceiling_bytes: report.ceiling,
        };
        let raised = (report.footprint_after as f64 * self.config.budget_raise_factor).ceil() as u64;
        tracing::warn!(project = project_id, raised_to = raised, "{err}");
        self.monitor
            .record_budget_exceeded(project_id, report.footprint_after, report.ceiling);
        self.set_raised(project_id, Some(raised));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MonitorConfig;
    use crate::memory::store::tests::sample_record;
    use crate::storage::StorageAdapter;

    fn optimizer(store: &LocalStore, config: OptimizerConfig) -> MemoryOptimizer {
        MemoryOptimizer::new(
            store.clone(),
            config,
            Arc::new(HybridClock::new()),
            Arc::new(PerformanceMonitor::new(MonitorConfig::default())),
        )
    }

    #[tokio::test]
    async fn duplicates_collapse_with_summed_access() {
        let store = LocalStore::in_memory().unwrap();
        let a = sample_record("alpha", "always run clippy", vec![1.0, 0.0]);
        let b = sample_record("alpha", "always run clippy", vec![1.0, 0.0]);
        store.put(&a).await.unwrap();
        store.put(&b).await.unwrap();

        let opt = optimizer(&store, OptimizerConfig::default());
        let report = opt
            .optimize_project("alpha", DegradationMode::normal(), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(report.merged, 1);

        let (left, _) = store.load_project("alpha", 10).await.unwrap();
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].access_count, 2);
        assert_eq!(left[0].metadata.merged_from.len(), 1);
    }

    #[tokio::test]
    async fn degradation_skips_merge() {
        let store = LocalStore::in_memory().unwrap();
        store.put(&sample_record("alpha", "dup", vec![1.0])).await.unwrap();
        store.put(&sample_record("alpha", "dup", vec![1.0])).await.unwrap();

        let mut mode = DegradationMode::normal();
        mode.merge_disabled = true;
        let report = optimizer(&store, OptimizerConfig::default())
            .optimize_project("alpha", mode, &CancellationToken::new())
            .await
            .unwrap();
        assert!(report.merge_skipped);
        assert_eq!(store.load_project("alpha", 10).await.unwrap().0.len(), 2);
    }

    #[tokio::test]
    async fn impossible_budget_raises_ceiling_then_recovers() {
        let store = LocalStore::in_memory().unwrap();
        let mut pinned = sample_record("alpha", "pinned forever", vec![1.0]);
        pinned.metadata.pinned = true;
        store.put(&pinned).await.unwrap();

        let config = OptimizerConfig {
            max_project_bytes: 1,
            min_retained: 0,
            ..Default::default()
        };
        let opt = optimizer(&store, config);
        let report = opt
            .optimize_project("alpha", DegradationMode::normal(), &CancellationToken::new())
            .await
            .unwrap();
        assert!(report.budget_exceeded);
        assert_eq!(report.pruned, 0);
        assert!(opt.effective_ceiling("alpha") > report.footprint_after);
        assert!(!opt.monitor.snapshot().recent_alerts.is_empty());

        // Second run fits under the raised ceiling: no new overrun.
        let again = opt
            .optimize_project("alpha", DegradationMode::normal(), &CancellationToken::new())
            .await
            .unwrap();
        assert!(!again.budget_exceeded);

        store.delete(&pinned.id).await.unwrap();
        opt.optimize_project("alpha", DegradationMode::normal(), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(opt.effective_ceiling("alpha"), 1);
    }

    #[tokio::test]
    async fn cancelled_run_changes_nothing() {
        let store = LocalStore::in_memory().unwrap();
        store.put(&sample_record("alpha", "dup", vec![1.0])).await.unwrap();
        store.put(&sample_record("alpha", "dup", vec![1.0])).await.unwrap();

        let cancel = CancellationToken::new();
        cancel.cancel();
        let report = optimizer(&store, OptimizerConfig::default())
            .optimize_project("alpha", DegradationMode::normal(), &cancel)
            .await
            .unwrap();
        assert!(report.cancelled);
        assert_eq!(store.load_project("alpha", 10).await.unwrap().0.len(), 2);
    }
}
