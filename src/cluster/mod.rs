//! Semantic clustering of a project's memories into topics and bridges.

pub mod density;
pub mod label;

use anyhow::{Context, Result};
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::config::ClusteringConfig;
use crate::monitor::DegradationMode;
use crate::storage::LocalStore;

#[derive(Debug, Clone, Default, Serialize)]
pub struct ClusterReport {
    pub project_id: String,
    pub clusters: usize,
    pub bridges: usize,
    pub clustered_records: usize,
    pub total_records: usize,
    pub skipped: bool,
    pub cancelled: bool,
}

pub struct SemanticClusterer {
    store: LocalStore,
    config: ClusteringConfig,
}

impl SemanticClusterer {
    pub fn new(store: LocalStore, config: ClusteringConfig) -> Self {
        Self { store, config }
    }

    /// Recompute and replace the project's clusters. Does nothing while degraded.
    pub async fn cluster_project(
        &self,
        project_id: &str,
        mode: DegradationMode,
        cancel: &CancellationToken,
    ) -> Result<ClusterReport> {
        let mut report = ClusterReport {
            project_id: project_id.to_string(),
            ..Default::default()
        };
        if mode.clustering_disabled {
            report.skipped = true;
            tracing::info!(project = project_id, "degraded: clustering skipped");
            return Ok(report);
        }

        let records: Vec<_> = self
            .store
            .project_snapshot(project_id)
            .await?
            .into_iter()
            .map(|s| s.record)
            .collect();
        let existing = self.store.load_clusters(project_id).await?;
        report.total_records = records.len();

        let config = self.config.clone();
        let project = project_id.to_string();
        let result = tokio::task::spawn_blocking(move || {
            density::recluster(&project, &records, &existing, &config)
        })
        .await
        .context("clustering task failed")?;

        if cancel.is_cancelled() {
            report.cancelled = true;
            return Ok(report);
        }

        report.clusters = result.clusters.len();
        report.bridges = result.bridges.len();
        report.clustered_records = result.clusters.iter().map(|c| c.member_ids.len()).sum();
        self.store
            .replace_clusters(project_id, result.clusters, result.bridges)
            .await?;

        tracing::info!(
            project = project_id,
            clusters = report.clusters,
            bridges = report.bridges,
            clustered = report.clustered_records,
            total = report.total_records,
            "clustering complete"
        );
        Ok(report)
    }
}
