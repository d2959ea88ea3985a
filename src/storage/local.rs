//! SQLite-backed local tier.
//!
//! Wraps the synchronous functions in [`crate::memory`] and [`crate::sync::outbox`]
//! behind an async API. The connection mutex is held only for the duration of one
//! statement or transaction, always on a blocking thread.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::Connection;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use super::{QueryFilter, StorageAdapter};
use crate::db::{self, migrations, HealthReport};
use crate::memory::forget::{delete_memories, DeleteReason};
use crate::memory::patterns::{self, ProjectSettings};
use crate::memory::stats::{self, ProjectStats, StoreStats};
use crate::memory::store::{self, Enqueue, StoredMemory};
use crate::memory::types::{Bridge, Cluster, MemoryRecord, Pattern, ScoredRecord, SyncQueueItem};
use crate::memory::{clusters, maintenance, search};
use crate::sync::outbox::{self, OutboxStats};

#[derive(Clone)]
pub struct LocalStore {
    conn: Arc<Mutex<Connection>>,
    db_path: Option<PathBuf>,
}

impl LocalStore {
    /// Open (or create) the database file.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let conn = db::open_database(path)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            db_path: Some(path.to_path_buf()),
        })
    }

    pub fn in_memory() -> Result<Self> {
        Ok(Self {
            conn: Arc::new(Mutex::new(db::open_memory_database()?)),
            db_path: None,
        })
    }

    pub fn db_path(&self) -> Option<&Path> {
        self.db_path.as_deref()
    }

    /// Run `f` against the connection on a blocking thread.
    async fn with_conn<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
    {
        let db = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut conn = db
                .lock()
                .map_err(|e| anyhow::anyhow!("db lock poisoned: {e}"))?;
            f(&mut conn)
        })
        .await
        .context("db task failed")?
    }

    /// Record the embedding model on first use. Returns the previously stored model
    /// when it differs from `model_id`.
    pub async fn ensure_embedding_model(&self, model_id: &str) -> Result<Option<String>> {
        let model_id = model_id.to_string();
        self.with_conn(move |conn| match migrations::get_embedding_model(conn)? {
            None => {
                migrations::set_embedding_model(conn, &model_id)?;
                Ok(None)
            }
            Some(stored) if stored == model_id => Ok(None),
            Some(stored) => Ok(Some(stored)),
        })
        .await
    }

    /// Write a record that already matches the remote copy; nothing is queued.
    /// Fold a reconciled copy into the local row. See [`store::apply_reconciled`].
    pub async fn apply_reconciled(&self, merged: MemoryRecord, read_version: u64) -> Result<bool> {
        self.with_conn(move |conn| store::apply_reconciled(conn, &merged, read_version))
            .await
    }

    pub async fn load_project(
        &self,
        project_id: &str,
        max_records: usize,
    ) -> Result<(Vec<MemoryRecord>, bool)> {
        let project_id = project_id.to_string();
        self.with_conn(move |conn| search::load_project(conn, &project_id, max_records))
            .await
    }

    pub async fn project_snapshot(&self, project_id: &str) -> Result<Vec<StoredMemory>> {
        let project_id = project_id.to_string();
        self.with_conn(move |conn| search::project_snapshot(conn, &project_id))
            .await
    }

    pub async fn list_projects(&self) -> Result<Vec<String>> {
        self.with_conn(|conn| search::list_projects(conn)).await
    }

    pub async fn record_access(
        &self,
        ids: Vec<String>,
        accessor: Option<String>,
        at: DateTime<Utc>,
    ) -> Result<()> {
        self.with_conn(move |conn| store::record_access(conn, &ids, accessor.as_deref(), at))
            .await
    }

    pub async fn delete_many(&self, ids: Vec<String>, reason: DeleteReason) -> Result<usize> {
        self.with_conn(move |conn| delete_memories(conn, &ids, reason, Enqueue::Yes))
            .await
    }

    pub async fn apply_merge(
        &self,
        representative: MemoryRecord,
        read_version: u64,
        absorbed: Vec<(String, u64)>,
    ) -> Result<bool> {
        self.with_conn(move |conn| {
            maintenance::apply_merge(conn, &representative, read_version, &absorbed)
        })
        .await
    }

    pub async fn apply_compression(
        &self,
        record: MemoryRecord,
        keep_ratio: f32,
        min_energy: f32,
    ) -> Result<i64> {
        self.with_conn(move |conn| {
            maintenance::apply_compression(conn, &record, keep_ratio, min_energy)
        })
        .await
    }

    pub async fn replace_clusters(
        &self,
        project_id: &str,
        new_clusters: Vec<Cluster>,
        bridges: Vec<Bridge>,
    ) -> Result<()> {
        let project_id = project_id.to_string();
        self.with_conn(move |conn| {
            clusters::replace_clusters(conn, &project_id, &new_clusters, &bridges)
        })
        .await
    }

    pub async fn load_clusters(&self, project_id: &str) -> Result<Vec<Cluster>> {
        let project_id = project_id.to_string();
        self.with_conn(move |conn| clusters::load_clusters(conn, &project_id))
            .await
    }

    pub async fn load_bridges(&self, project_id: &str) -> Result<Vec<Bridge>> {
        let project_id = project_id.to_string();
        self.with_conn(move |conn| clusters::load_bridges(conn, &project_id))
            .await
    }

    pub async fn upsert_pattern(&self, pattern: Pattern) -> Result<()> {
        self.with_conn(move |conn| patterns::upsert_pattern(conn, &pattern))
            .await
    }

    pub async fn load_patterns(&self, project_id: &str) -> Result<Vec<Pattern>> {
        let project_id = project_id.to_string();
        self.with_conn(move |conn| patterns::load_patterns(conn, &project_id))
            .await
    }

    pub async fn save_settings(
        &self,
        project_id: &str,
        settings: ProjectSettings,
        default_threshold: f32,
    ) -> Result<()> {
        let project_id = project_id.to_string();
        self.with_conn(move |conn| {
            patterns::save_settings(conn, &project_id, &settings, default_threshold)
        })
        .await
    }

    pub async fn load_settings(&self, project_id: &str) -> Result<Option<ProjectSettings>> {
        let project_id = project_id.to_string();
        self.with_conn(move |conn| patterns::load_settings(conn, &project_id))
            .await
    }

    // ── Outbox ──────────────────────────────────────────────────────────────

    pub async fn claim_due(&self, limit: usize, now: DateTime<Utc>) -> Result<Vec<SyncQueueItem>> {
        self.with_conn(move |conn| outbox::claim_due(conn, limit, now))
            .await
    }

    pub async fn mark_synced(&self, item: SyncQueueItem) -> Result<()> {
        self.with_conn(move |conn| outbox::mark_synced(conn, &item))
            .await
    }

    pub async fn mark_failed(
        &self,
        item: SyncQueueItem,
        error: String,
        next_attempt_at: DateTime<Utc>,
    ) -> Result<()> {
        self.with_conn(move |conn| outbox::mark_failed(conn, &item, &error, next_attempt_at))
            .await
    }

    pub async fn mark_dead_letter(&self, item: SyncQueueItem, error: String) -> Result<()> {
        self.with_conn(move |conn| outbox::mark_dead_letter(conn, &item, &error))
            .await
    }

    pub async fn requeue_in_flight(&self) -> Result<usize> {
        self.with_conn(outbox::requeue_in_flight).await
    }

    pub async fn requeue_dead_letters(&self) -> Result<usize> {
        self.with_conn(outbox::requeue_dead_letters).await
    }

    pub async fn list_dead_letters(&self, limit: usize) -> Result<Vec<SyncQueueItem>> {
        self.with_conn(move |conn| outbox::list_dead_letters(conn, limit))
            .await
    }

    pub async fn outbox_stats(&self) -> Result<OutboxStats> {
        self.with_conn(|conn| outbox::outbox_stats(conn)).await
    }

    pub async fn purge_synced(&self, before: DateTime<Utc>) -> Result<usize> {
        self.with_conn(move |conn| outbox::purge_synced(conn, before))
            .await
    }

    // ── Stats ───────────────────────────────────────────────────────────────

    pub async fn project_footprint(&self, project_id: &str) -> Result<u64> {
        let project_id = project_id.to_string();
        self.with_conn(move |conn| stats::project_footprint(conn, &project_id))
            .await
    }

    pub async fn project_stats(&self, project_id: &str) -> Result<ProjectStats> {
        let project_id = project_id.to_string();
        self.with_conn(move |conn| stats::project_stats(conn, &project_id))
            .await
    }

    pub async fn store_stats(&self) -> Result<StoreStats> {
        let db_path = self.db_path.clone();
        self.with_conn(move |conn| stats::store_stats(conn, db_path.as_deref()))
            .await
    }

    pub async fn health(&self) -> Result<HealthReport> {
        self.with_conn(|conn| db::check_database_health(conn)).await
    }
}

#[async_trait]
impl StorageAdapter for LocalStore {
    fn name(&self) -> &str {
        "local"
    }

    async fn put(&self, record: &MemoryRecord) -> Result<()> {
        let record = record.clone();
        self.with_conn(move |conn| store::put_memory(conn, &record, Enqueue::Yes))
            .await
    }

    async fn get_by_id(&self, id: &str) -> Result<Option<MemoryRecord>> {
        let id = id.to_string();
        self.with_conn(move |conn| store::get_memory(conn, &id)).await
    }

    async fn query(
        &self,
        embedding: &[f32],
        filter: &QueryFilter,
        limit: usize,
    ) -> Result<Vec<ScoredRecord>> {
        let embedding = embedding.to_vec();
        let filter = filter.clone();
        self.with_conn(move |conn| search::query_project(conn, &embedding, &filter, limit))
            .await
    }

    async fn delete(&self, id: &str) -> Result<bool> {
        let removed = self
            .delete_many(vec![id.to_string()], DeleteReason::Requested)
            .await?;
        Ok(removed > 0)
    }
}
