//! In-process remote tier.
//!
//! Used for single-host deployments and in tests, where its reachability switch and
//! artificial latency stand in for a network partition or a slow service.

use anyhow::{bail, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use super::{QueryFilter, StorageAdapter};
use crate::memory::search::rank_candidates;
use crate::memory::types::{MemoryRecord, ScoredRecord};

#[derive(Debug)]
pub struct InMemoryRemoteStore {
    records: Mutex<HashMap<String, MemoryRecord>>,
    reachable: AtomicBool,
    latency_ms: AtomicU64,
}

impl Default for InMemoryRemoteStore {
    fn default() -> Self {
        Self {
            records: Mutex::new(HashMap::new()),
            reachable: AtomicBool::new(true),
            latency_ms: AtomicU64::new(0),
        }
    }
}

impl InMemoryRemoteStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate a partition (`false`) or its recovery (`true`).
    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::SeqCst);
    }

    /// Delay every call by `latency`.
    pub fn set_latency(&self, latency: Duration) {
        self.latency_ms
            .store(latency.as_millis() as u64, Ordering::SeqCst);
    }

    pub fn len(&self) -> usize {
        self.records.lock().map(|r| r.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    async fn gate(&self) -> Result<()> {
        let latency = self.latency_ms.load(Ordering::SeqCst);
        if latency > 0 {
            tokio::time::sleep(Duration::from_millis(latency)).await;
        }
        if !self.reachable.load(Ordering::SeqCst) {
            bail!("remote store unreachable");
        }
        Ok(())
    }
}

#[async_trait]
impl StorageAdapter for InMemoryRemoteStore {
    fn name(&self) -> &str {
        "memory"
    }

    async fn put(&self, record: &MemoryRecord) -> Result<()> {
        self.gate().await?;
        let mut records = self
            .records
            .lock()
            .map_err(|e| anyhow::anyhow!("remote lock poisoned: {e}"))?;
        records.insert(record.id.clone(), record.clone());
        Ok(())
    }

    async fn get_by_id(&self, id: &str) -> Result<Option<MemoryRecord>> {
        self.gate().await?;
        let records = self
            .records
            .lock()
            .map_err(|e| anyhow::anyhow!("remote lock poisoned: {e}"))?;
        Ok(records.get(id).cloned())
    }

    async fn query(
        &self,
        embedding: &[f32],
        filter: &QueryFilter,
        limit: usize,
    ) -> Result<Vec<ScoredRecord>> {
        self.gate().await?;
        let records = self
            .records
            .lock()
            .map_err(|e| anyhow::anyhow!("remote lock poisoned: {e}"))?;
        Ok(rank_candidates(records.values(), embedding, filter, limit))
    }

    async fn delete(&self, id: &str) -> Result<bool> {
        self.gate().await?;
        let mut records = self
            .records
            .lock()
            .map_err(|e| anyhow::anyhow!("remote lock poisoned: {e}"))?;
        Ok(records.remove(id).is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::store::tests::sample_record;

    #[tokio::test]
    async fn partition_fails_calls_until_recovered() {
        let remote = InMemoryRemoteStore::new();
        let r = sample_record("alpha", "remote copy", vec![1.0, 0.0]);

        remote.set_reachable(false);
        assert!(remote.put(&r).await.is_err());
        assert!(remote.is_empty());

        remote.set_reachable(true);
        remote.put(&r).await.unwrap();
        assert_eq!(remote.get_by_id(&r.id).await.unwrap().unwrap().id, r.id);
    }

    #[tokio::test]
    async fn query_is_project_scoped() {
        let remote = InMemoryRemoteStore::new();
        remote.put(&sample_record("alpha", "x", vec![1.0, 0.0])).await.unwrap();
        remote.put(&sample_record("beta", "x", vec![1.0, 0.0])).await.unwrap();

        let hits = remote
            .query(&[1.0, 0.0], &QueryFilter::for_project("beta"), 10)
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].record.project_id, "beta");
    }
}
