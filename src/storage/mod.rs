//! Uniform storage adapter over the local and remote tiers.
//!
//! [`LocalStore`] is the SQLite cache every write lands in first. Remote stores are
//! any [`StorageAdapter`]; [`create_remote`] picks one from config.

pub mod http;
pub mod local;
pub mod remote;

use anyhow::{bail, Result};
use async_trait::async_trait;
use std::sync::Arc;

use crate::config::RemoteConfig;
pub use crate::memory::search::QueryFilter;
use crate::memory::types::{MemoryRecord, ScoredRecord};

pub use http::HttpRemoteStore;
pub use local::LocalStore;
pub use remote::InMemoryRemoteStore;

/// Storage trait shared by both tiers.
#[async_trait]
pub trait StorageAdapter: Send + Sync {
    /// Short name used in logs.
    fn name(&self) -> &str;

    /// Insert or replace a record.
    async fn put(&self, record: &MemoryRecord) -> Result<()>;

    async fn get_by_id(&self, id: &str) -> Result<Option<MemoryRecord>>;

    /// Records of `filter.project_id` ranked by cosine similarity, best first.
    async fn query(
        &self,
        embedding: &[f32],
        filter: &QueryFilter,
        limit: usize,
    ) -> Result<Vec<ScoredRecord>>;

    /// Remove a record. Returns whether it existed.
    async fn delete(&self, id: &str) -> Result<bool>;
}

/// Shared remote store reference
pub type SharedStore = Arc<dyn StorageAdapter>;

/// Build the configured remote tier. `none` disables remote persistence entirely.
pub fn create_remote(config: &RemoteConfig) -> Result<Option<SharedStore>> {
    match config.provider.as_str() {
        "none" => Ok(None),
        "memory" => Ok(Some(Arc::new(InMemoryRemoteStore::new()))),
        "http" => Ok(Some(Arc::new(HttpRemoteStore::new(config)?))),
        other => bail!("unknown remote provider: {other} (expected none, memory, or http)"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn factory_selects_provider() {
        let mut config = RemoteConfig::default();
        assert!(create_remote(&config).unwrap().is_none());

        config.provider = "memory".into();
        assert_eq!(create_remote(&config).unwrap().unwrap().name(), "memory");

        config.provider = "http".into();
        config.url = "http://127.0.0.1:9/strata".into();
        assert_eq!(create_remote(&config).unwrap().unwrap().name(), "http");

        config.provider = "s3".into();
        assert!(create_remote(&config).is_err());
    }
}
