#![allow(dead_code)]

use anyhow::{bail, Result};
use std::sync::Arc;
use strata::embedding::hashing::HashingEmbeddingProvider;
use strata::embedding::EmbeddingProvider;
use strata::storage::{InMemoryRemoteStore, LocalStore, SharedStore};
use strata::{MemoryEngine, StrataConfig};

/// Config tuned for fast tests: tiny backoff, short remote timeout.
pub fn test_config() -> StrataConfig {
    let mut config = StrataConfig::default();
    config.embedding.dimensions = 256;
    config.sync.backoff_base_ms = 1;
    config.sync.backoff_max_ms = 5;
    config.sync.max_attempts = 3;
    config.remote.timeout_ms = 200;
    config.isolation.default_similarity_threshold = 0.05;
    config
}

pub fn hashing() -> Arc<dyn EmbeddingProvider> {
    Arc::new(HashingEmbeddingProvider::new(256).unwrap())
}

/// Engine over an in-memory SQLite cache and no remote tier.
pub async fn local_engine() -> MemoryEngine {
    engine_with(test_config(), None).await
}

/// Engine plus a handle to its in-process remote tier.
pub async fn remote_engine() -> (MemoryEngine, Arc<InMemoryRemoteStore>) {
    let remote = Arc::new(InMemoryRemoteStore::new());
    let shared: SharedStore = remote.clone();
    (engine_with(test_config(), Some(shared)).await, remote)
}

pub async fn engine_with(config: StrataConfig, remote: Option<SharedStore>) -> MemoryEngine {
    MemoryEngine::new(config, LocalStore::in_memory().unwrap(), hashing(), remote)
        .await
        .unwrap()
}

/// Embedder that always fails, standing in for an unavailable model.
pub struct FailingEmbedder;

impl EmbeddingProvider for FailingEmbedder {
    fn embed(&self, _text: &str) -> Result<Vec<f32>> {
        bail!("model unavailable")
    }

    fn dimensions(&self) -> usize {
        256
    }

    fn model_id(&self) -> &str {
        "failing"
    }
}

/// Embedder that returns vectors shorter than it advertises.
pub struct ShortEmbedder;

impl EmbeddingProvider for ShortEmbedder {
    fn embed(&self, _text: &str) -> Result<Vec<f32>> {
        Ok(vec![1.0; 8])
    }

    fn dimensions(&self) -> usize {
        256
    }

    fn model_id(&self) -> &str {
        "short"
    }
}

/// A unit vector with a spike at `seed`.
pub fn test_embedding(seed: usize, dims: usize) -> Vec<f32> {
    let mut v = vec![0.0f32; dims];
    v[seed % dims] = 1.0;
    v
}
