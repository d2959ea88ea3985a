//! Text-to-vector embedding pipeline.
//!
//! The embedding model is an external capability: anything implementing
//! [`EmbeddingProvider`] can back the engine. A deterministic feature-hashing provider
//! ships as the default so the engine runs without a model download. The provider is
//! created via [`create_provider`] from configuration.

pub mod hashing;

use anyhow::Result;

/// Default number of dimensions in embedding vectors.
pub const EMBEDDING_DIM: usize = 384;

/// Trait for embedding text into vectors.
///
/// Implementations produce vectors of exactly [`dimensions`](Self::dimensions) entries.
/// All methods are synchronous; callers in async contexts should use
/// `tokio::task::spawn_blocking`.
pub trait EmbeddingProvider: Send + Sync {
    /// Embed a single text string into a vector.
    fn embed(&self, text: &str) -> Result<Vec<f32>>;

    /// Embed a batch of text strings. Implementations may override for batched inference.
    fn embed_batch(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>> {
        texts.iter().map(|t| self.embed(t)).collect()
    }

    /// Return the number of dimensions this provider produces.
    fn dimensions(&self) -> usize {
        EMBEDDING_DIM
    }

    /// Identifier stored in `schema_meta` to detect model changes.
    fn model_id(&self) -> &str;
}

/// Create an embedding provider from config.
///
/// Only `"hashing"` is built in; other providers are injected by the host application.
pub fn create_provider(
    config: &crate::config::EmbeddingConfig,
) -> Result<Box<dyn EmbeddingProvider>> {
    match config.provider.as_str() {
        "hashing" => {
            let provider = hashing::HashingEmbeddingProvider::new(config.dimensions)?;
            Ok(Box::new(provider))
        }
        other => anyhow::bail!("unknown embedding provider: {other}. Supported: hashing"),
    }
}
