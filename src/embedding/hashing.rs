//! Feature-hashing embedding provider.
//!
//! Tokens (lowercased alphanumeric words) and adjacent-token bigrams are hashed with
//! FNV-1a into a fixed number of buckets with a sign bit, then the vector is
//! L2-normalized. Identical text always yields identical vectors and overlapping
//! vocabulary yields high cosine similarity, which is all the engine needs from a
//! default model.

use anyhow::{bail, Result};

use super::EmbeddingProvider;

const FNV_OFFSET: u64 = 0xcbf29ce484222325;
const FNV_PRIME: u64 = 0x100000001b3;
const BIGRAM_WEIGHT: f32 = 0.5;

pub struct HashingEmbeddingProvider {
    dimensions: usize,
}

impl HashingEmbeddingProvider {
    pub fn new(dimensions: usize) -> Result<Self> {
        if dimensions == 0 {
            bail!("embedding dimensions must be positive");
        }
        Ok(Self { dimensions })
    }

    fn add_feature(&self, v: &mut [f32], feature: &str, weight: f32) {
        let hash = fnv1a(feature.as_bytes());
        let bucket = (hash % self.dimensions as u64) as usize;
        let sign = if (hash >> 63) & 1 == 0 { 1.0 } else { -1.0 };
        v[bucket] += sign * weight;
    }
}

impl EmbeddingProvider for HashingEmbeddingProvider {
    fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let tokens = tokenize(text);
        if tokens.is_empty() {
            bail!("text has no embeddable tokens");
        }

        let mut v = vec![0.0f32; self.dimensions];
        for token in &tokens {
            self.add_feature(&mut v, token, 1.0);
        }
        for pair in tokens.windows(2) {
            self.add_feature(&mut v, &format!("{} {}", pair[0], pair[1]), BIGRAM_WEIGHT);
        }

        let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm == 0.0 {
            // Every feature cancelled out; fall back to the first token's bucket.
            self.add_feature(&mut v, &tokens[0], 1.0);
            return Ok(crate::memory::normalized(v));
        }
        v.iter_mut().for_each(|x| *x /= norm);
        Ok(v)
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    fn model_id(&self) -> &str {
        "feature-hashing-v1"
    }
}

/// Lowercased alphanumeric tokens (underscores kept so identifiers stay whole).
pub fn tokenize(text: &str) -> Vec<String> {
    text.split(|c: char| !(c.is_alphanumeric() || c == '_'))
        .filter(|t| !t.is_empty())
        .map(|t| t.to_lowercase())
        .collect()
}

fn fnv1a(bytes: &[u8]) -> u64 {
    bytes.iter().fold(FNV_OFFSET, |hash, b| {
        (hash ^ *b as u64).wrapping_mul(FNV_PRIME)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::cosine_similarity;

    #[test]
    fn identical_text_identical_vectors() {
        let p = HashingEmbeddingProvider::new(384).unwrap();
        assert_eq!(
            p.embed("fix the database migration").unwrap(),
            p.embed("fix the database migration").unwrap()
        );
    }

    #[test]
    fn vectors_are_unit_length() {
        let p = HashingEmbeddingProvider::new(128).unwrap();
        let v = p.embed("Rust borrow checker error E0502").unwrap();
        let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-4);
    }

    #[test]
    fn overlapping_text_is_more_similar() {
        let p = HashingEmbeddingProvider::new(384).unwrap();
        let a = p.embed("deploy the api service to staging").unwrap();
        let b = p.embed("deploy the api service to production").unwrap();
        let c = p.embed("bake sourdough bread overnight").unwrap();
        assert!(cosine_similarity(&a, &b) > cosine_similarity(&a, &c));
    }

    #[test]
    fn empty_text_fails() {
        let p = HashingEmbeddingProvider::new(384).unwrap();
        assert!(p.embed("   ...  ").is_err());
    }

    #[test]
    fn tokenize_keeps_identifiers() {
        assert_eq!(
            tokenize("call load_config() now!"),
            vec!["call", "load_config", "now"]
        );
    }
}
