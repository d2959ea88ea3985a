//! At-rest encodings applied by the optimizer's compress pass.
//!
//! Content is deflated losslessly. Embeddings keep only their largest-magnitude
//! components: the smallest `K` such that `K >= keep_ratio * N` and the kept components
//! hold at least `min_energy` of the squared L2 norm. Because the reconstruction is an
//! orthogonal projection of the original, `cos(original, decoded) = sqrt(kept_energy)`,
//! so `min_energy = 0.95` bounds the angular error at `cos >= 0.975` for any input
//! distribution.

use anyhow::{bail, Context, Result};
use flate2::read::DeflateDecoder;
use flate2::write::DeflateEncoder;
use flate2::Compression;
use std::io::{Read, Write};

/// Marker stored in `memories.embedding_encoding`.
pub const DENSE: &str = "dense";
pub const TOP_K: &str = "top_k";

pub fn compress_content(content: &str) -> Result<Vec<u8>> {
    let mut encoder = DeflateEncoder::new(Vec::new(), Compression::best());
    encoder
        .write_all(content.as_bytes())
        .context("failed to deflate content")?;
    encoder.finish().context("failed to finish deflate stream")
}

pub fn decompress_content(bytes: &[u8]) -> Result<String> {
    let mut out = String::new();
    DeflateDecoder::new(bytes)
        .read_to_string(&mut out)
        .context("failed to inflate content")?;
    Ok(out)
}

/// Encode an embedding as `[dims: u32][k: u32]([index: u32][value: f32]) * k`.
pub fn encode_top_k(embedding: &[f32], keep_ratio: f32, min_energy: f32) -> Vec<u8> {
    let dims = embedding.len();
    let min_k = ((dims as f32 * keep_ratio.clamp(0.0, 1.0)).ceil() as usize).clamp(1, dims.max(1));

    let mut order: Vec<usize> = (0..dims).collect();
    order.sort_by(|&a, &b| {
        embedding[b]
            .abs()
            .partial_cmp(&embedding[a].abs())
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    let total: f64 = embedding.iter().map(|x| (*x as f64).powi(2)).sum();
    let target = total * min_energy.clamp(0.0, 1.0) as f64;
    let mut kept_energy = 0.0f64;
    let mut kept: Vec<usize> = Vec::new();
    for idx in order {
        if kept.len() >= min_k && kept_energy >= target {
            break;
        }
        kept_energy += (embedding[idx] as f64).powi(2);
        kept.push(idx);
    }
    kept.sort_unstable();

    let mut out = Vec::with_capacity(8 + kept.len() * 8);
    out.extend_from_slice(&(dims as u32).to_le_bytes());
    out.extend_from_slice(&(kept.len() as u32).to_le_bytes());
    for idx in kept {
        out.extend_from_slice(&(idx as u32).to_le_bytes());
        out.extend_from_slice(&embedding[idx].to_le_bytes());
    }
    out
}

/// Pick the smaller of the top-k and dense forms. Returns the encoding marker and bytes.
///
/// Each kept component costs eight bytes against four for a dense one, so flat vectors
/// that need most of their components to reach `min_energy` stay dense.
pub fn encode_for_storage(
    embedding: &[f32],
    keep_ratio: f32,
    min_energy: f32,
) -> (&'static str, Vec<u8>) {
    let sparse = encode_top_k(embedding, keep_ratio, min_energy);
    if sparse.len() >= embedding.len() * 4 {
        (DENSE, super::embedding_to_bytes(embedding))
    } else {
        (TOP_K, sparse)
    }
}

pub fn decode_top_k(bytes: &[u8]) -> Result<Vec<f32>> {
    if bytes.len() < 8 {
        bail!("top-k embedding header truncated");
    }
    let dims = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as usize;
    let k = u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]) as usize;
    let body = &bytes[8..];
    if body.len() != k * 8 {
        bail!("top-k embedding body has {} bytes, expected {}", body.len(), k * 8);
    }

    let mut v = vec![0.0f32; dims];
    for entry in body.chunks_exact(8) {
        let idx = u32::from_le_bytes([entry[0], entry[1], entry[2], entry[3]]) as usize;
        if idx >= dims {
            bail!("top-k index {idx} out of range for {dims} dimensions");
        }
        v[idx] = f32::from_le_bytes([entry[4], entry[5], entry[6], entry[7]]);
    }
    Ok(v)
}

/// Decode a stored embedding according to its encoding marker.
pub fn decode_embedding(encoding: &str, bytes: &[u8]) -> Result<Vec<f32>> {
    match encoding {
        DENSE => Ok(super::bytes_to_embedding(bytes)),
        TOP_K => decode_top_k(bytes),
        other => bail!("unknown embedding encoding: {other}"),
    }
}
