//! Compression candidate selection.

use chrono::{DateTime, Duration, Utc};

use crate::config::OptimizerConfig;
use crate::memory::store::StoredMemory;
use crate::memory::types::MemoryRecord;

/// Uncompressed records old enough and large enough to be worth compressing, largest first.
pub fn candidates(snapshot: &[StoredMemory], config: &OptimizerConfig, now: DateTime<Utc>) -> Vec<MemoryRecord> {
    let cutoff = now - Duration::days(config.compress_age_days);
    let mut picked: Vec<&StoredMemory> = snapshot
        .iter()
        .filter(|s| {
            !s.record.compressed
                && s.record.created_at <= cutoff
                && s.record.content.len() >= config.compress_min_bytes
        })
        .collect();
    picked.sort_by(|a, b| b.stored_bytes.cmp(&a.stored_bytes));
    picked.into_iter().map(|s| s.record.clone()).collect()
}
