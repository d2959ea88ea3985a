//! Retention scoring and prune planning.

use chrono::{DateTime, Utc};
use std::collections::HashSet;

use crate::config::OptimizerConfig;
use crate::embedding::hashing::tokenize;
use crate::memory::store::StoredMemory;
use crate::memory::types::MemoryRecord;

/// Access count at which the frequency signal saturates.
const FREQUENCY_SATURATION: f64 = 100.0;
/// Content length at which the length half of the complexity signal saturates.
const COMPLEXITY_LENGTH: f64 = 2_000.0;

/// Weighted retention score in `[0, 1]`. Higher means more worth keeping.
///
/// Records flagged `important` score at least `important_floor`, which by default sits
/// above `protect_threshold`, so pruning never picks them.
pub fn retention_score(record: &MemoryRecord, now: DateTime<Utc>, config: &OptimizerConfig) -> f64 {
    let age_days = (now - record.last_accessed_at).num_seconds().max(0) as f64 / 86_400.0;
    let recency = (-age_days / config.recency_half_life_days.max(f64::EPSILON)).exp();

    let frequency = ((1.0 + record.access_count as f64).ln() / (1.0 + FREQUENCY_SATURATION).ln())
        .min(1.0);
    let importance = if record.metadata.important { 1.0 } else { 0.0 };
    let complexity = content_complexity(&record.content);
    let type_weight = record.interaction_type.retention_weight();

    let weights = [
        (config.weight_recency, recency),
        (config.weight_frequency, frequency),
        (config.weight_importance, importance),
        (config.weight_complexity, complexity),
        (config.weight_type, type_weight),
    ];
    let total: f64 = weights.iter().map(|(w, _)| w).sum();
    let blended = if total > 0.0 {
        weights.iter().map(|(w, v)| w * v).sum::<f64>() / total
    } else {
        0.0
    };
    if record.metadata.important {
        blended.max(config.important_floor)
    } else {
        blended
    }
}

/// Half length, half vocabulary richness.
fn content_complexity(content: &str) -> f64 {
    let length = (content.len() as f64 / COMPLEXITY_LENGTH).min(1.0);
    let tokens = tokenize(content);
    if tokens.is_empty() {
        return 0.5 * length;
    }
    let distinct = tokens.iter().collect::<HashSet<_>>().len() as f64;
    0.5 * length + 0.5 * (distinct / tokens.len() as f64)
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct PrunePlan {
    /// Lowest-scoring first.
    pub ids: Vec<String>,
    pub bytes_freed: u64,
    /// Whether dropping `ids` brings the project under the ceiling.
    pub reaches_budget: bool,
}

/// Pick the lowest-scoring records whose removal brings `footprint` under `ceiling`.
///
/// Pinned records and records scoring at or above `protect_threshold` are never picked,
/// and at least `min_retained` records always remain.
pub fn plan_prune(
    snapshot: &[StoredMemory],
    footprint: u64,
    ceiling: u64,
    config: &OptimizerConfig,
    now: DateTime<Utc>,
) -> PrunePlan {
    if footprint <= ceiling {
        return PrunePlan {
            reaches_budget: true,
            ..Default::default()
        };
    }

    let mut candidates: Vec<(f64, &StoredMemory)> = snapshot
        .iter()
        .filter(|s| !s.record.metadata.pinned)
        .map(|s| (retention_score(&s.record, now, config), s))
        .filter(|(score, _)| *score < config.protect_threshold)
        .collect();
    candidates.sort_by(|a, b| {
        a.0.partial_cmp(&b.0)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.1.record.last_accessed_at.cmp(&b.1.record.last_accessed_at))
    });

    let removable = snapshot.len().saturating_sub(config.min_retained);
    let mut plan = PrunePlan::default();
    let mut remaining = footprint;
    for (_, stored) in candidates.into_iter().take(removable) {
        if remaining <= ceiling {
            break;
        }
        plan.ids.push(stored.record.id.clone());
        plan.bytes_freed += stored.stored_bytes;
        remaining = remaining.saturating_sub(stored.stored_bytes);
    }
    plan.reaches_budget = remaining <= ceiling;
    plan
}
