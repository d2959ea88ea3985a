//! Workflow pattern learning.
//!
//! A pattern is keyed by the SHA-256 of its action sequence, so the same tool chain
//! observed in different situations accumulates into one entry whose trigger embedding
//! drifts toward the mean of the situations that produced it.

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};

use crate::memory::normalized;
use crate::memory::types::Pattern;

/// Occurrences required before a pattern may be auto-applied.
pub const AUTO_APPLY_MIN_OCCURRENCES: u32 = 3;
/// Success rate required before a pattern may be auto-applied.
pub const AUTO_APPLY_MIN_SUCCESS: f32 = 0.9;

/// Stable identity of an action sequence.
pub fn action_hash(actions: &[String]) -> String {
    let mut hasher = Sha256::new();
    for action in actions {
        hasher.update(action.as_bytes());
        // Unit separator, so ["ab", "c"] and ["a", "bc"] hash differently.
        hasher.update([0x1f]);
    }
    format!("{:x}", hasher.finalize())
}

/// Fold one observation into a pattern, creating it when `previous` is `None`.
///
/// `outcome` is clamped to `[0, 1]` and averaged into the running success rate.
pub fn observe(
    previous: Option<&Pattern>,
    project_id: &str,
    trigger: &[f32],
    actions: &[String],
    outcome: f32,
    now: DateTime<Utc>,
) -> Pattern {
    let outcome = outcome.clamp(0.0, 1.0);
    let mut pattern = match previous {
        Some(p) => {
            let n = p.occurrence_count as f32;
            let trigger_embedding = if p.trigger_embedding.len() == trigger.len() {
                normalized(
                    p.trigger_embedding
                        .iter()
                        .zip(trigger)
                        .map(|(old, new)| (old * n + new) / (n + 1.0))
                        .collect(),
                )
            } else {
                trigger.to_vec()
            };
            Pattern {
                trigger_embedding,
                occurrence_count: p.occurrence_count + 1,
                success_rate: (p.success_rate * n + outcome) / (n + 1.0),
                last_used: now,
                ..p.clone()
            }
        }
        None => Pattern {
            hash: action_hash(actions),
            project_id: project_id.to_string(),
            trigger_embedding: normalized(trigger.to_vec()),
            action_sequence: actions.to_vec(),
            occurrence_count: 1,
            success_rate: outcome,
            last_used: now,
            auto_apply: false,
        },
    };
    pattern.auto_apply = pattern.occurrence_count >= AUTO_APPLY_MIN_OCCURRENCES
        && pattern.success_rate >= AUTO_APPLY_MIN_SUCCESS;
    pattern
}
