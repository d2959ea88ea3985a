//! Near-duplicate detection and representative construction.

use std::collections::HashSet;

use crate::memory::types::MemoryRecord;
use crate::memory::{cosine_similarity, mean_vector};

/// Separator placed between distinct contents folded into one representative.
pub const CONTENT_SEPARATOR: &str = "\n\n---\n\n";

/// One representative and the records it absorbs.
#[derive(Debug, Clone)]
pub struct MergeGroup {
    pub representative: MemoryRecord,
    pub absorbed: Vec<MemoryRecord>,
}

impl MergeGroup {
    /// Absorbed ids with the version each had when the group was planned.
    pub fn absorbed_versions(&self) -> Vec<(String, u64)> {
        self.absorbed.iter().map(|r| (r.id.clone(), r.version)).collect()
    }
}

fn is_duplicate(a: &MemoryRecord, b: &MemoryRecord, threshold: f32) -> bool {
    a.interaction_type == b.interaction_type
        && (a.content == b.content || cosine_similarity(&a.embedding, &b.embedding) >= threshold)
}

/// Group near-duplicates around the most-accessed record of each group.
///
/// Records are visited most-accessed first; each unassigned record collects every
/// remaining duplicate of itself. Groups of one are not returned.
pub fn find_groups(records: &[MemoryRecord], threshold: f32) -> Vec<MergeGroup> {
    let mut order: Vec<&MemoryRecord> = records.iter().collect();
    order.sort_by(|a, b| {
        b.access_count
            .cmp(&a.access_count)
            .then_with(|| b.last_accessed_at.cmp(&a.last_accessed_at))
            .then_with(|| a.id.cmp(&b.id))
    });

    let mut assigned: HashSet<&str> = HashSet::new();
    let mut groups = Vec::new();
    for (i, &rep) in order.iter().enumerate() {
        if assigned.contains(rep.id.as_str()) {
            continue;
        }
        let absorbed: Vec<&MemoryRecord> = order[i + 1..]
            .iter()
            .copied()
            .filter(|r| !assigned.contains(r.id.as_str()) && is_duplicate(rep, r, threshold))
            .collect();
        if absorbed.is_empty() {
            continue;
        }
        assigned.insert(rep.id.as_str());
        assigned.extend(absorbed.iter().map(|r| r.id.as_str()));
        groups.push(MergeGroup {
            representative: rep.clone(),
            absorbed: absorbed.into_iter().cloned().collect(),
        });
    }
    groups
}

fn union_into(target: &mut Vec<String>, extra: &[String]) {
    for item in extra {
        if !target.contains(item) {
            target.push(item.clone());
        }
    }
}

/// Fold a group into its representative, stamped with `version`.
///
/// Access counts are summed, importance is OR-ed, the embedding is averaged, and the
/// absorbed ids are recorded in `merged_from` so nothing that was stored is forgotten.
pub fn build_representative(group: &MergeGroup, version: u64) -> MemoryRecord {
    let mut rep = group.representative.clone();

    let embeddings: Vec<&[f32]> = std::iter::once(rep.embedding.as_slice())
        .chain(
            group
                .absorbed
                .iter()
                .map(|r| r.embedding.as_slice())
                .filter(|e| e.len() == group.representative.embedding.len()),
        )
        .collect();
    let averaged = mean_vector(&embeddings);

    for other in &group.absorbed {
        rep.access_count = rep.access_count.saturating_add(other.access_count);
        rep.last_accessed_at = rep.last_accessed_at.max(other.last_accessed_at);
        rep.created_at = rep.created_at.min(other.created_at);
        rep.success_score = rep.success_score.max(other.success_score);

        let meta = &mut rep.metadata;
        meta.important |= other.metadata.important;
        meta.pinned |= other.metadata.pinned;
        meta.shared |= other.metadata.shared;
        meta.accessed_by
            .extend(other.metadata.accessed_by.iter().cloned());
        union_into(&mut meta.merged_from, std::slice::from_ref(&other.id));
        union_into(&mut meta.merged_from, &other.metadata.merged_from);

        union_into(&mut rep.file_paths, &other.file_paths);
        union_into(&mut rep.tool_chain, &other.tool_chain);

        if !rep.content.contains(other.content.as_str()) {
            rep.content.push_str(CONTENT_SEPARATOR);
            rep.content.push_str(&other.content);
        }
    }

    rep.embedding = averaged;
    rep.compressed = false;
    rep.version = version;
    rep
}
