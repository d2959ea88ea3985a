//! Field-level reconciliation of a record present in both tiers.

use crate::memory::types::{MemoryRecord, SyncState};

/// Result of reconciling a local and a remote copy.
#[derive(Debug, Clone)]
pub struct Reconciled {
    pub record: MemoryRecord,
    /// The local row must be rewritten to match.
    pub local_changed: bool,
    /// The remote copy must be rewritten to match.
    pub remote_changed: bool,
}

/// Merge two copies of the same record.
///
/// Content-bearing fields come from the copy with the higher hybrid-clock version
/// (local wins ties). Access counters take the max, `created_at` the min, and the
/// accessor and merge-lineage sets are unioned, so no side ever loses history.
pub fn reconcile(local: &MemoryRecord, remote: &MemoryRecord) -> Reconciled {
    let remote_wins = remote.version > local.version;
    let mut merged = if remote_wins {
        remote.clone()
    } else {
        local.clone()
    };

    // A compressed local copy carries a lossy embedding; the remote keeps the original.
    if !remote_wins && local.compressed && remote.version == local.version {
        merged.embedding = remote.embedding.clone();
    }
    merged.compressed = false;

    merged.access_count = local.access_count.max(remote.access_count);
    merged.last_accessed_at = local.last_accessed_at.max(remote.last_accessed_at);
    merged.created_at = local.created_at.min(remote.created_at);
    merged.version = local.version.max(remote.version);

    let loser = if remote_wins { local } else { remote };
    merged
        .metadata
        .accessed_by
        .extend(loser.metadata.accessed_by.iter().cloned());
    for id in &loser.metadata.merged_from {
        if !merged.metadata.merged_from.contains(id) {
            merged.metadata.merged_from.push(id.clone());
        }
    }
    merged.sync_state = SyncState::Synced;

    let local_changed = differs(&merged, local);
    let remote_changed = differs(&merged, remote);
    Reconciled {
        record: merged,
        local_changed,
        remote_changed,
    }
}

/// Compare everything except the sync bookkeeping.
fn differs(merged: &MemoryRecord, other: &MemoryRecord) -> bool {
    merged.content != other.content
        || merged.embedding != other.embedding
        || merged.metadata != other.metadata
        || merged.interaction_type != other.interaction_type
        || merged.tool_chain != other.tool_chain
        || merged.file_paths != other.file_paths
        || merged.success_score != other.success_score
        || merged.created_at != other.created_at
        || merged.last_accessed_at != other.last_accessed_at
        || merged.access_count != other.access_count
        || merged.version != other.version
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::store::tests::sample_record;
    use chrono::Duration;

    #[test]
    fn newer_version_wins_content_but_counters_take_max() {
        let mut local = sample_record("alpha", "old wording", vec![1.0, 0.0]);
        local.version = 10;
        local.access_count = 7;
        local.metadata.accessed_by.insert("ana".into());

        let mut remote = local.clone();
        remote.content = "new wording".into();
        remote.version = 20;
        remote.access_count = 3;
        remote.created_at = local.created_at - Duration::days(1);
        remote.last_accessed_at = local.last_accessed_at - Duration::hours(1);
        remote.metadata.accessed_by.clear();
        remote.metadata.accessed_by.insert("bo".into());

        let r = reconcile(&local, &remote);
        assert_eq!(r.record.content, "new wording");
        assert_eq!(r.record.version, 20);
        assert_eq!(r.record.access_count, 7);
        assert_eq!(r.record.last_accessed_at, local.last_accessed_at);
        assert_eq!(r.record.created_at, remote.created_at);
        assert_eq!(r.record.metadata.accessed_by.len(), 2);
        assert!(r.local_changed);
        assert!(r.remote_changed);
    }

    #[test]
    fn identical_copies_need_no_writes() {
        let local = sample_record("alpha", "same", vec![1.0, 0.0]);
        let r = reconcile(&local, &local.clone());
        assert!(!r.local_changed);
        assert!(!r.remote_changed);
    }

    #[test]
    fn tie_keeps_local_content() {
        let local = sample_record("alpha", "local", vec![1.0, 0.0]);
        let mut remote = local.clone();
        remote.content = "remote".into();
        let r = reconcile(&local, &remote);
        assert_eq!(r.record.content, "local");
        assert!(!r.local_changed);
        assert!(r.remote_changed);
    }

    #[test]
    fn compressed_local_recovers_remote_embedding() {
        let mut local = sample_record("alpha", "x", vec![1.0, 0.0, 0.0]);
        local.compressed = true;
        let mut remote = local.clone();
        remote.compressed = false;
        remote.embedding = vec![0.98, 0.1, 0.1];
        let r = reconcile(&local, &remote);
        assert_eq!(r.record.embedding, remote.embedding);
        assert!(!r.remote_changed);
    }
}
