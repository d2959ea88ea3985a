//! Hard deletion of memories.
//!
//! Removing a record cascades to its cluster memberships and bridge rows, queues a
//! `delete` for the remote tier, and recomputes every affected cluster centroid in the
//! same transaction.

use anyhow::Result;
use rusqlite::{params, Connection, OptionalExtension};

use super::clusters::{clusters_containing, refresh_clusters};
use super::store::{enqueue_sync, write_audit_log, Enqueue};
use super::types::SyncOperation;

/// Why a record is being removed; written to the audit log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteReason {
    Requested,
    Pruned,
    Merged,
}

impl DeleteReason {
    fn audit_operation(&self) -> &'static str {
        match self {
            Self::Requested => "delete",
            Self::Pruned => "prune",
            Self::Merged => "merge",
        }
    }
}

/// Delete records by id. Returns the number of rows removed; unknown ids are skipped.
pub fn delete_memories(
    conn: &mut Connection,
    ids: &[String],
    reason: DeleteReason,
    enqueue: Enqueue,
) -> Result<usize> {
    if ids.is_empty() {
        return Ok(0);
    }
    let tx = conn.transaction()?;
    let affected = clusters_containing(&tx, ids)?;
    let removed = delete_in_tx(&tx, ids, reason, enqueue)?;
    refresh_clusters(&tx, &affected)?;
    tx.commit()?;

    tracing::debug!(
        removed,
        reason = reason.audit_operation(),
        clusters = affected.len(),
        "deleted memories"
    );
    Ok(removed)
}

pub(crate) fn delete_in_tx(
    conn: &Connection,
    ids: &[String],
    reason: DeleteReason,
    enqueue: Enqueue,
) -> Result<usize> {
    let mut removed = 0;
    for id in ids {
        let project: Option<String> = conn
            .query_row(
                "SELECT project_id FROM memories WHERE id = ?1",
                params![id],
                |row| row.get(0),
            )
            .optional()?;
        let Some(project_id) = project else {
            continue;
        };

        write_audit_log(
            conn,
            reason.audit_operation(),
            id,
            Some(&serde_json::json!({"project_id": project_id})),
        )?;
        if enqueue == Enqueue::Yes {
            enqueue_sync(conn, id, &project_id, SyncOperation::Delete, &serde_json::Value::Null)?;
        }
        removed += conn.execute("DELETE FROM memories WHERE id = ?1", params![id])?;
    }
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;
    use crate::memory::clusters::{load_clusters, replace_clusters};
    use crate::memory::store::tests::sample_record;
    use crate::memory::store::{get_memory, put_memory};
    use crate::memory::types::Cluster;

    #[test]
    fn delete_queues_remote_delete() {
        let mut conn = db::open_memory_database().unwrap();
        let r = sample_record("alpha", "temp note", vec![1.0, 0.0]);
        put_memory(&mut conn, &r, Enqueue::Yes).unwrap();

        let ids = [r.id.clone(), "ghost".to_string()];
        let removed =
            delete_memories(&mut conn, &ids, DeleteReason::Requested, Enqueue::Yes).unwrap();
        assert_eq!(removed, 1);
        assert!(get_memory(&conn, &r.id).unwrap().is_none());

        let ops: Vec<String> = conn
            .prepare("SELECT operation FROM sync_outbox WHERE record_id = ?1 ORDER BY id")
            .unwrap()
            .query_map(params![r.id], |row| row.get(0))
            .unwrap()
            .collect::<Result<_, _>>()
            .unwrap();
        assert_eq!(ops, vec!["put", "delete"]);
    }

    #[test]
    fn deleting_a_member_recomputes_centroid() {
        let mut conn = db::open_memory_database().unwrap();
        let a = sample_record("alpha", "a", vec![1.0, 0.0]);
        let b = sample_record("alpha", "b", vec![0.0, 1.0]);
        put_memory(&mut conn, &a, Enqueue::Yes).unwrap();
        put_memory(&mut conn, &b, Enqueue::Yes).unwrap();

        let s = std::f32::consts::FRAC_1_SQRT_2;
        let cluster = Cluster {
            id: "c1".into(),
            project_id: "alpha".into(),
            member_ids: vec![a.id.clone(), b.id.clone()],
            centroid: vec![s, s],
            stability: s,
            label: "code_change: a, b".into(),
        };
        replace_clusters(&mut conn, "alpha", &[cluster], &[]).unwrap();

        delete_memories(&mut conn, &[b.id.clone()], DeleteReason::Pruned, Enqueue::Yes).unwrap();

        let clusters = load_clusters(&conn, "alpha").unwrap();
        assert_eq!(clusters[0].member_ids, vec![a.id.clone()]);
        assert!((clusters[0].centroid[0] - 1.0).abs() < 1e-6);
        assert!((clusters[0].stability - 1.0).abs() < 1e-6);

        delete_memories(&mut conn, &[a.id.clone()], DeleteReason::Pruned, Enqueue::Yes).unwrap();
        assert!(load_clusters(&conn, "alpha").unwrap().is_empty());
    }
}
