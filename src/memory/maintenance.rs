//! Optimizer write-backs: merges and at-rest compression.
//!
//! Both run one group or record per transaction so an interrupted optimizer pass
//! leaves every row either fully old or fully new.

use anyhow::{bail, Result};
use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};

use super::clusters::{clusters_containing, refresh_clusters};
use super::codec;
use super::forget::{delete_in_tx, DeleteReason};
use super::store::{enqueue_sync, write_audit_log, Enqueue};
use super::types::{MemoryMetadata, MemoryRecord, SyncOperation, SyncState};
use super::{embedding_to_bytes, fmt_ts, parse_ts};

/// Rewrite the representative and delete the records it absorbed.
///
/// Every member must still exist at the version it was planned from (`read_version` for
/// the representative); otherwise nothing is written and `false` is returned. Access
/// counts, last access, and accessors are taken from the rows as they are now, so reads
/// recorded after planning are kept. The representative is written dense and queued for
/// sync; absorbed records are queued as remote deletes.
pub fn apply_merge(
    conn: &mut Connection,
    representative: &MemoryRecord,
    read_version: u64,
    absorbed: &[(String, u64)],
) -> Result<bool> {
    if absorbed.iter().any(|(id, _)| *id == representative.id) {
        bail!("merge representative {} cannot absorb itself", representative.id);
    }
    let tx = conn.transaction()?;

    let mut members: Vec<(&str, u64)> = absorbed.iter().map(|(id, v)| (id.as_str(), *v)).collect();
    members.push((representative.id.as_str(), read_version));

    let mut merged = representative.clone();
    let mut access_total: u64 = 0;
    for (id, planned) in &members {
        let row: Option<(i64, i64, String, String)> = tx
            .query_row(
                "SELECT version, access_count, last_accessed_at, metadata FROM memories \
                 WHERE id = ?1 AND project_id = ?2",
                params![id, representative.project_id],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
            )
            .optional()?;
        let Some((version, access_count, last_accessed_at, metadata)) = row else {
            return Ok(false);
        };
        if version as u64 != *planned {
            return Ok(false);
        }
        access_total += access_count.max(0) as u64;
        merged.last_accessed_at = merged.last_accessed_at.max(parse_ts(&last_accessed_at)?);
        let metadata: MemoryMetadata = serde_json::from_str(&metadata)?;
        merged.metadata.accessed_by.extend(metadata.accessed_by);
    }
    merged.access_count = access_total.min(u32::MAX as u64) as u32;
    let representative = &merged;

    let touched: Vec<String> = members.iter().map(|(id, _)| id.to_string()).collect();
    let absorbed: Vec<String> = absorbed.iter().map(|(id, _)| id.clone()).collect();
    let affected = clusters_containing(&tx, &touched)?;

    let updated = tx.execute(
        "UPDATE memories SET content = ?1, content_z = NULL, embedding = ?2, \
             embedding_encoding = 'dense', embedding_dim = ?3, metadata = ?4, tool_chain = ?5, \
             file_paths = ?6, success_score = ?7, created_at = ?8, last_accessed_at = ?9, \
             access_count = ?10, version = ?11, sync_state = 'queued' \
         WHERE id = ?12 AND project_id = ?13",
        params![
            representative.content,
            embedding_to_bytes(&representative.embedding),
            representative.embedding.len() as i64,
            serde_json::to_string(&representative.metadata)?,
            serde_json::to_string(&representative.tool_chain)?,
            serde_json::to_string(&representative.file_paths)?,
            representative.success_score as f64,
            fmt_ts(&representative.created_at),
            fmt_ts(&representative.last_accessed_at),
            representative.access_count as i64,
            representative.version as i64,
            representative.id,
            representative.project_id,
        ],
    )?;
    if updated == 0 {
        return Ok(false);
    }

    let mut snapshot = representative.clone();
    snapshot.sync_state = SyncState::Queued;
    snapshot.compressed = false;
    enqueue_sync(
        &tx,
        &representative.id,
        &representative.project_id,
        SyncOperation::Put,
        &serde_json::to_value(&snapshot)?,
    )?;
    write_audit_log(
        &tx,
        "merge",
        &representative.id,
        Some(&serde_json::json!({"absorbed": absorbed})),
    )?;

    delete_in_tx(&tx, &absorbed, DeleteReason::Merged, Enqueue::Yes)?;
    refresh_clusters(&tx, &affected)?;
    tx.commit()?;
    Ok(true)
}

/// Store a record's content deflated and its embedding top-k encoded, or dense when
/// top-k would not be smaller.
///
/// Only the local row changes; the remote copy keeps the lossless original, so nothing
/// is queued. Returns the bytes saved.
pub fn apply_compression(
    conn: &mut Connection,
    record: &MemoryRecord,
    keep_ratio: f32,
    min_energy: f32,
) -> Result<i64> {
    let content_z = codec::compress_content(&record.content)?;
    let (encoding, embedding) = codec::encode_for_storage(&record.embedding, keep_ratio, min_energy);

    let tx = conn.transaction()?;
    let before: i64 = tx.query_row(
        "SELECT LENGTH(CAST(content AS BLOB)) + IFNULL(LENGTH(content_z), 0) + LENGTH(embedding) \
         FROM memories WHERE id = ?1",
        params![record.id],
        |row| row.get(0),
    )?;
    tx.execute(
        "UPDATE memories SET content = '', content_z = ?1, embedding = ?2, \
             embedding_encoding = ?3 WHERE id = ?4",
        params![content_z, embedding, encoding, record.id],
    )?;
    let after = (content_z.len() + embedding.len()) as i64;
    write_audit_log(
        &tx,
        "compress",
        &record.id,
        Some(&serde_json::json!({"bytes_before": before, "bytes_after": after, "at": fmt_ts(&Utc::now())})),
    )?;
    tx.commit()?;
    Ok(before - after)
}
