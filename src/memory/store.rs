//! Write path: row upserts, outbox enqueueing, access tracking, and audit logging.
//!
//! [`put_memory`] is the single entry point for durable writes. The memory row, its
//! `sync_outbox` entry, and the audit log line commit in one transaction, so a record
//! that is locally visible is always also queued for the remote tier.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};

use super::codec;
use super::types::{MemoryMetadata, MemoryRecord, SyncOperation, SyncState};
use super::{embedding_to_bytes, fmt_ts, parse_ts};

/// Column list shared by every query that materializes a [`StoredMemory`].
pub(crate) const MEMORY_COLUMNS: &str = "id, project_id, content, content_z, embedding, \
     embedding_encoding, metadata, interaction_type, tool_chain, file_paths, success_score, \
     created_at, last_accessed_at, access_count, version, sync_state, \
     LENGTH(CAST(content AS BLOB)) + IFNULL(LENGTH(content_z), 0) + LENGTH(embedding) \
     + LENGTH(metadata) + LENGTH(tool_chain) + LENGTH(file_paths)";

/// A decoded record plus the bytes its row occupies at rest.
#[derive(Debug, Clone)]
pub struct StoredMemory {
    pub record: MemoryRecord,
    pub stored_bytes: u64,
}

/// Whether a write should also be queued for the remote tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Enqueue {
    Yes,
    /// The row mirrors a state the remote already holds.
    No,
}

fn conversion_err<E>(idx: usize, e: E) -> rusqlite::Error
where
    E: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, e.into())
}

/// Decode a row selected with [`MEMORY_COLUMNS`], inflating compressed content and
/// expanding top-k embeddings.
pub(crate) fn row_to_stored(row: &Row<'_>) -> rusqlite::Result<StoredMemory> {
    let content_z: Option<Vec<u8>> = row.get(3)?;
    let deflated = content_z.is_some();
    let content = match content_z {
        Some(bytes) => codec::decompress_content(&bytes).map_err(|e| conversion_err(3, e))?,
        None => row.get(2)?,
    };
    let encoding: String = row.get(5)?;
    let embedding_bytes: Vec<u8> = row.get(4)?;
    let embedding =
        codec::decode_embedding(&encoding, &embedding_bytes).map_err(|e| conversion_err(4, e))?;

    let metadata: String = row.get(6)?;
    let metadata: MemoryMetadata =
        serde_json::from_str(&metadata).map_err(|e| conversion_err(6, e))?;
    let interaction_type: String = row.get(7)?;
    let tool_chain: String = row.get(8)?;
    let file_paths: String = row.get(9)?;
    let created_at: String = row.get(11)?;
    let last_accessed_at: String = row.get(12)?;
    let sync_state: String = row.get(15)?;
    let stored_bytes: i64 = row.get(16)?;

    Ok(StoredMemory {
        record: MemoryRecord {
            id: row.get(0)?,
            project_id: row.get(1)?,
            content,
            embedding,
            metadata,
            interaction_type: interaction_type.parse().map_err(|e| conversion_err(7, e))?,
            tool_chain: serde_json::from_str(&tool_chain).map_err(|e| conversion_err(8, e))?,
            file_paths: serde_json::from_str(&file_paths).map_err(|e| conversion_err(9, e))?,
            success_score: row.get::<_, f64>(10)? as f32,
            created_at: parse_ts(&created_at)?,
            last_accessed_at: parse_ts(&last_accessed_at)?,
            access_count: row.get::<_, i64>(13)? as u32,
            version: row.get::<_, i64>(14)? as u64,
            sync_state: sync_state.parse().map_err(|e| conversion_err(15, e))?,
            compressed: deflated || encoding == codec::TOP_K,
        },
        stored_bytes: stored_bytes.max(0) as u64,
    })
}

/// Insert or replace a record in its dense, uncompressed form.
///
/// With [`Enqueue::Yes`] the row is marked `queued` and a `put` outbox entry carrying a
/// JSON snapshot is written in the same transaction.
pub fn put_memory(conn: &mut Connection, record: &MemoryRecord, enqueue: Enqueue) -> Result<()> {
    let tx = conn.transaction()?;

    let exists: bool = tx.query_row(
        "SELECT COUNT(*) > 0 FROM memories WHERE id = ?1",
        params![record.id],
        |row| row.get(0),
    )?;

    let sync_state = match enqueue {
        Enqueue::Yes => SyncState::Queued,
        Enqueue::No => record.sync_state,
    };

    tx.execute(
        "INSERT INTO memories (id, project_id, content, content_z, embedding, embedding_encoding, \
             embedding_dim, metadata, interaction_type, tool_chain, file_paths, success_score, \
             created_at, last_accessed_at, access_count, version, sync_state) \
         VALUES (?1, ?2, ?3, NULL, ?4, 'dense', ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15) \
         ON CONFLICT(id) DO UPDATE SET \
             content = excluded.content, content_z = NULL, embedding = excluded.embedding, \
             embedding_encoding = 'dense', embedding_dim = excluded.embedding_dim, \
             metadata = excluded.metadata, interaction_type = excluded.interaction_type, \
             tool_chain = excluded.tool_chain, file_paths = excluded.file_paths, \
             success_score = excluded.success_score, created_at = excluded.created_at, \
             last_accessed_at = excluded.last_accessed_at, access_count = excluded.access_count, \
             version = excluded.version, sync_state = excluded.sync_state",
        params![
            record.id,
            record.project_id,
            record.content,
            embedding_to_bytes(&record.embedding),
            record.embedding.len() as i64,
            serde_json::to_string(&record.metadata)?,
            record.interaction_type.as_str(),
            serde_json::to_string(&record.tool_chain)?,
            serde_json::to_string(&record.file_paths)?,
            record.success_score as f64,
            fmt_ts(&record.created_at),
            fmt_ts(&record.last_accessed_at),
            record.access_count as i64,
            record.version as i64,
            sync_state.as_str(),
        ],
    )?;

    if enqueue == Enqueue::Yes {
        let mut snapshot = record.clone();
        snapshot.sync_state = SyncState::Queued;
        snapshot.compressed = false;
        enqueue_sync(
            &tx,
            &record.id,
            &record.project_id,
            SyncOperation::Put,
            &serde_json::to_value(&snapshot)?,
        )?;
    }

    write_audit_log(
        &tx,
        if exists { "update" } else { "create" },
        &record.id,
        Some(&serde_json::json!({"project_id": record.project_id, "version": record.version})),
    )?;

    tx.commit()?;
    Ok(())
}

/// Fold a reconciled copy into the local row without undoing concurrent local changes.
///
/// Access count and last access only move forward, `created_at` only moves back, and the
/// accessor and lineage sets are unioned with whatever the row holds now. Content-bearing
/// fields are rewritten only when the merge advanced the version and the row still carries
/// `read_version`. A row deleted since it was read stays deleted. Returns whether a row
/// was updated.
pub fn apply_reconciled(
    conn: &mut Connection,
    merged: &MemoryRecord,
    read_version: u64,
) -> Result<bool> {
    let tx = conn.transaction()?;
    let current: Option<(i64, String)> = tx
        .query_row(
            "SELECT version, metadata FROM memories WHERE id = ?1",
            params![merged.id],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()?;
    let Some((version, metadata)) = current else {
        return Ok(false);
    };
    let current_meta: MemoryMetadata = serde_json::from_str(&metadata)?;
    let rewrite = version as u64 == read_version && merged.version > read_version;

    let (mut metadata, other) = if rewrite {
        (merged.metadata.clone(), &current_meta)
    } else {
        (current_meta.clone(), &merged.metadata)
    };
    metadata.accessed_by.extend(other.accessed_by.iter().cloned());
    for id in &other.merged_from {
        if !metadata.merged_from.contains(id) {
            metadata.merged_from.push(id.clone());
        }
    }

    tx.execute(
        "UPDATE memories SET access_count = MAX(access_count, ?1), \
             last_accessed_at = MAX(last_accessed_at, ?2), created_at = MIN(created_at, ?3), \
             metadata = ?4 \
         WHERE id = ?5",
        params![
            merged.access_count as i64,
            fmt_ts(&merged.last_accessed_at),
            fmt_ts(&merged.created_at),
            serde_json::to_string(&metadata)?,
            merged.id,
        ],
    )?;

    if rewrite {
        tx.execute(
            "UPDATE memories SET content = ?1, content_z = NULL, embedding = ?2, \
                 embedding_encoding = 'dense', embedding_dim = ?3, interaction_type = ?4, \
                 tool_chain = ?5, file_paths = ?6, success_score = ?7, version = ?8 \
             WHERE id = ?9 AND version = ?10",
            params![
                merged.content,
                embedding_to_bytes(&merged.embedding),
                merged.embedding.len() as i64,
                merged.interaction_type.as_str(),
                serde_json::to_string(&merged.tool_chain)?,
                serde_json::to_string(&merged.file_paths)?,
                merged.success_score as f64,
                merged.version as i64,
                merged.id,
                read_version as i64,
            ],
        )?;
    }

    write_audit_log(
        &tx,
        "sync",
        &merged.id,
        Some(&serde_json::json!({"reconciled_version": merged.version, "content_rewritten": rewrite})),
    )?;
    tx.commit()?;
    Ok(true)
}

/// Fetch one record by id.
pub fn get_memory(conn: &Connection, id: &str) -> Result<Option<MemoryRecord>> {
    let sql = format!("SELECT {MEMORY_COLUMNS} FROM memories WHERE id = ?1");
    let stored = conn
        .query_row(&sql, params![id], row_to_stored)
        .optional()
        .with_context(|| format!("failed to load memory {id}"))?;
    Ok(stored.map(|s| s.record))
}

/// Bump access count and timestamp for retrieved records and note who read them.
///
/// Access tracking is local bookkeeping: it does not advance the record version and
/// is reconciled with the remote copy by max-merge on the next content sync.
pub fn record_access(
    conn: &mut Connection,
    ids: &[String],
    accessor: Option<&str>,
    at: DateTime<Utc>,
) -> Result<()> {
    if ids.is_empty() {
        return Ok(());
    }
    let tx = conn.transaction()?;
    let at = fmt_ts(&at);
    for id in ids {
        let metadata: Option<String> = tx
            .query_row(
                "SELECT metadata FROM memories WHERE id = ?1",
                params![id],
                |row| row.get(0),
            )
            .optional()?;
        let Some(metadata) = metadata else {
            continue;
        };

        let metadata = match accessor {
            Some(user) => {
                let mut parsed: MemoryMetadata = serde_json::from_str(&metadata)?;
                if parsed.accessed_by.insert(user.to_string()) {
                    serde_json::to_string(&parsed)?
                } else {
                    metadata
                }
            }
            None => metadata,
        };

        tx.execute(
            "UPDATE memories SET access_count = access_count + 1, \
                 last_accessed_at = MAX(last_accessed_at, ?1), metadata = ?2 \
             WHERE id = ?3",
            params![at, metadata, id],
        )?;
    }
    tx.commit()?;
    Ok(())
}

/// Set a record's sync state without touching anything else.
pub fn set_sync_state(conn: &Connection, id: &str, state: SyncState) -> Result<()> {
    conn.execute(
        "UPDATE memories SET sync_state = ?1 WHERE id = ?2",
        params![state.as_str(), id],
    )?;
    Ok(())
}

/// Append an outbox entry. Must run inside the transaction that made the change.
pub(crate) fn enqueue_sync(
    conn: &Connection,
    record_id: &str,
    project_id: &str,
    operation: SyncOperation,
    payload: &serde_json::Value,
) -> Result<i64> {
    let now = fmt_ts(&Utc::now());
    conn.execute(
        "INSERT INTO sync_outbox (table_name, record_id, project_id, operation, payload, state, \
             attempts, next_attempt_at, created_at, updated_at) \
         VALUES ('memories', ?1, ?2, ?3, ?4, 'queued', 0, ?5, ?5, ?5)",
        params![record_id, project_id, operation.as_str(), payload.to_string(), now],
    )?;
    Ok(conn.last_insert_rowid())
}

/// Write an entry to the memory_log audit table.
pub(crate) fn write_audit_log(
    conn: &Connection,
    operation: &str,
    memory_id: &str,
    details: Option<&serde_json::Value>,
) -> Result<()> {
    let now = fmt_ts(&Utc::now());
    let details_json = details.map(|d| d.to_string());
    conn.execute(
        "INSERT INTO memory_log (operation, memory_id, details, created_at) VALUES (?1, ?2, ?3, ?4)",
        params![operation, memory_id, details_json, now],
    )?;
    Ok(())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::db;
    use crate::memory::types::InteractionType;

    pub(crate) fn sample_record(project: &str, content: &str, embedding: Vec<f32>) -> MemoryRecord {
        let now = Utc::now();
        MemoryRecord {
            id: uuid::Uuid::now_v7().to_string(),
            project_id: project.to_string(),
            content: content.to_string(),
            embedding,
            metadata: MemoryMetadata::default(),
            interaction_type: InteractionType::CodeChange,
            tool_chain: vec!["edit".into()],
            file_paths: vec!["src/lib.rs".into()],
            success_score: 0.5,
            created_at: now,
            last_accessed_at: now,
            access_count: 1,
            sync_state: SyncState::New,
            version: 1,
            compressed: false,
        }
    }

    #[test]
    fn put_writes_row_outbox_and_audit_atomically() {
        let mut conn = db::open_memory_database().unwrap();
        let record = sample_record("alpha", "use ? instead of unwrap", vec![1.0, 0.0, 0.0]);
        put_memory(&mut conn, &record, Enqueue::Yes).unwrap();

        let loaded = get_memory(&conn, &record.id).unwrap().unwrap();
        assert_eq!(loaded.content, record.content);
        assert_eq!(loaded.embedding, record.embedding);
        assert_eq!(loaded.sync_state, SyncState::Queued);

        let (op, payload): (String, String) = conn
            .query_row(
                "SELECT operation, payload FROM sync_outbox WHERE record_id = ?1",
                params![record.id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .unwrap();
        assert_eq!(op, "put");
        let snapshot: MemoryRecord = serde_json::from_str(&payload).unwrap();
        assert_eq!(snapshot.content, record.content);

        let audit: String = conn
            .query_row(
                "SELECT operation FROM memory_log WHERE memory_id = ?1",
                params![record.id],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(audit, "create");
    }

    #[test]
    fn put_without_enqueue_skips_outbox() {
        let mut conn = db::open_memory_database().unwrap();
        let mut record = sample_record("alpha", "synced copy", vec![0.0, 1.0]);
        record.sync_state = SyncState::Synced;
        put_memory(&mut conn, &record, Enqueue::No).unwrap();

        let queued: i64 = conn
            .query_row("SELECT COUNT(*) FROM sync_outbox", [], |row| row.get(0))
            .unwrap();
        assert_eq!(queued, 0);
        assert_eq!(
            get_memory(&conn, &record.id).unwrap().unwrap().sync_state,
            SyncState::Synced
        );
    }

    #[test]
    fn access_tracking_is_monotonic_and_collects_users() {
        let mut conn = db::open_memory_database().unwrap();
        let record = sample_record("alpha", "cached build output", vec![1.0, 0.0]);
        put_memory(&mut conn, &record, Enqueue::Yes).unwrap();

        let later = record.last_accessed_at + chrono::Duration::seconds(5);
        record_access(&mut conn, &[record.id.clone()], Some("ana"), later).unwrap();
        // An older timestamp must not move last access backwards.
        record_access(&mut conn, &[record.id.clone()], Some("bo"), record.created_at).unwrap();
        record_access(&mut conn, &[record.id.clone()], Some("ana"), later).unwrap();

        let loaded = get_memory(&conn, &record.id).unwrap().unwrap();
        assert_eq!(loaded.access_count, 4);
        assert_eq!(loaded.last_accessed_at.timestamp_micros(), later.timestamp_micros());
        assert_eq!(loaded.metadata.accessed_by.len(), 2);
        assert_eq!(loaded.version, record.version);
    }

    #[test]
    fn reconciled_write_back_keeps_newer_local_state() {
        let mut conn = db::open_memory_database().unwrap();
        let mut record = sample_record("alpha", "local wording", vec![1.0, 0.0]);
        record.version = 5;
        put_memory(&mut conn, &record, Enqueue::Yes).unwrap();

        let mut merged = record.clone();
        merged.content = "remote wording".into();
        merged.version = 9;
        merged.metadata.accessed_by.insert("carol".into());

        // Reads that landed after the sync read its copy.
        let later = record.last_accessed_at + chrono::Duration::seconds(30);
        for _ in 0..3 {
            record_access(&mut conn, &[record.id.clone()], Some("dan"), later).unwrap();
        }

        assert!(apply_reconciled(&mut conn, &merged, 5).unwrap());
        let loaded = get_memory(&conn, &record.id).unwrap().unwrap();
        assert_eq!(loaded.content, "remote wording");
        assert_eq!(loaded.version, 9);
        assert_eq!(loaded.access_count, 4);
        assert_eq!(loaded.last_accessed_at.timestamp_micros(), later.timestamp_micros());
        assert!(loaded.metadata.accessed_by.contains("carol"));
        assert!(loaded.metadata.accessed_by.contains("dan"));
    }

    #[test]
    fn reconciled_write_back_skips_content_after_local_edit() {
        let mut conn = db::open_memory_database().unwrap();
        let mut record = sample_record("alpha", "first", vec![1.0, 0.0]);
        record.version = 5;
        put_memory(&mut conn, &record, Enqueue::Yes).unwrap();

        let mut edited = record.clone();
        edited.content = "edited locally".into();
        edited.version = 12;
        put_memory(&mut conn, &edited, Enqueue::Yes).unwrap();

        let mut merged = record.clone();
        merged.content = "remote wording".into();
        merged.version = 9;
        apply_reconciled(&mut conn, &merged, 5).unwrap();

        let loaded = get_memory(&conn, &record.id).unwrap().unwrap();
        assert_eq!(loaded.content, "edited locally");
        assert_eq!(loaded.version, 12);
    }

    #[test]
    fn reconciled_write_back_never_recreates_a_deleted_row() {
        let mut conn = db::open_memory_database().unwrap();
        let record = sample_record("alpha", "gone", vec![1.0, 0.0]);
        assert!(!apply_reconciled(&mut conn, &record, record.version).unwrap());
        assert!(get_memory(&conn, &record.id).unwrap().is_none());
    }

    #[test]
    fn missing_record_is_none() {
        let conn = db::open_memory_database().unwrap();
        assert!(get_memory(&conn, "nope").unwrap().is_none());
    }
}
