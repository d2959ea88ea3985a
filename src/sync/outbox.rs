//! Durable sync outbox operations.
//!
//! Every state transition commits on its own, so a crash between items loses at most
//! the in-flight marker, which [`requeue_in_flight`] restores on startup.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, Row};
use serde::Serialize;

use crate::memory::store::write_audit_log;
use crate::memory::types::{SyncQueueItem, SyncState};
use crate::memory::{fmt_ts, parse_ts};

const ITEM_COLUMNS: &str = "id, table_name, record_id, project_id, operation, payload, attempts, \
     state, next_attempt_at, last_error";

/// Outbox row counts per state.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct OutboxStats {
    pub queued: u64,
    pub in_flight: u64,
    pub synced: u64,
    pub failed: u64,
    pub dead_letter: u64,
}

impl OutboxStats {
    /// Items that will still be attempted automatically.
    pub fn pending(&self) -> u64 {
        self.queued + self.in_flight + self.failed
    }
}

fn row_to_item(row: &Row<'_>) -> rusqlite::Result<SyncQueueItem> {
    let operation: String = row.get(4)?;
    let payload: String = row.get(5)?;
    let state: String = row.get(7)?;
    let next_attempt_at: String = row.get(8)?;
    let conv = |idx: usize, e: String| {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, e.into())
    };
    Ok(SyncQueueItem {
        id: row.get(0)?,
        table_name: row.get(1)?,
        record_id: row.get(2)?,
        project_id: row.get(3)?,
        operation: operation.parse().map_err(|e| conv(4, e))?,
        payload: serde_json::from_str(&payload).map_err(|e| conv(5, e.to_string()))?,
        attempts: row.get::<_, i64>(6)? as u32,
        state: state.parse().map_err(|e| conv(7, e))?,
        next_attempt_at: parse_ts(&next_attempt_at)?,
        last_error: row.get(9)?,
    })
}

/// Mirror the newest `put` entry's state onto the record row.
fn mirror_record_state(conn: &Connection, record_id: &str) -> Result<()> {
    conn.execute(
        "UPDATE memories SET sync_state = IFNULL(( \
             SELECT state FROM sync_outbox \
             WHERE record_id = ?1 AND operation = 'put' ORDER BY id DESC LIMIT 1 \
         ), sync_state) WHERE id = ?1",
        params![record_id],
    )?;
    Ok(())
}

/// Claim up to `limit` due items (queued, or failed with backoff elapsed) and mark
/// them in-flight. Items are returned oldest first.
pub fn claim_due(conn: &mut Connection, limit: usize, now: DateTime<Utc>) -> Result<Vec<SyncQueueItem>> {
    let tx = conn.transaction()?;
    let now = fmt_ts(&now);
    let items = {
        let sql = format!(
            "SELECT {ITEM_COLUMNS} FROM sync_outbox \
             WHERE state = 'queued' OR (state = 'failed' AND next_attempt_at <= ?1) \
             ORDER BY id LIMIT ?2"
        );
        let mut stmt = tx.prepare(&sql)?;
        let items = stmt
            .query_map(params![now, limit as i64], row_to_item)?
            .collect::<Result<Vec<_>, _>>()
            .context("failed to read due outbox items")?;
        items
    };

    for item in &items {
        tx.execute(
            "UPDATE sync_outbox SET state = 'in_flight', updated_at = ?1 WHERE id = ?2",
            params![now, item.id],
        )?;
        mirror_record_state(&tx, &item.record_id)?;
    }
    tx.commit()?;

    Ok(items
        .into_iter()
        .map(|mut item| {
            item.state = SyncState::InFlight;
            item
        })
        .collect())
}

pub fn mark_synced(conn: &mut Connection, item: &SyncQueueItem) -> Result<()> {
    let tx = conn.transaction()?;
    tx.execute(
        "UPDATE sync_outbox SET state = 'synced', attempts = attempts + 1, last_error = NULL, \
             updated_at = ?1 WHERE id = ?2",
        params![fmt_ts(&Utc::now()), item.id],
    )?;
    mirror_record_state(&tx, &item.record_id)?;
    write_audit_log(
        &tx,
        "sync",
        &item.record_id,
        Some(&serde_json::json!({"outbox_id": item.id, "operation": item.operation.as_str()})),
    )?;
    tx.commit()?;
    Ok(())
}

/// Record a failed attempt and schedule the next one.
pub fn mark_failed(
    conn: &mut Connection,
    item: &SyncQueueItem,
    error: &str,
    next_attempt_at: DateTime<Utc>,
) -> Result<()> {
    let tx = conn.transaction()?;
    tx.execute(
        "UPDATE sync_outbox SET state = 'failed', attempts = attempts + 1, last_error = ?1, \
             next_attempt_at = ?2, updated_at = ?3 WHERE id = ?4",
        params![error, fmt_ts(&next_attempt_at), fmt_ts(&Utc::now()), item.id],
    )?;
    mirror_record_state(&tx, &item.record_id)?;
    tx.commit()?;
    Ok(())
}

/// Park an item that exhausted its attempts. It stays readable and is never retried
/// automatically.
pub fn mark_dead_letter(conn: &mut Connection, item: &SyncQueueItem, error: &str) -> Result<()> {
    let tx = conn.transaction()?;
    tx.execute(
        "UPDATE sync_outbox SET state = 'dead_letter', attempts = attempts + 1, last_error = ?1, \
             updated_at = ?2 WHERE id = ?3",
        params![error, fmt_ts(&Utc::now()), item.id],
    )?;
    mirror_record_state(&tx, &item.record_id)?;
    write_audit_log(
        &tx,
        "dead_letter",
        &item.record_id,
        Some(&serde_json::json!({"outbox_id": item.id, "error": error})),
    )?;
    tx.commit()?;
    Ok(())
}

/// Return items orphaned in-flight by a crash to the queue. Returns how many moved.
pub fn requeue_in_flight(conn: &mut Connection) -> Result<usize> {
    requeue_where(conn, "state = 'in_flight'", false)
}

/// Give dead-lettered items a fresh set of attempts.
pub fn requeue_dead_letters(conn: &mut Connection) -> Result<usize> {
    requeue_where(conn, "state = 'dead_letter'", true)
}

fn requeue_where(conn: &mut Connection, predicate: &str, reset_attempts: bool) -> Result<usize> {
    let tx = conn.transaction()?;
    let records: Vec<String> = {
        let mut stmt =
            tx.prepare(&format!("SELECT DISTINCT record_id FROM sync_outbox WHERE {predicate}"))?;
        let rows = stmt
            .query_map([], |row| row.get(0))?
            .collect::<Result<Vec<_>, _>>()?;
        rows
    };
    let attempts = if reset_attempts { "0" } else { "attempts" };
    let now = fmt_ts(&Utc::now());
    let moved = tx.execute(
        &format!(
            "UPDATE sync_outbox SET state = 'queued', attempts = {attempts}, next_attempt_at = ?1, \
                 updated_at = ?1 WHERE {predicate}"
        ),
        params![now],
    )?;
    for record_id in &records {
        mirror_record_state(&tx, record_id)?;
    }
    tx.commit()?;
    Ok(moved)
}

pub fn list_dead_letters(conn: &Connection, limit: usize) -> Result<Vec<SyncQueueItem>> {
    let sql = format!(
        "SELECT {ITEM_COLUMNS} FROM sync_outbox WHERE state = 'dead_letter' ORDER BY id LIMIT ?1"
    );
    let mut stmt = conn.prepare(&sql)?;
    let items = stmt
        .query_map(params![limit as i64], row_to_item)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(items)
}

pub fn outbox_stats(conn: &Connection) -> Result<OutboxStats> {
    let mut stmt = conn.prepare("SELECT state, COUNT(*) FROM sync_outbox GROUP BY state")?;
    let rows = stmt
        .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))?
        .collect::<Result<Vec<_>, _>>()?;

    let mut stats = OutboxStats::default();
    for (state, n) in rows {
        let n = n as u64;
        match state.as_str() {
            "queued" => stats.queued = n,
            "in_flight" => stats.in_flight = n,
            "synced" => stats.synced = n,
            "failed" => stats.failed = n,
            "dead_letter" => stats.dead_letter = n,
            other => tracing::warn!(state = other, "unknown outbox state"),
        }
    }
    Ok(stats)
}

/// Delete synced entries older than `before`. Returns how many were removed.
pub fn purge_synced(conn: &Connection, before: DateTime<Utc>) -> Result<usize> {
    let removed = conn.execute(
        "DELETE FROM sync_outbox WHERE state = 'synced' AND updated_at < ?1",
        params![fmt_ts(&before)],
    )?;
    Ok(removed)
}
