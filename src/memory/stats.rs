use anyhow::Result;
use rusqlite::{params, Connection};
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::Path;

/// Per-project storage figures.
#[derive(Debug, Clone, Serialize)]
pub struct ProjectStats {
    pub project_id: String,
    pub memories: u64,
    pub compressed: u64,
    /// Bytes the project's rows occupy at rest.
    pub footprint_bytes: u64,
    pub by_type: BTreeMap<String, u64>,
    pub by_sync_state: BTreeMap<String, u64>,
    pub clusters: u64,
    pub patterns: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub oldest_memory: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub newest_memory: Option<String>,
}

/// Whole-store summary.
#[derive(Debug, Serialize)]
pub struct StoreStats {
    pub total_memories: u64,
    pub db_size_bytes: u64,
    pub projects: Vec<ProjectStats>,
}

/// Sum of the at-rest row sizes of one project.
pub fn project_footprint(conn: &Connection, project_id: &str) -> Result<u64> {
    let bytes: i64 = conn.query_row(
        "SELECT IFNULL(SUM(LENGTH(CAST(content AS BLOB)) + IFNULL(LENGTH(content_z), 0) \
             + LENGTH(embedding) + LENGTH(metadata) + LENGTH(tool_chain) + LENGTH(file_paths)), 0) \
         FROM memories WHERE project_id = ?1",
        params![project_id],
        |row| row.get(0),
    )?;
    Ok(bytes.max(0) as u64)
}

pub fn project_stats(conn: &Connection, project_id: &str) -> Result<ProjectStats> {
    let (memories, compressed, oldest, newest): (i64, i64, Option<String>, Option<String>) = conn
        .query_row(
            "SELECT COUNT(*), IFNULL(SUM(content_z IS NOT NULL OR embedding_encoding = 'top_k'), 0), \
                 MIN(created_at), MAX(created_at) \
             FROM memories WHERE project_id = ?1",
            params![project_id],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
        )?;

    let clusters: i64 = conn.query_row(
        "SELECT COUNT(*) FROM clusters WHERE project_id = ?1",
        params![project_id],
        |row| row.get(0),
    )?;
    let patterns: i64 = conn.query_row(
        "SELECT COUNT(*) FROM patterns WHERE project_id = ?1",
        params![project_id],
        |row| row.get(0),
    )?;

    Ok(ProjectStats {
        project_id: project_id.to_string(),
        memories: memories as u64,
        compressed: compressed as u64,
        footprint_bytes: project_footprint(conn, project_id)?,
        by_type: group_count(conn, "interaction_type", project_id)?,
        by_sync_state: group_count(conn, "sync_state", project_id)?,
        clusters: clusters as u64,
        patterns: patterns as u64,
        oldest_memory: oldest,
        newest_memory: newest,
    })
}

/// Stats for every project. `db_path` is used for file size; pass None for in-memory databases.
pub fn store_stats(conn: &Connection, db_path: Option<&Path>) -> Result<StoreStats> {
    let projects = super::search::list_projects(conn)?
        .iter()
        .map(|p| project_stats(conn, p))
        .collect::<Result<Vec<_>>>()?;

    let db_size_bytes = db_path
        .and_then(|p| std::fs::metadata(p).ok())
        .map(|m| m.len())
        .unwrap_or(0);

    Ok(StoreStats {
        total_memories: projects.iter().map(|p| p.memories).sum(),
        db_size_bytes,
        projects,
    })
}

fn group_count(conn: &Connection, column: &str, project_id: &str) -> Result<BTreeMap<String, u64>> {
    let sql = format!(
        "SELECT {column}, COUNT(*) FROM memories WHERE project_id = ?1 GROUP BY {column}"
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map(params![project_id], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows.into_iter().map(|(k, n)| (k, n as u64)).collect())
}
