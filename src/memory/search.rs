//! Read path: project-scoped similarity queries and working-set loads.
//!
//! Project filtering happens in SQL; scoring happens in Rust so compressed embeddings
//! are decoded before comparison and rows from other projects are never even
//! materialized.

use anyhow::{Context, Result};
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

use super::cosine_similarity;
use super::store::{row_to_stored, StoredMemory, MEMORY_COLUMNS};
use super::types::{InteractionType, MemoryRecord, ScoredRecord};

/// Filters applied before ranking.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryFilter {
    pub project_id: String,
    /// Raw cosine floor; candidates below it are dropped.
    pub min_similarity: f32,
    /// Restrict to these interaction types. Empty means all.
    #[serde(default)]
    pub interaction_types: Vec<InteractionType>,
    #[serde(default)]
    pub exclude_deprecated: bool,
}

impl QueryFilter {
    pub fn for_project(project_id: impl Into<String>) -> Self {
        Self {
            project_id: project_id.into(),
            min_similarity: -1.0,
            interaction_types: Vec::new(),
            exclude_deprecated: false,
        }
    }

    pub fn with_min_similarity(mut self, min: f32) -> Self {
        self.min_similarity = min;
        self
    }

    pub fn matches(&self, record: &MemoryRecord) -> bool {
        record.project_id == self.project_id
            && (self.interaction_types.is_empty()
                || self.interaction_types.contains(&record.interaction_type))
            && !(self.exclude_deprecated && record.metadata.deprecated)
    }
}

/// Order by similarity desc, then most recent access, then newest version.
pub fn compare_scored(a: &ScoredRecord, b: &ScoredRecord) -> Ordering {
    b.similarity
        .partial_cmp(&a.similarity)
        .unwrap_or(Ordering::Equal)
        .then_with(|| b.record.last_accessed_at.cmp(&a.record.last_accessed_at))
        .then_with(|| b.record.version.cmp(&a.record.version))
}

/// Score and rank any set of records against a query embedding.
pub fn rank_candidates<'a>(
    records: impl IntoIterator<Item = &'a MemoryRecord>,
    query: &[f32],
    filter: &QueryFilter,
    limit: usize,
) -> Vec<ScoredRecord> {
    let mut scored: Vec<ScoredRecord> = records
        .into_iter()
        .filter(|r| filter.matches(r) && r.embedding.len() == query.len())
        .filter_map(|r| {
            let similarity = cosine_similarity(query, &r.embedding);
            (similarity >= filter.min_similarity).then(|| ScoredRecord {
                record: r.clone(),
                similarity,
            })
        })
        .collect();
    scored.sort_by(compare_scored);
    scored.truncate(limit);
    scored
}

/// Similarity-ranked records of one project.
pub fn query_project(
    conn: &Connection,
    query: &[f32],
    filter: &QueryFilter,
    limit: usize,
) -> Result<Vec<ScoredRecord>> {
    let records: Vec<MemoryRecord> = select_project(conn, &filter.project_id, Some(query.len()))?
        .into_iter()
        .map(|s| s.record)
        .collect();
    Ok(rank_candidates(&records, query, filter, limit))
}

/// Load a project's working set, most recently accessed first.
///
/// Returns the records and whether they are the whole project.
pub fn load_project(
    conn: &Connection,
    project_id: &str,
    max_records: usize,
) -> Result<(Vec<MemoryRecord>, bool)> {
    let sql = format!(
        "SELECT {MEMORY_COLUMNS} FROM memories WHERE project_id = ?1 \
         ORDER BY last_accessed_at DESC, version DESC LIMIT ?2"
    );
    let mut stmt = conn.prepare(&sql)?;
    // One extra row tells us whether the project fits.
    let mut records: Vec<MemoryRecord> = stmt
        .query_map(params![project_id, max_records as i64 + 1], row_to_stored)?
        .map(|r| r.map(|s| s.record))
        .collect::<Result<Vec<_>, _>>()
        .with_context(|| format!("failed to load project {project_id}"))?;

    let fully_loaded = records.len() <= max_records;
    records.truncate(max_records);
    Ok((records, fully_loaded))
}

/// Every record of a project with its at-rest size. Used by the optimizer and clusterer.
pub fn project_snapshot(conn: &Connection, project_id: &str) -> Result<Vec<StoredMemory>> {
    select_project(conn, project_id, None)
}

fn select_project(
    conn: &Connection,
    project_id: &str,
    dims: Option<usize>,
) -> Result<Vec<StoredMemory>> {
    let rows = match dims {
        Some(dims) => {
            let sql = format!(
                "SELECT {MEMORY_COLUMNS} FROM memories WHERE project_id = ?1 AND embedding_dim = ?2"
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt
                .query_map(params![project_id, dims as i64], row_to_stored)?
                .collect::<Result<Vec<_>, _>>();
            rows
        }
        None => {
            let sql = format!("SELECT {MEMORY_COLUMNS} FROM memories WHERE project_id = ?1");
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt
                .query_map(params![project_id], row_to_stored)?
                .collect::<Result<Vec<_>, _>>();
            rows
        }
    };
    rows.with_context(|| format!("failed to read project {project_id}"))
}

/// Distinct project ids with at least one record.
pub fn list_projects(conn: &Connection) -> Result<Vec<String>> {
    let mut stmt = conn.prepare("SELECT DISTINCT project_id FROM memories ORDER BY project_id")?;
    let projects = stmt
        .query_map([], |row| row.get(0))?
        .collect::<Result<Vec<String>, _>>()?;
    Ok(projects)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;
    use crate::memory::store::tests::sample_record;
    use crate::memory::store::{put_memory, Enqueue};

    #[test]
    fn query_never_crosses_projects() {
        let mut conn = db::open_memory_database().unwrap();
        let a = sample_record("alpha", "borrow checker fix", vec![1.0, 0.0]);
        let b = sample_record("beta", "borrow checker fix", vec![1.0, 0.0]);
        put_memory(&mut conn, &a, Enqueue::Yes).unwrap();
        put_memory(&mut conn, &b, Enqueue::Yes).unwrap();

        let hits = query_project(&conn, &[1.0, 0.0], &QueryFilter::for_project("alpha"), 10).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].record.id, a.id);
    }

    #[test]
    fn query_ranks_and_applies_floor() {
        let mut conn = db::open_memory_database().unwrap();
        let near = sample_record("alpha", "near", vec![1.0, 0.1]);
        let far = sample_record("alpha", "far", vec![0.0, 1.0]);
        put_memory(&mut conn, &near, Enqueue::Yes).unwrap();
        put_memory(&mut conn, &far, Enqueue::Yes).unwrap();

        let filter = QueryFilter::for_project("alpha").with_min_similarity(0.5);
        let hits = query_project(&conn, &[1.0, 0.0], &filter, 10).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].record.id, near.id);
    }

    #[test]
    fn ties_break_by_recent_access() {
        let older = sample_record("alpha", "same", vec![1.0, 0.0]);
        let mut newer = sample_record("alpha", "same", vec![1.0, 0.0]);
        newer.last_accessed_at = older.last_accessed_at + chrono::Duration::seconds(1);

        let ranked = rank_candidates(
            [&older, &newer],
            &[1.0, 0.0],
            &QueryFilter::for_project("alpha"),
            10,
        );
        assert_eq!(ranked[0].record.id, newer.id);
    }

    #[test]
    fn load_project_reports_partial_working_set() {
        let mut conn = db::open_memory_database().unwrap();
        for i in 0..3 {
            let r = sample_record("alpha", &format!("note {i}"), vec![1.0, i as f32]);
            put_memory(&mut conn, &r, Enqueue::Yes).unwrap();
        }

        let (records, full) = load_project(&conn, "alpha", 2).unwrap();
        assert_eq!(records.len(), 2);
        assert!(!full);

        let (records, full) = load_project(&conn, "alpha", 3).unwrap();
        assert_eq!(records.len(), 3);
        assert!(full);
    }

    #[test]
    fn deprecated_can_be_excluded() {
        let mut r = sample_record("alpha", "old api", vec![1.0, 0.0]);
        r.metadata.deprecated = true;
        let mut filter = QueryFilter::for_project("alpha");
        assert_eq!(rank_candidates([&r], &[1.0, 0.0], &filter, 5).len(), 1);
        filter.exclude_deprecated = true;
        assert!(rank_candidates([&r], &[1.0, 0.0], &filter, 5).is_empty());
    }
}
