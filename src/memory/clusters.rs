//! Cluster and bridge persistence.
//!
//! Cluster rows are replaced wholesale per project by the clusterer. Between runs, any
//! membership change made by delete, prune, or merge goes through
//! [`refresh_clusters`] so centroids never describe members that no longer exist.

use anyhow::{Context, Result};
use chrono::Utc;
use rusqlite::{params, Connection, Transaction};
use std::collections::HashSet;

use super::codec::decode_embedding;
use super::types::{Bridge, Cluster};
use super::{bytes_to_embedding, cosine_similarity, embedding_to_bytes, fmt_ts, mean_vector};

/// Replace all clusters and bridges of a project in one transaction.
///
/// Members deleted since the clusters were computed are left out, and the centroid of
/// any cluster that lost members is recomputed from the ones that remain. Clusters left
/// empty are dropped, along with bridges that no longer touch two clusters.
pub fn replace_clusters(
    conn: &mut Connection,
    project_id: &str,
    clusters: &[Cluster],
    bridges: &[Bridge],
) -> Result<()> {
    let tx = conn.transaction()?;
    let now = fmt_ts(&Utc::now());

    // Members and bridges cascade with their cluster/memory rows
    tx.execute("DELETE FROM clusters WHERE project_id = ?1", params![project_id])?;
    tx.execute("DELETE FROM cluster_bridges WHERE project_id = ?1", params![project_id])?;

    let mut shrunk = Vec::new();
    for cluster in clusters {
        tx.execute(
            "INSERT INTO clusters (id, project_id, centroid, stability, label, created_at, updated_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)",
            params![
                cluster.id,
                project_id,
                embedding_to_bytes(&cluster.centroid),
                cluster.stability as f64,
                cluster.label,
                now,
            ],
        )?;
        let mut inserted = 0;
        for member in &cluster.member_ids {
            inserted += tx.execute(
                "INSERT OR IGNORE INTO cluster_members (cluster_id, memory_id) \
                 SELECT ?1, id FROM memories WHERE id = ?2 AND project_id = ?3",
                params![cluster.id, member, project_id],
            )?;
        }
        if inserted < cluster.member_ids.len() {
            shrunk.push(cluster.id.clone());
        }
    }
    refresh_clusters(&tx, &shrunk)?;

    let live: HashSet<String> = tx
        .prepare("SELECT id FROM clusters WHERE project_id = ?1")?
        .query_map(params![project_id], |row| row.get(0))?
        .collect::<Result<_, _>>()?;
    for bridge in bridges {
        let cluster_ids: Vec<&String> =
            bridge.cluster_ids.iter().filter(|id| live.contains(*id)).collect();
        if cluster_ids.len() < 2 {
            continue;
        }
        tx.execute(
            "INSERT OR REPLACE INTO cluster_bridges (memory_id, project_id, cluster_ids, updated_at) \
             SELECT id, ?2, ?3, ?4 FROM memories WHERE id = ?1 AND project_id = ?2",
            params![
                bridge.memory_id,
                project_id,
                serde_json::to_string(&cluster_ids)?,
                now,
            ],
        )?;
    }

    tx.commit()?;
    Ok(())
}

/// Load a project's clusters with their member ids.
pub fn load_clusters(conn: &Connection, project_id: &str) -> Result<Vec<Cluster>> {
    let mut stmt = conn.prepare(
        "SELECT id, centroid, stability, label FROM clusters WHERE project_id = ?1 ORDER BY id",
    )?;
    let mut clusters = stmt
        .query_map(params![project_id], |row| {
            let centroid: Vec<u8> = row.get(1)?;
            Ok(Cluster {
                id: row.get(0)?,
                project_id: project_id.to_string(),
                member_ids: Vec::new(),
                centroid: bytes_to_embedding(&centroid),
                stability: row.get::<_, f64>(2)? as f32,
                label: row.get(3)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()
        .with_context(|| format!("failed to load clusters for {project_id}"))?;

    let mut members =
        conn.prepare("SELECT memory_id FROM cluster_members WHERE cluster_id = ?1 ORDER BY memory_id")?;
    for cluster in &mut clusters {
        cluster.member_ids = members
            .query_map(params![cluster.id], |row| row.get(0))?
            .collect::<Result<Vec<String>, _>>()?;
    }
    Ok(clusters)
}

pub fn load_bridges(conn: &Connection, project_id: &str) -> Result<Vec<Bridge>> {
    let mut stmt = conn.prepare(
        "SELECT memory_id, cluster_ids FROM cluster_bridges WHERE project_id = ?1 ORDER BY memory_id",
    )?;
    let rows = stmt
        .query_map(params![project_id], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?
        .collect::<Result<Vec<_>, _>>()?;
    rows.into_iter()
        .map(|(memory_id, ids)| {
            Ok(Bridge {
                memory_id,
                project_id: project_id.to_string(),
                cluster_ids: serde_json::from_str(&ids)?,
            })
        })
        .collect()
}

/// Cluster ids that currently contain any of the given records.
pub(crate) fn clusters_containing(conn: &Connection, memory_ids: &[String]) -> Result<Vec<String>> {
    let mut stmt = conn.prepare("SELECT cluster_id FROM cluster_members WHERE memory_id = ?1")?;
    let mut ids = Vec::new();
    for memory_id in memory_ids {
        for id in stmt.query_map(params![memory_id], |row| row.get::<_, String>(0))? {
            ids.push(id?);
        }
    }
    ids.sort();
    ids.dedup();
    Ok(ids)
}

/// Recompute centroid and stability for clusters whose membership changed.
/// A cluster left with no members is dropped.
pub(crate) fn refresh_clusters(tx: &Transaction<'_>, cluster_ids: &[String]) -> Result<()> {
    let mut members = tx.prepare(
        "SELECT m.embedding, m.embedding_encoding FROM cluster_members cm \
         JOIN memories m ON m.id = cm.memory_id WHERE cm.cluster_id = ?1",
    )?;

    for cluster_id in cluster_ids {
        let rows = members
            .query_map(params![cluster_id], |row| {
                Ok((row.get::<_, Vec<u8>>(0)?, row.get::<_, String>(1)?))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        if rows.is_empty() {
            tx.execute("DELETE FROM clusters WHERE id = ?1", params![cluster_id])?;
            tracing::debug!(cluster_id, "dropped empty cluster");
            continue;
        }

        let embeddings = rows
            .iter()
            .map(|(bytes, encoding)| decode_embedding(encoding, bytes))
            .collect::<Result<Vec<_>>>()?;
        let refs: Vec<&[f32]> = embeddings.iter().map(Vec::as_slice).collect();
        let centroid = mean_vector(&refs);
        let stability = refs.iter().map(|e| cosine_similarity(e, &centroid)).sum::<f32>()
            / refs.len() as f32;

        tx.execute(
            "UPDATE clusters SET centroid = ?1, stability = ?2, updated_at = ?3 WHERE id = ?4",
            params![
                embedding_to_bytes(&centroid),
                stability as f64,
                fmt_ts(&Utc::now()),
                cluster_id
            ],
        )?;
        tracing::debug!(cluster_id, members = refs.len(), "recomputed cluster centroid");
    }
    Ok(())
}
