//! Density clustering over one project's records.
//!
//! Pure computation: takes the current records and the previously persisted clusters
//! and returns the replacement set. Record order is normalized by id so the result does
//! not depend on the order rows came back from storage.

use std::collections::{HashMap, VecDeque};

use super::label::label_for;
use crate::config::ClusteringConfig;
use crate::memory::types::{Bridge, Cluster, MemoryRecord};
use crate::memory::{cosine_similarity, mean_vector};

const KMEANS_ROUNDS: usize = 8;

struct Draft {
    id: Option<String>,
    members: Vec<usize>,
}

pub struct Clustering {
    pub clusters: Vec<Cluster>,
    pub bridges: Vec<Bridge>,
}

fn centroid_of(records: &[&MemoryRecord], members: &[usize]) -> Vec<f32> {
    let vectors: Vec<&[f32]> = members.iter().map(|&i| records[i].embedding.as_slice()).collect();
    mean_vector(&vectors)
}

/// Recompute every cluster of a project from scratch.
pub fn recluster(
    project_id: &str,
    records: &[MemoryRecord],
    existing: &[Cluster],
    config: &ClusteringConfig,
) -> Clustering {
    let dims = records.first().map_or(0, |r| r.embedding.len());
    let mut sorted: Vec<&MemoryRecord> = records
        .iter()
        .filter(|r| r.project_id == project_id && r.embedding.len() == dims)
        .collect();
    sorted.sort_by(|a, b| a.id.cmp(&b.id));
    let records = sorted;
    let index: HashMap<&str, usize> = records
        .iter()
        .enumerate()
        .map(|(i, r)| (r.id.as_str(), i))
        .collect();

    let min_size = config.min_cluster_size.max(2);
    let max_size = config.max_cluster_size.max(min_size);
    let mut assigned = vec![false; records.len()];

    // 1. Existing clusters keep their ids; those that shrank below the minimum dissolve.
    let mut drafts: Vec<Draft> = Vec::new();
    for cluster in existing {
        let members: Vec<usize> = cluster
            .member_ids
            .iter()
            .filter_map(|id| index.get(id.as_str()).copied())
            .filter(|&i| !assigned[i])
            .collect();
        if members.len() < min_size {
            continue;
        }
        for &i in &members {
            assigned[i] = true;
        }
        drafts.push(Draft {
            id: Some(cluster.id.clone()),
            members,
        });
    }

    // 2. Attach unclustered records to the nearest existing centroid.
    let centroids: Vec<Vec<f32>> = drafts
        .iter()
        .map(|d| centroid_of(&records, &d.members))
        .collect();
    for i in 0..records.len() {
        if assigned[i] {
            continue;
        }
        let best = centroids
            .iter()
            .enumerate()
            .map(|(c, centroid)| (c, cosine_similarity(&records[i].embedding, centroid)))
            .filter(|(c, sim)| *sim >= config.similarity_threshold && drafts[*c].members.len() < max_size)
            .max_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal));
        if let Some((c, _)) = best {
            drafts[c].members.push(i);
            assigned[i] = true;
        }
    }

    // 3. Density expansion over what is left.
    let free: Vec<usize> = (0..records.len()).filter(|&i| !assigned[i]).collect();
    let mut neighbours: HashMap<usize, Vec<usize>> = HashMap::new();
    for (a_pos, &a) in free.iter().enumerate() {
        for &b in &free[a_pos + 1..] {
            if cosine_similarity(&records[a].embedding, &records[b].embedding)
                >= config.similarity_threshold
            {
                neighbours.entry(a).or_default().push(b);
                neighbours.entry(b).or_default().push(a);
            }
        }
    }
    let is_core = |i: usize| neighbours.get(&i).map_or(0, Vec::len) + 1 >= min_size;

    for &seed in &free {
        if assigned[seed] || !is_core(seed) {
            continue;
        }
        let mut members = vec![seed];
        assigned[seed] = true;
        let mut queue = VecDeque::from([seed]);
        while let Some(p) = queue.pop_front() {
            if !is_core(p) {
                continue;
            }
            for &n in neighbours.get(&p).into_iter().flatten() {
                if !assigned[n] {
                    assigned[n] = true;
                    members.push(n);
                    queue.push_back(n);
                }
            }
        }
        for part in split_oversized(&records, members, max_size) {
            if part.len() >= min_size {
                drafts.push(Draft { id: None, members: part });
            }
        }
    }

    // 4. Merge clusters whose centroids nearly coincide, when the union fits.
    merge_close(&records, &mut drafts, config.merge_threshold, max_size);

    // 5. Finalize.
    let clusters: Vec<Cluster> = drafts
        .into_iter()
        .map(|d| {
            let centroid = centroid_of(&records, &d.members);
            let member_records: Vec<&MemoryRecord> = d.members.iter().map(|&i| records[i]).collect();
            let stability = member_records
                .iter()
                .map(|r| cosine_similarity(&r.embedding, &centroid))
                .sum::<f32>()
                / member_records.len().max(1) as f32;
            Cluster {
                id: d.id.unwrap_or_else(|| uuid::Uuid::now_v7().to_string()),
                project_id: project_id.to_string(),
                member_ids: member_records.iter().map(|r| r.id.clone()).collect(),
                label: label_for(&member_records),
                centroid,
                stability,
            }
        })
        .collect();

    let bridges = find_bridges(project_id, &records, &clusters, config.bridge_threshold);
    Clustering { clusters, bridges }
}

/// Recursively bisect `members` with 2-means until every part fits `max_size`.
fn split_oversized(records: &[&MemoryRecord], members: Vec<usize>, max_size: usize) -> Vec<Vec<usize>> {
    if members.len() <= max_size {
        return vec![members];
    }
    let (left, right) = bisect(records, &members);
    if left.is_empty() || right.is_empty() {
        // Identical vectors cannot be separated; cut by position instead.
        return members.chunks(max_size).map(<[usize]>::to_vec).collect();
    }
    let mut parts = split_oversized(records, left, max_size);
    parts.extend(split_oversized(records, right, max_size));
    parts
}

/// 2-means seeded with the least similar pair.
fn bisect(records: &[&MemoryRecord], members: &[usize]) -> (Vec<usize>, Vec<usize>) {
    let mut seeds = (members[0], members[1]);
    let mut lowest = f32::MAX;
    for (pos, &a) in members.iter().enumerate() {
        for &b in &members[pos + 1..] {
            let sim = cosine_similarity(&records[a].embedding, &records[b].embedding);
            if sim < lowest {
                lowest = sim;
                seeds = (a, b);
            }
        }
    }

    let mut c_left = records[seeds.0].embedding.clone();
    let mut c_right = records[seeds.1].embedding.clone();
    let mut left = Vec::new();
    let mut right = Vec::new();
    for _ in 0..KMEANS_ROUNDS {
        left.clear();
        right.clear();
        for &i in members {
            let e = &records[i].embedding;
            if cosine_similarity(e, &c_left) >= cosine_similarity(e, &c_right) {
                left.push(i);
            } else {
                right.push(i);
            }
        }
        if left.is_empty() || right.is_empty() {
            break;
        }
        let next_left = centroid_of(records, &left);
        let next_right = centroid_of(records, &right);
        if next_left == c_left && next_right == c_right {
            break;
        }
        c_left = next_left;
        c_right = next_right;
    }
    (left, right)
}

fn merge_close(records: &[&MemoryRecord], drafts: &mut Vec<Draft>, threshold: f32, max_size: usize) {
    loop {
        let centroids: Vec<Vec<f32>> = drafts.iter().map(|d| centroid_of(records, &d.members)).collect();
        let mut pair = None;
        'search: for a in 0..drafts.len() {
            for b in a + 1..drafts.len() {
                if drafts[a].members.len() + drafts[b].members.len() <= max_size
                    && cosine_similarity(&centroids[a], &centroids[b]) >= threshold
                {
                    pair = Some((a, b));
                    break 'search;
                }
            }
        }
        let Some((a, b)) = pair else {
            return;
        };
        let absorbed = drafts.remove(b);
        drafts[a].members.extend(absorbed.members);
        if drafts[a].id.is_none() {
            drafts[a].id = absorbed.id;
        }
    }
}

fn find_bridges(
    project_id: &str,
    records: &[&MemoryRecord],
    clusters: &[Cluster],
    threshold: f32,
) -> Vec<Bridge> {
    records
        .iter()
        .filter_map(|r| {
            let near: Vec<String> = clusters
                .iter()
                .filter(|c| cosine_similarity(&r.embedding, &c.centroid) >= threshold)
                .map(|c| c.id.clone())
                .collect();
            (near.len() >= 2).then(|| Bridge {
                memory_id: r.id.clone(),
                project_id: project_id.to_string(),
                cluster_ids: near,
            })
        })
        .collect()
}
