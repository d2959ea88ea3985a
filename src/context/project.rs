//! One project's in-memory working set.

use chrono::{DateTime, Utc};
use std::collections::HashMap;

use crate::error::MemoryError;
use crate::memory::patterns::ProjectSettings;
use crate::memory::search::{rank_candidates, QueryFilter};
use crate::memory::types::{MemoryRecord, Pattern, ScoredRecord};

#[derive(Debug, Clone)]
pub struct ProjectContext {
    pub project_id: String,
    memories: HashMap<String, MemoryRecord>,
    /// Whether `memories` is the whole project rather than its most recent subset.
    pub fully_loaded: bool,
    pub patterns: Vec<Pattern>,
    pub settings: ProjectSettings,
    pub loaded_at: DateTime<Utc>,
}

impl ProjectContext {
    pub fn new(
        project_id: impl Into<String>,
        memories: Vec<MemoryRecord>,
        fully_loaded: bool,
        patterns: Vec<Pattern>,
        settings: ProjectSettings,
    ) -> Self {
        Self {
            project_id: project_id.into(),
            memories: memories.into_iter().map(|m| (m.id.clone(), m)).collect(),
            fully_loaded,
            patterns,
            settings,
            loaded_at: Utc::now(),
        }
    }

    pub fn len(&self) -> usize {
        self.memories.len()
    }

    pub fn is_empty(&self) -> bool {
        self.memories.is_empty()
    }

    pub fn get(&self, id: &str) -> Option<&MemoryRecord> {
        self.memories.get(id)
    }

    pub fn memories(&self) -> impl Iterator<Item = &MemoryRecord> {
        self.memories.values()
    }

    /// Similarity floor for this project, falling back to `default`.
    pub fn similarity_threshold(&self, default: f32) -> f32 {
        self.settings.similarity_threshold.unwrap_or(default)
    }

    pub fn search(&self, query: &[f32], filter: &QueryFilter, limit: usize) -> Vec<ScoredRecord> {
        rank_candidates(self.memories.values(), query, filter, limit)
    }

    /// Add or replace a record, dropping the least recently accessed ones past `capacity`.
    pub fn insert(&mut self, record: MemoryRecord, capacity: usize) -> Result<(), MemoryError> {
        if record.project_id != self.project_id {
            return Err(MemoryError::IsolationViolation {
                record_id: record.id,
                expected: self.project_id.clone(),
                found: record.project_id,
            });
        }
        self.memories.insert(record.id.clone(), record);
        self.enforce_capacity(capacity);
        Ok(())
    }

    pub fn remove(&mut self, ids: &[String]) -> usize {
        ids.iter()
            .filter(|id| self.memories.remove(id.as_str()).is_some())
            .count()
    }

    /// Mirror a local access update onto the cached copies.
    pub fn touch(&mut self, ids: &[String], accessor: Option<&str>, at: DateTime<Utc>) {
        for id in ids {
            if let Some(record) = self.memories.get_mut(id) {
                record.access_count = record.access_count.saturating_add(1);
                if at > record.last_accessed_at {
                    record.last_accessed_at = at;
                }
                if let Some(user) = accessor {
                    record.metadata.accessed_by.insert(user.to_string());
                }
            }
        }
    }

    pub fn upsert_pattern(&mut self, pattern: Pattern) {
        match self.patterns.iter_mut().find(|p| p.hash == pattern.hash) {
            Some(existing) => *existing = pattern,
            None => self.patterns.push(pattern),
        }
    }

    fn enforce_capacity(&mut self, capacity: usize) {
        if self.memories.len() <= capacity {
            return;
        }
        let mut by_age: Vec<(DateTime<Utc>, String)> = self
            .memories
            .values()
            .map(|m| (m.last_accessed_at, m.id.clone()))
            .collect();
        by_age.sort();
        let excess = self.memories.len() - capacity;
        for (_, id) in by_age.into_iter().take(excess) {
            self.memories.remove(&id);
        }
        self.fully_loaded = false;
    }
}
