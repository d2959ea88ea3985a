//! Per-project working sets and the isolation boundary.
//!
//! Every project gets its own slot, guarded by its own lock. The project map lock is
//! only held to look up or insert a slot, so loading or evicting one project never
//! blocks searches in another. The active-project pointer has a separate mutex that is
//! held only for the swap itself.

pub mod patterns;
pub mod project;

use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{Mutex, RwLock};

use crate::config::IsolationConfig;
use crate::error::MemoryError;
use crate::memory::patterns::ProjectSettings;
use crate::memory::types::{MemoryRecord, Pattern};
use crate::monitor::PerformanceMonitor;
use crate::storage::LocalStore;
pub use project::ProjectContext;

struct ProjectSlot {
    context: RwLock<Option<ProjectContext>>,
    /// Unix millis of the last lookup.
    touched: AtomicI64,
}

impl ProjectSlot {
    fn new() -> Self {
        Self {
            context: RwLock::new(None),
            touched: AtomicI64::new(Utc::now().timestamp_millis()),
        }
    }

    fn touch(&self) {
        self.touched
            .store(Utc::now().timestamp_millis(), Ordering::Relaxed);
    }

    fn touched_at(&self) -> i64 {
        self.touched.load(Ordering::Relaxed)
    }
}

pub struct ContextIsolationManager {
    store: LocalStore,
    config: IsolationConfig,
    monitor: Arc<PerformanceMonitor>,
    contexts: RwLock<HashMap<String, Arc<ProjectSlot>>>,
    active: Mutex<Option<String>>,
}

impl ContextIsolationManager {
    pub fn new(store: LocalStore, config: IsolationConfig, monitor: Arc<PerformanceMonitor>) -> Self {
        Self {
            store,
            config,
            monitor,
            contexts: RwLock::new(HashMap::new()),
            active: Mutex::new(None),
        }
    }

    async fn slot(&self, project_id: &str) -> Arc<ProjectSlot> {
        if let Some(slot) = self.contexts.read().await.get(project_id) {
            return Arc::clone(slot);
        }
        let mut contexts = self.contexts.write().await;
        Arc::clone(
            contexts
                .entry(project_id.to_string())
                .or_insert_with(|| Arc::new(ProjectSlot::new())),
        )
    }

    /// Slot for `project_id` with its context loaded.
    async fn loaded(&self, project_id: &str) -> Result<Arc<ProjectSlot>> {
        let slot = self.slot(project_id).await;
        slot.touch();
        let hit = slot.context.read().await.is_some();
        self.monitor.record_cache(hit);
        if !hit {
            let mut guard = slot.context.write().await;
            if guard.is_none() {
                *guard = Some(self.load(project_id).await?);
            }
        }
        Ok(slot)
    }

    async fn load(&self, project_id: &str) -> Result<ProjectContext> {
        let (memories, fully_loaded) = self
            .store
            .load_project(project_id, self.config.max_loaded_memories)
            .await?;
        let patterns = self.store.load_patterns(project_id).await?;
        let settings = self.store.load_settings(project_id).await?.unwrap_or_default();
        tracing::debug!(
            project = project_id,
            memories = memories.len(),
            patterns = patterns.len(),
            fully_loaded,
            "loaded project context"
        );
        Ok(ProjectContext::new(project_id, memories, fully_loaded, patterns, settings))
    }

    /// Run `f` against the project's context, loading it on first use.
    pub async fn read<T>(&self, project_id: &str, f: impl FnOnce(&ProjectContext) -> T) -> Result<T> {
        let slot = self.loaded(project_id).await?;
        let guard = slot.context.read().await;
        guard
            .as_ref()
            .map(f)
            .ok_or_else(|| anyhow!("context for {project_id} is not loaded"))
    }

    pub async fn write<T>(
        &self,
        project_id: &str,
        f: impl FnOnce(&mut ProjectContext) -> T,
    ) -> Result<T> {
        let slot = self.loaded(project_id).await?;
        let mut guard = slot.context.write().await;
        guard
            .as_mut()
            .map(f)
            .ok_or_else(|| anyhow!("context for {project_id} is not loaded"))
    }

    /// Apply `f` only if the project is already cached. Never loads.
    async fn write_if_loaded(&self, project_id: &str, f: impl FnOnce(&mut ProjectContext)) {
        let slot = self.contexts.read().await.get(project_id).cloned();
        if let Some(slot) = slot {
            if let Some(ctx) = slot.context.write().await.as_mut() {
                f(ctx);
            }
        }
    }

    pub async fn active_project(&self) -> Option<String> {
        self.active.lock().await.clone()
    }

    /// Make `project_id` the active project. Returns the previously active one, whose
    /// state has been persisted.
    pub async fn switch_project(&self, project_id: &str) -> Result<Option<String>> {
        let started = Instant::now();
        self.loaded(project_id).await?;

        let previous = {
            let mut active = self.active.lock().await;
            active.replace(project_id.to_string())
        };
        if let Some(prev) = previous.as_deref().filter(|p| *p != project_id) {
            self.persist(prev).await?;
        }

        self.monitor.record_switch(started.elapsed());
        tracing::info!(
            from = previous.as_deref().unwrap_or("-"),
            to = project_id,
            "switched project"
        );
        Ok(previous)
    }

    /// Write the project's settings back to the local store, if it is cached.
    pub async fn persist(&self, project_id: &str) -> Result<()> {
        let slot = self.contexts.read().await.get(project_id).cloned();
        let Some(slot) = slot else {
            return Ok(());
        };
        let settings = slot.context.read().await.as_ref().map(|c| c.settings.clone());
        if let Some(settings) = settings {
            self.store
                .save_settings(project_id, settings, self.config.default_similarity_threshold)
                .await?;
        }
        Ok(())
    }

    /// Fail loudly if any record is outside `project_id`.
    pub fn verify_isolation<'a>(
        &self,
        project_id: &str,
        records: impl IntoIterator<Item = &'a MemoryRecord>,
    ) -> Result<(), MemoryError> {
        let leaked = records.into_iter().find(|r| r.project_id != project_id);
        self.monitor.record_isolation(leaked.is_none());
        match leaked {
            None => Ok(()),
            Some(record) => {
                tracing::error!(
                    record_id = %record.id,
                    expected = project_id,
                    found = %record.project_id,
                    "isolation violation: result crossed a project boundary"
                );
                Err(MemoryError::IsolationViolation {
                    record_id: record.id.clone(),
                    expected: project_id.to_string(),
                    found: record.project_id.clone(),
                })
            }
        }
    }

    pub async fn set_current_context(
        &self,
        project_id: &str,
        file: Option<String>,
        function: Option<String>,
    ) -> Result<()> {
        self.write(project_id, |ctx| {
            ctx.settings.current_file = file;
            ctx.settings.current_function = function;
        })
        .await?;
        self.persist(project_id).await
    }

    /// Replace the project's settings, keeping the current file and function.
    pub async fn configure(&self, project_id: &str, settings: ProjectSettings) -> Result<()> {
        self.write(project_id, |ctx| {
            let current_file = ctx.settings.current_file.take();
            let current_function = ctx.settings.current_function.take();
            ctx.settings = ProjectSettings {
                current_file,
                current_function,
                ..settings
            };
        })
        .await?;
        self.persist(project_id).await
    }

    /// Fold one workflow observation into the project's pattern space.
    pub async fn record_pattern(
        &self,
        project_id: &str,
        trigger: &[f32],
        actions: &[String],
        outcome: f32,
    ) -> Result<Pattern> {
        if actions.is_empty() {
            return Err(anyhow!("a workflow pattern needs at least one action"));
        }
        let hash = patterns::action_hash(actions);
        let pattern = self
            .write(project_id, |ctx| {
                let previous = ctx.patterns.iter().find(|p| p.hash == hash);
                let updated =
                    patterns::observe(previous, project_id, trigger, actions, outcome, Utc::now());
                ctx.upsert_pattern(updated.clone());
                updated
            })
            .await?;
        self.store.upsert_pattern(pattern.clone()).await?;
        if pattern.auto_apply {
            tracing::debug!(project = project_id, hash = %pattern.hash, "pattern eligible for auto-apply");
        }
        Ok(pattern)
    }

    /// Add a freshly stored record to its project's cache, if cached.
    pub async fn cache_insert(&self, record: &MemoryRecord) -> Result<(), MemoryError> {
        let capacity = self.config.max_loaded_memories;
        let slot = self.contexts.read().await.get(&record.project_id).cloned();
        if let Some(slot) = slot {
            if let Some(ctx) = slot.context.write().await.as_mut() {
                ctx.insert(record.clone(), capacity)?;
            }
        }
        Ok(())
    }

    pub async fn cache_remove(&self, project_id: &str, ids: &[String]) {
        self.write_if_loaded(project_id, |ctx| {
            ctx.remove(ids);
        })
        .await;
    }

    pub async fn cache_touch(
        &self,
        project_id: &str,
        ids: &[String],
        accessor: Option<&str>,
        at: DateTime<Utc>,
    ) {
        self.write_if_loaded(project_id, |ctx| ctx.touch(ids, accessor, at))
            .await;
    }

    /// Rebuild a cached context from the local store and swap it in.
    ///
    /// Used after background jobs rewrite a project; readers see either the old or the
    /// new working set, never a mix.
    pub async fn reload(&self, project_id: &str) -> Result<()> {
        let slot = self.contexts.read().await.get(project_id).cloned();
        let Some(slot) = slot else {
            return Ok(());
        };
        let mut fresh = self.load(project_id).await?;
        let mut guard = slot.context.write().await;
        if let Some(current) = guard.as_ref() {
            fresh.settings = current.settings.clone();
        }
        *guard = Some(fresh);
        Ok(())
    }

    /// Drop contexts idle for longer than the configured window times `ttl_multiplier`.
    /// The active project is never evicted. Returns the evicted project ids.
    pub async fn evict_idle(&self, ttl_multiplier: f64) -> Result<Vec<String>> {
        let ttl_ms = (self.config.idle_eviction_secs as f64 * 1000.0 * ttl_multiplier) as i64;
        let cutoff = Utc::now().timestamp_millis() - ttl_ms;
        let active = self.active_project().await;

        let idle: Vec<String> = self
            .contexts
            .read()
            .await
            .iter()
            .filter(|(id, slot)| slot.touched_at() <= cutoff && active.as_deref() != Some(id.as_str()))
            .map(|(id, _)| id.clone())
            .collect();

        let mut evicted = Vec::new();
        for project_id in idle {
            self.persist(&project_id).await?;
            let mut contexts = self.contexts.write().await;
            // Skip projects touched while their settings were being saved.
            if contexts
                .get(&project_id)
                .is_some_and(|slot| slot.touched_at() <= cutoff)
            {
                contexts.remove(&project_id);
                evicted.push(project_id);
            }
        }
        if !evicted.is_empty() {
            tracing::info!(count = evicted.len(), projects = ?evicted, "evicted idle contexts");
        }
        Ok(evicted)
    }

    /// Ids of every cached project, sorted.
    pub async fn loaded_projects(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.contexts.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }
}
