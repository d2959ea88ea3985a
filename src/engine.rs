//! The `MemoryEngine` facade.
//!
//! Every call takes an explicit [`RequestContext`]; the engine holds no ambient
//! session state. Writes land in the local store (row and outbox in one transaction)
//! and return; the remote tier is reached only by the sync engine and by bounded,
//! best-effort reads.

use chrono::Utc;
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::clock::HybridClock;
use crate::cluster::{ClusterReport, SemanticClusterer};
use crate::config::StrataConfig;
use crate::context::ContextIsolationManager;
use crate::embedding::{create_provider, EmbeddingProvider};
use crate::error::{MemoryError, Result};
use crate::memory::forget::DeleteReason;
use crate::memory::patterns::ProjectSettings;
use crate::memory::search::QueryFilter;
use crate::memory::stats::ProjectStats;
use crate::memory::types::{
    InteractionType, MemoryMetadata, MemoryRecord, Pattern, RequestContext, ResultSource,
    ScoredRecord, StoreTier, SyncQueueItem, SyncState,
};
use crate::monitor::{DegradationMode, MetricsSnapshot, PerformanceMonitor};
use crate::optimizer::{MemoryOptimizer, OptimizationReport};
use crate::prioritizer::{PatternMatch, Prioritizer, RankingContext};
use crate::scheduler::{JobKey, JobKind, Scheduler, SingleFlight};
use crate::storage::{create_remote, LocalStore, SharedStore, StorageAdapter};
use crate::sync::conflict::reconcile;
use crate::sync::{OutboxStats, SyncEngine, SyncReport};

/// What to store alongside the content.
#[derive(Debug, Clone)]
pub struct StoreRequest {
    pub interaction_type: InteractionType,
    pub metadata: MemoryMetadata,
    pub tool_chain: Vec<String>,
    pub file_paths: Vec<String>,
    /// Defaults to 0.5.
    pub success_score: Option<f32>,
}

impl Default for StoreRequest {
    fn default() -> Self {
        Self::new(InteractionType::Conversation)
    }
}

impl StoreRequest {
    pub fn new(interaction_type: InteractionType) -> Self {
        Self {
            interaction_type,
            metadata: MemoryMetadata::default(),
            tool_chain: Vec::new(),
            file_paths: Vec::new(),
            success_score: None,
        }
    }

    pub fn with_metadata(mut self, metadata: MemoryMetadata) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn with_tools(mut self, tools: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.tool_chain = tools.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_files(mut self, files: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.file_paths = files.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_success(mut self, score: f32) -> Self {
        self.success_score = Some(score);
        self
    }
}

#[derive(Debug, Clone, Default)]
pub struct SearchOptions {
    /// Defaults to `retrieval.default_limit`.
    pub limit: Option<usize>,
    /// Overrides the project's similarity threshold.
    pub min_similarity: Option<f32>,
    pub interaction_types: Vec<InteractionType>,
    pub exclude_deprecated: bool,
    /// Override the project's current file for this query only.
    pub current_file: Option<String>,
    pub current_function: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SearchResult {
    pub record: MemoryRecord,
    pub similarity: f32,
    pub boost: f32,
    pub score: f32,
    pub source: ResultSource,
}

#[derive(Debug, Clone, Serialize)]
pub struct SearchResponse {
    pub results: Vec<SearchResult>,
    pub patterns: Vec<PatternMatch>,
    /// Served without the remote tier (degradation mode, timeout, or remote error).
    pub degraded: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct EngineMetrics {
    #[serde(flatten)]
    pub monitor: MetricsSnapshot,
    pub outbox: OutboxStats,
    pub loaded_projects: Vec<String>,
}

/// Bounded LRU of query text to embedding. Cleared on project switch.
struct QueryCache {
    capacity: usize,
    entries: HashMap<String, Vec<f32>>,
    order: VecDeque<String>,
}

impl QueryCache {
    fn new(capacity: usize) -> Self {
        Self {
            capacity,
            entries: HashMap::new(),
            order: VecDeque::new(),
        }
    }

    fn get(&mut self, key: &str) -> Option<Vec<f32>> {
        let hit = self.entries.get(key).cloned()?;
        if let Some(pos) = self.order.iter().position(|k| k == key) {
            if let Some(k) = self.order.remove(pos) {
                self.order.push_back(k);
            }
        }
        Some(hit)
    }

    fn insert(&mut self, key: String, embedding: Vec<f32>) {
        if self.capacity == 0 {
            return;
        }
        if self.entries.insert(key.clone(), embedding).is_none() {
            self.order.push_back(key);
        }
        while self.order.len() > self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.entries.remove(&oldest);
            }
        }
    }

    fn clear(&mut self) {
        self.entries.clear();
        self.order.clear();
    }
}

struct Candidate {
    scored: ScoredRecord,
    source: ResultSource,
}

pub struct MemoryEngine {
    config: StrataConfig,
    embedder: Arc<dyn EmbeddingProvider>,
    local: LocalStore,
    remote: Option<SharedStore>,
    monitor: Arc<PerformanceMonitor>,
    contexts: ContextIsolationManager,
    prioritizer: Prioritizer,
    optimizer: MemoryOptimizer,
    clusterer: SemanticClusterer,
    sync: SyncEngine,
    clock: Arc<HybridClock>,
    flights: Arc<SingleFlight>,
    query_cache: Mutex<QueryCache>,
}

impl MemoryEngine {
    /// Open the configured database, embedding provider, and remote tier.
    pub async fn open(config: StrataConfig) -> Result<Self> {
        let local = LocalStore::open(config.resolved_db_path())?;
        let embedder: Arc<dyn EmbeddingProvider> = Arc::from(create_provider(&config.embedding)?);
        let remote = create_remote(&config.remote)?;
        Self::new(config, local, embedder, remote).await
    }

    /// Assemble an engine from explicit parts. Requeues sync items left in flight.
    pub async fn new(
        config: StrataConfig,
        local: LocalStore,
        embedder: Arc<dyn EmbeddingProvider>,
        remote: Option<SharedStore>,
    ) -> Result<Self> {
        if let Some(previous) = local.ensure_embedding_model(embedder.model_id()).await? {
            tracing::warn!(
                stored = %previous,
                current = embedder.model_id(),
                "embedding model changed; existing vectors may not be comparable"
            );
        }

        let clock = Arc::new(HybridClock::new());
        let monitor = Arc::new(PerformanceMonitor::new(config.monitor.clone()));
        let contexts =
            ContextIsolationManager::new(local.clone(), config.isolation.clone(), Arc::clone(&monitor));
        let optimizer = MemoryOptimizer::new(
            local.clone(),
            config.optimizer.clone(),
            Arc::clone(&clock),
            Arc::clone(&monitor),
        );
        let clusterer = SemanticClusterer::new(local.clone(), config.clustering.clone());
        let sync = SyncEngine::new(
            local.clone(),
            remote.clone(),
            config.sync.clone(),
            config.remote.timeout(),
            Arc::clone(&clock),
            Arc::clone(&monitor),
        );
        sync.recover().await?;

        tracing::info!(
            embedder = embedder.model_id(),
            dimensions = embedder.dimensions(),
            remote = remote.as_ref().map_or("none", |r| r.name()),
            "memory engine ready"
        );

        Ok(Self {
            prioritizer: Prioritizer::new(config.prioritizer.clone()),
            query_cache: Mutex::new(QueryCache::new(config.retrieval.query_cache_size)),
            config,
            embedder,
            local,
            remote,
            monitor,
            contexts,
            optimizer,
            clusterer,
            sync,
            clock,
            flights: Arc::new(SingleFlight::new()),
        })
    }

    pub fn config(&self) -> &StrataConfig {
        &self.config
    }

    pub fn monitor(&self) -> &PerformanceMonitor {
        &self.monitor
    }

    pub fn local(&self) -> &LocalStore {
        &self.local
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let embedder = Arc::clone(&self.embedder);
        let text = text.to_string();
        let embedding = tokio::task::spawn_blocking(move || embedder.embed(&text))
            .await
            .map_err(|e| MemoryError::EmbeddingFailure(format!("embedding task failed: {e}")))?
            .map_err(|e| MemoryError::EmbeddingFailure(format!("{e:#}")))?;

        let expected = self.embedder.dimensions();
        if embedding.len() != expected {
            return Err(MemoryError::DimensionMismatch {
                expected,
                actual: embedding.len(),
            });
        }
        Ok(embedding)
    }

    async fn query_embedding(&self, query: &str) -> Result<Vec<f32>> {
        let cached = self
            .query_cache
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(query);
        if let Some(embedding) = cached {
            return Ok(embedding);
        }
        let embedding = self.embed(query).await?;
        self.query_cache
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(query.to_string(), embedding.clone());
        Ok(embedding)
    }

    /// Embed and durably store one memory.
    ///
    /// Nothing is written if embedding fails. A non-empty tool chain is also learned as
    /// a workflow pattern.
    pub async fn store(
        &self,
        ctx: &RequestContext,
        content: &str,
        request: StoreRequest,
    ) -> Result<MemoryRecord> {
        let content = content.trim();
        if content.is_empty() {
            return Err(MemoryError::EmptyContent);
        }
        let embedding = self.embed(content).await?;

        let now = Utc::now();
        let success_score = request.success_score.unwrap_or(0.5).clamp(0.0, 1.0);
        let mut record = MemoryRecord {
            id: uuid::Uuid::now_v7().to_string(),
            project_id: ctx.project_id.clone(),
            content: content.to_string(),
            embedding,
            metadata: request.metadata,
            interaction_type: request.interaction_type,
            tool_chain: request.tool_chain,
            file_paths: request.file_paths,
            success_score,
            created_at: now,
            last_accessed_at: now,
            access_count: 1,
            sync_state: SyncState::New,
            version: self.clock.now(),
            compressed: false,
        };

        self.local.put(&record).await?;
        record.sync_state = SyncState::Queued;
        self.contexts.cache_insert(&record).await?;

        if !record.tool_chain.is_empty() {
            if let Err(e) = self
                .contexts
                .record_pattern(&ctx.project_id, &record.embedding, &record.tool_chain, success_score)
                .await
            {
                tracing::warn!(project = %ctx.project_id, error = %e, "failed to learn workflow pattern");
            }
        }

        tracing::info!(
            id = %record.id,
            project = %ctx.project_id,
            session = ctx.session_id.as_deref().unwrap_or("-"),
            kind = %record.interaction_type,
            "memory stored"
        );
        Ok(record)
    }

    /// Ranked, project-scoped retrieval across both tiers.
    pub async fn search(
        &self,
        ctx: &RequestContext,
        query: &str,
        options: SearchOptions,
    ) -> Result<SearchResponse> {
        let started = Instant::now();
        let query = query.trim();
        if query.is_empty() {
            return Err(MemoryError::EmptyQuery);
        }
        let embedding = self.query_embedding(query).await?;

        let mode = self.monitor.degradation();
        let limit = options
            .limit
            .unwrap_or(self.config.retrieval.default_limit)
            .max(1);
        let fetch = limit * self.config.retrieval.candidate_multiplier.max(1);
        let filter = QueryFilter {
            project_id: ctx.project_id.clone(),
            min_similarity: -1.0,
            interaction_types: options.interaction_types.clone(),
            exclude_deprecated: options.exclude_deprecated,
        };

        let default_threshold = self.config.isolation.default_similarity_threshold;
        let (cached_hits, settings, patterns, threshold) = self
            .contexts
            .read(&ctx.project_id, |pc| {
                (
                    pc.fully_loaded.then(|| pc.search(&embedding, &filter, fetch)),
                    pc.settings.clone(),
                    pc.patterns.clone(),
                    pc.similarity_threshold(default_threshold),
                )
            })
            .await?;

        let local_query = async {
            match cached_hits {
                Some(hits) => Ok(hits),
                None => self.local.query(&embedding, &filter, fetch).await,
            }
        };
        let remote_query = self.query_remote(&embedding, &filter, fetch, mode);
        let (local_hits, (remote_hits, remote_ok)) = tokio::join!(local_query, remote_query);
        let local_hits = local_hits?;

        let candidates = merge_tiers(local_hits, remote_hits);
        self.contexts
            .verify_isolation(&ctx.project_id, candidates.iter().map(|c| &c.scored.record))?;

        let floor = options.min_similarity.unwrap_or(threshold);
        let mut sources: HashMap<String, ResultSource> = HashMap::new();
        let scored: Vec<ScoredRecord> = candidates
            .into_iter()
            .filter(|c| c.scored.similarity >= floor)
            .map(|c| {
                sources.insert(c.scored.record.id.clone(), c.source);
                c.scored
            })
            .collect();

        let mut ranking = RankingContext::from_settings(&settings, &patterns);
        if let Some(file) = options.current_file.as_deref() {
            ranking.current_file = Some(file);
        }
        if let Some(function) = options.current_function.as_deref() {
            ranking.current_function = Some(function);
        }
        let now = Utc::now();
        let mut ranked = self.prioritizer.rank(scored, &ranking, now);
        ranked.truncate(limit);

        let results: Vec<SearchResult> = ranked
            .into_iter()
            .map(|p| SearchResult {
                source: sources
                    .remove(&p.record.id)
                    .unwrap_or(ResultSource::Local),
                record: p.record,
                similarity: p.similarity,
                boost: p.boost,
                score: p.score,
            })
            .collect();

        let accessed: Vec<String> = results
            .iter()
            .filter(|r| r.source != ResultSource::Remote)
            .map(|r| r.record.id.clone())
            .collect();
        if !accessed.is_empty() {
            self.local
                .record_access(accessed.clone(), ctx.user_id.clone(), now)
                .await?;
            self.contexts
                .cache_touch(&ctx.project_id, &accessed, ctx.user_id.as_deref(), now)
                .await;
        }

        let patterns = self
            .prioritizer
            .top_patterns(&patterns, &embedding, self.config.retrieval.max_patterns);

        let elapsed = started.elapsed();
        self.monitor.record_retrieval(elapsed);
        tracing::debug!(
            project = %ctx.project_id,
            results = results.len(),
            patterns = patterns.len(),
            elapsed_ms = elapsed.as_millis() as u64,
            "search complete"
        );

        Ok(SearchResponse {
            results,
            patterns,
            degraded: mode.active || !remote_ok,
        })
    }

    /// Best-effort remote query. Returns the hits and whether the remote answered.
    async fn query_remote(
        &self,
        embedding: &[f32],
        filter: &QueryFilter,
        limit: usize,
        mode: DegradationMode,
    ) -> (Vec<ScoredRecord>, bool) {
        let Some(remote) = self.remote.as_ref() else {
            return (Vec::new(), true);
        };
        if mode.local_only {
            return (Vec::new(), false);
        }
        let timeout = self.config.remote.timeout();
        match tokio::time::timeout(timeout, remote.query(embedding, filter, limit)).await {
            Ok(Ok(hits)) => (hits, true),
            Ok(Err(e)) => {
                let err = MemoryError::TransientIo(format!("{e:#}"));
                tracing::warn!(remote = remote.name(), error = %err, "serving local-only results");
                (Vec::new(), false)
            }
            Err(_) => {
                self.monitor.record_remote_timeout();
                tracing::warn!(
                    remote = remote.name(),
                    timeout_ms = timeout.as_millis() as u64,
                    "remote query timed out; serving local-only results"
                );
                (Vec::new(), false)
            }
        }
    }

    /// Fetch one record of the caller's project.
    pub async fn get_by_id(&self, ctx: &RequestContext, id: &str) -> Result<Option<MemoryRecord>> {
        let mut found = self.local.get_by_id(id).await?;
        if found.is_none() && !self.monitor.degradation().local_only {
            if let Some(remote) = self.remote.as_ref() {
                match tokio::time::timeout(self.config.remote.timeout(), remote.get_by_id(id)).await {
                    Ok(Ok(record)) => found = record,
                    Ok(Err(e)) => tracing::warn!(id, error = %e, "remote lookup failed"),
                    Err(_) => self.monitor.record_remote_timeout(),
                }
            }
        }
        if let Some(record) = &found {
            self.contexts
                .verify_isolation(&ctx.project_id, std::iter::once(record))?;
        }
        Ok(found)
    }

    /// Delete one record of the caller's project. Returns whether it existed.
    pub async fn delete(&self, ctx: &RequestContext, id: &str) -> Result<bool> {
        let Some(record) = self.local.get_by_id(id).await? else {
            return Ok(false);
        };
        self.contexts
            .verify_isolation(&ctx.project_id, std::iter::once(&record))?;
        let removed = self
            .local
            .delete_many(vec![id.to_string()], DeleteReason::Requested)
            .await?;
        self.contexts
            .cache_remove(&ctx.project_id, &[id.to_string()])
            .await;
        tracing::info!(id, project = %ctx.project_id, "memory deleted");
        Ok(removed > 0)
    }

    /// Make `project_id` active. Clears caches that are not project-scoped.
    pub async fn switch_project(&self, project_id: &str) -> Result<Option<String>> {
        let previous = self.contexts.switch_project(project_id).await?;
        if previous.as_deref() != Some(project_id) {
            self.query_cache
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .clear();
        }
        Ok(previous)
    }

    pub async fn active_project(&self) -> Option<String> {
        self.contexts.active_project().await
    }

    pub async fn set_current_context(
        &self,
        ctx: &RequestContext,
        file: Option<String>,
        function: Option<String>,
    ) -> Result<()> {
        self.contexts
            .set_current_context(&ctx.project_id, file, function)
            .await?;
        Ok(())
    }

    /// Replace the project's declared settings (language, framework, threshold).
    pub async fn configure_project(&self, ctx: &RequestContext, settings: ProjectSettings) -> Result<()> {
        self.contexts.configure(&ctx.project_id, settings).await?;
        Ok(())
    }

    /// Record an explicit workflow observation.
    pub async fn record_pattern(
        &self,
        ctx: &RequestContext,
        trigger: &str,
        actions: &[String],
        outcome: f32,
    ) -> Result<Pattern> {
        let trigger = trigger.trim();
        if trigger.is_empty() {
            return Err(MemoryError::EmptyQuery);
        }
        let embedding = self.embed(trigger).await?;
        Ok(self
            .contexts
            .record_pattern(&ctx.project_id, &embedding, actions, outcome)
            .await?)
    }

    /// Push one batch of outbox items. `None` if a cycle is already running.
    pub async fn run_sync_cycle(&self) -> Result<Option<SyncReport>> {
        let Some(_guard) = self.flights.try_acquire(JobKey::global(JobKind::Sync)) else {
            return Ok(None);
        };
        Ok(Some(self.sync.run_cycle().await?))
    }

    pub async fn optimize_project(&self, project_id: &str) -> Result<Option<OptimizationReport>> {
        self.optimize_project_with(project_id, &CancellationToken::new())
            .await
    }

    /// Optimize one project unless it is already being optimized.
    pub async fn optimize_project_with(
        &self,
        project_id: &str,
        cancel: &CancellationToken,
    ) -> Result<Option<OptimizationReport>> {
        let Some(_guard) = self
            .flights
            .try_acquire(JobKey::project(JobKind::Optimize, project_id))
        else {
            tracing::debug!(project = project_id, "optimizer already running");
            return Ok(None);
        };
        let report = self
            .optimizer
            .optimize_project(project_id, self.monitor.degradation(), cancel)
            .await?;
        self.contexts.reload(project_id).await?;
        Ok(Some(report))
    }

    pub async fn cluster_project(&self, project_id: &str) -> Result<Option<ClusterReport>> {
        self.cluster_project_with(project_id, &CancellationToken::new())
            .await
    }

    /// Recluster one project unless it is already being clustered.
    pub async fn cluster_project_with(
        &self,
        project_id: &str,
        cancel: &CancellationToken,
    ) -> Result<Option<ClusterReport>> {
        let Some(_guard) = self
            .flights
            .try_acquire(JobKey::project(JobKind::Cluster, project_id))
        else {
            tracing::debug!(project = project_id, "clusterer already running");
            return Ok(None);
        };
        Ok(Some(
            self.clusterer
                .cluster_project(project_id, self.monitor.degradation(), cancel)
                .await?,
        ))
    }

    pub async fn evict_idle_contexts(&self) -> Result<Vec<String>> {
        let multiplier = self.monitor.degradation().ttl_multiplier;
        Ok(self.contexts.evict_idle(multiplier).await?)
    }

    /// Spawn the periodic jobs. Call [`Scheduler::shutdown`] to stop them.
    pub fn start_background(self: &Arc<Self>) -> Scheduler {
        Scheduler::start(Arc::clone(self))
    }

    pub async fn get_metrics(&self) -> Result<EngineMetrics> {
        Ok(EngineMetrics {
            monitor: self.monitor.snapshot(),
            outbox: self.sync.stats().await?,
            loaded_projects: self.contexts.loaded_projects().await,
        })
    }

    pub async fn projects(&self) -> Result<Vec<String>> {
        Ok(self.local.list_projects().await?)
    }

    pub async fn project_stats(&self, project_id: &str) -> Result<ProjectStats> {
        Ok(self.local.project_stats(project_id).await?)
    }

    pub async fn dead_letters(&self, limit: usize) -> Result<Vec<SyncQueueItem>> {
        Ok(self.sync.dead_letters(limit).await?)
    }

    pub async fn requeue_dead_letters(&self) -> Result<usize> {
        Ok(self.sync.requeue_dead_letters().await?)
    }
}

/// Merge local and remote hits by id. Local copies win the record body only when the
/// per-field reconciliation says so; similarity is the better of the two.
fn merge_tiers(local: Vec<ScoredRecord>, remote: Vec<ScoredRecord>) -> Vec<Candidate> {
    let mut by_id: HashMap<String, Candidate> = HashMap::new();
    let mut order: Vec<String> = Vec::new();
    for scored in local {
        order.push(scored.record.id.clone());
        by_id.insert(
            scored.record.id.clone(),
            Candidate {
                scored,
                source: ResultSource::Local,
            },
        );
    }
    for theirs in remote {
        match by_id.get_mut(&theirs.record.id) {
            Some(existing) => {
                let merged = reconcile(&existing.scored.record, &theirs.record);
                existing.scored.record = merged.record;
                existing.scored.similarity = existing.scored.similarity.max(theirs.similarity);
                existing.source = ResultSource::Merged {
                    contributors: vec![StoreTier::Local, StoreTier::Remote],
                };
            }
            None => {
                order.push(theirs.record.id.clone());
                by_id.insert(
                    theirs.record.id.clone(),
                    Candidate {
                        scored: theirs,
                        source: ResultSource::Remote,
                    },
                );
            }
        }
    }
    order
        .into_iter()
        .filter_map(|id| by_id.remove(&id))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::store::tests::sample_record;

    #[test]
    fn query_cache_evicts_least_recently_used() {
        let mut cache = QueryCache::new(2);
        cache.insert("a".into(), vec![1.0]);
        cache.insert("b".into(), vec![2.0]);
        assert!(cache.get("a").is_some());
        cache.insert("c".into(), vec![3.0]);
        assert!(cache.get("b").is_none());
        assert!(cache.get("a").is_some());
        assert!(cache.get("c").is_some());
    }

    #[test]
    fn merge_tiers_tags_sources() {
        let shared = sample_record("alpha", "both", vec![1.0, 0.0]);
        let local_only = sample_record("alpha", "mine", vec![1.0, 0.0]);
        let remote_only = sample_record("alpha", "theirs", vec![1.0, 0.0]);
        let hit = |r: &MemoryRecord, s: f32| ScoredRecord {
            record: r.clone(),
            similarity: s,
        };

        let merged = merge_tiers(
            vec![hit(&shared, 0.8), hit(&local_only, 0.7)],
            vec![hit(&shared, 0.9), hit(&remote_only, 0.6)],
        );
        assert_eq!(merged.len(), 3);
        let by_id: HashMap<_, _> = merged
            .iter()
            .map(|c| (c.scored.record.id.clone(), (&c.source, c.scored.similarity)))
            .collect();
        assert!(matches!(by_id[&shared.id].0, ResultSource::Merged { .. }));
        assert!((by_id[&shared.id].1 - 0.9).abs() < 1e-6);
        assert_eq!(*by_id[&local_only.id].0, ResultSource::Local);
        assert_eq!(*by_id[&remote_only.id].0, ResultSource::Remote);
    }
}
