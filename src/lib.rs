//! Context-aware semantic memory for coding assistants.
//!
//! Strata stores short interaction records (code changes, error fixes, conversations)
//! with their embeddings, and answers project-scoped semantic queries ranked by what
//! the caller is doing right now.
//!
//! # Architecture
//!
//! - **Storage**: a local SQLite tier that every write lands in first, plus an optional
//!   remote tier reached through the [`storage::StorageAdapter`] trait
//! - **Sync**: a durable outbox drained in the background with exponential backoff,
//!   dead-lettering, and field-level conflict reconciliation ordered by a hybrid clock
//! - **Isolation**: per-project working sets; no result ever crosses a project boundary
//! - **Ranking**: cosine similarity scaled by context, recency, pattern, and quality boosts
//! - **Background jobs**: pruning, merging, compression, and clustering, each
//!   single-flight per project and cancellable between batches
//!
//! # Modules
//!
//! - [`engine`]: the [`MemoryEngine`] facade
//! - [`config`]: TOML configuration with environment overrides
//! - [`db`]: SQLite initialization, schema, migrations, and health checks
//! - [`storage`]: local and remote storage tiers
//! - [`sync`]: outbox draining and conflict reconciliation
//! - [`context`]: project isolation and workflow patterns
//! - [`prioritizer`]: context-aware re-ranking
//! - [`optimizer`]: budget enforcement: prune, merge, compress
//! - [`cluster`]: topic clustering and bridges
//! - [`monitor`]: latency windows, health, alerts, and degradation mode
//! - [`scheduler`]: periodic background jobs

pub mod clock;
pub mod cluster;
pub mod config;
pub mod context;
pub mod db;
pub mod embedding;
pub mod engine;
pub mod error;
pub mod memory;
pub mod monitor;
pub mod optimizer;
pub mod prioritizer;
pub mod scheduler;
pub mod storage;
pub mod sync;

pub use config::StrataConfig;
pub use engine::{
    EngineMetrics, MemoryEngine, SearchOptions, SearchResponse, SearchResult, StoreRequest,
};
pub use error::{MemoryError, Result};
pub use memory::types::{InteractionType, MemoryMetadata, MemoryRecord, RequestContext};
