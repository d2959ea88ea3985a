use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct StrataConfig {
    pub server: ServerConfig,
    pub storage: StorageConfig,
    pub embedding: EmbeddingConfig,
    pub remote: RemoteConfig,
    pub sync: SyncConfig,
    pub isolation: IsolationConfig,
    pub retrieval: RetrievalConfig,
    pub prioritizer: PrioritizerConfig,
    pub optimizer: OptimizerConfig,
    pub clustering: ClusteringConfig,
    pub monitor: MonitorConfig,
    pub scheduler: SchedulerConfig,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ServerConfig {
    pub log_level: String,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct StorageConfig {
    pub db_path: String,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct EmbeddingConfig {
    pub provider: String,
    pub model: String,
    pub dimensions: usize,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct RemoteConfig {
    /// `none`, `memory`, or `http`.
    pub provider: String,
    pub url: String,
    pub api_key: Option<String>,
    pub timeout_ms: u64,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct SyncConfig {
    pub interval_secs: u64,
    pub batch_size: usize,
    pub max_attempts: u32,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct IsolationConfig {
    pub idle_eviction_secs: u64,
    pub max_loaded_memories: usize,
    pub default_similarity_threshold: f32,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct RetrievalConfig {
    pub default_limit: usize,
    pub candidate_multiplier: usize,
    pub max_patterns: usize,
    pub query_cache_size: usize,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct PrioritizerConfig {
    pub current_context_boost: f32,
    pub recency_window_secs: i64,
    pub recency_steps: Vec<RecencyStep>,
    pub pattern_similarity: f32,
    pub pattern_boost_max: f32,
    pub shared_boost: f32,
    pub shared_min_accessors: usize,
    pub deprecated_penalty: f32,
    pub high_success_score: f32,
    pub high_success_boost: f32,
    pub high_access_count: u32,
    pub high_access_boost: f32,
    pub stack_match_boost: f32,
}

/// One step of the recency boost: accesses younger than `max_age_secs` get `boost`.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq)]
pub struct RecencyStep {
    pub max_age_secs: i64,
    pub boost: f32,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct OptimizerConfig {
    pub max_project_bytes: u64,
    pub min_retained: usize,
    pub protect_threshold: f64,
    /// Lowest retention score an `important` record can have.
    pub important_floor: f64,
    pub recency_half_life_days: f64,
    pub weight_recency: f64,
    pub weight_frequency: f64,
    pub weight_importance: f64,
    pub weight_complexity: f64,
    pub weight_type: f64,
    pub merge_threshold: f32,
    pub compress_age_days: i64,
    pub compress_min_bytes: usize,
    pub embedding_keep_ratio: f32,
    pub embedding_min_energy: f32,
    pub batch_size: usize,
    pub budget_raise_factor: f64,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ClusteringConfig {
    pub similarity_threshold: f32,
    pub min_cluster_size: usize,
    pub max_cluster_size: usize,
    pub merge_threshold: f32,
    pub bridge_threshold: f32,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct MonitorConfig {
    pub window_size: usize,
    pub retrieval_p95_ms: f64,
    pub min_hit_rate: f64,
    pub min_hit_samples: usize,
    pub sync_p95_ms: f64,
    pub switch_p95_ms: f64,
    pub max_alerts: usize,
    pub degraded_ttl_multiplier: f64,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct SchedulerConfig {
    pub optimize_interval_secs: u64,
    pub cluster_interval_secs: u64,
    pub evict_interval_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            log_level: "info".into(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        let db_path = default_strata_dir()
            .join("memory.db")
            .to_string_lossy()
            .into_owned();
        Self { db_path }
    }
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: "hashing".into(),
            model: "feature-hashing-v1".into(),
            dimensions: 384,
        }
    }
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            provider: "none".into(),
            url: String::new(),
            api_key: None,
            timeout_ms: 250,
        }
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            interval_secs: 30,
            batch_size: 100,
            max_attempts: 8,
            backoff_base_ms: 1_000,
            backoff_max_ms: 300_000,
        }
    }
}

impl Default for IsolationConfig {
    fn default() -> Self {
        Self {
            idle_eviction_secs: 2 * 60 * 60,
            max_loaded_memories: 5_000,
            default_similarity_threshold: 0.3,
        }
    }
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            default_limit: 10,
            candidate_multiplier: 3,
            max_patterns: 5,
            query_cache_size: 256,
        }
    }
}

impl Default for PrioritizerConfig {
    fn default() -> Self {
        Self {
            current_context_boost: 1.5,
            recency_window_secs: 60 * 60,
            recency_steps: vec![
                RecencyStep { max_age_secs: 5 * 60, boost: 1.3 },
                RecencyStep { max_age_secs: 15 * 60, boost: 1.2 },
                RecencyStep { max_age_secs: 60 * 60, boost: 1.1 },
            ],
            pattern_similarity: 0.8,
            pattern_boost_max: 0.3,
            shared_boost: 1.15,
            shared_min_accessors: 2,
            deprecated_penalty: 0.5,
            high_success_score: 0.8,
            high_success_boost: 1.2,
            high_access_count: 10,
            high_access_boost: 1.1,
            stack_match_boost: 1.1,
        }
    }
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            max_project_bytes: 100 * 1024 * 1024,
            min_retained: 100,
            protect_threshold: 0.85,
            important_floor: 0.9,
            recency_half_life_days: 14.0,
            weight_recency: 0.25,
            weight_frequency: 0.2,
            weight_importance: 0.3,
            weight_complexity: 0.1,
            weight_type: 0.15,
            merge_threshold: 0.85,
            compress_age_days: 7,
            compress_min_bytes: 1024,
            embedding_keep_ratio: 0.25,
            embedding_min_energy: 0.95,
            batch_size: 100,
            budget_raise_factor: 1.1,
        }
    }
}

impl Default for ClusteringConfig {
    fn default() -> Self {
        Self {
            similarity_threshold: 0.75,
            min_cluster_size: 3,
            max_cluster_size: 50,
            merge_threshold: 0.9,
            bridge_threshold: 0.7,
        }
    }
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            window_size: 1_000,
            retrieval_p95_ms: 100.0,
            min_hit_rate: 0.8,
            min_hit_samples: 20,
            sync_p95_ms: 5_000.0,
            switch_p95_ms: 50.0,
            max_alerts: 100,
            degraded_ttl_multiplier: 2.0,
        }
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            optimize_interval_secs: 15 * 60,
            cluster_interval_secs: 30 * 60,
            evict_interval_secs: 5 * 60,
        }
    }
}

impl RemoteConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Returns `~/.strata/`
pub fn default_strata_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join(".strata")
}

/// Returns the default config file path: `~/.strata/config.toml`
pub fn default_config_path() -> PathBuf {
    default_strata_dir().join("config.toml")
}

impl StrataConfig {
    /// Load config from TOML file (if it exists) then apply env var overrides.
    pub fn load() -> Result<Self> {
        Self::load_from(default_config_path())
    }

    /// Load from a specific path, then apply env var overrides.
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let mut config = if path.exists() {
            let contents =
                std::fs::read_to_string(path).context("failed to read config file")?;
            toml::from_str(&contents).context("failed to parse config TOML")?
        } else {
            info!("no config file at {}, using defaults", path.display());
            StrataConfig::default()
        };

        config.apply_env_overrides();
        Ok(config)
    }

    /// Apply environment variable overrides (STRATA_DB, STRATA_LOG_LEVEL, STRATA_REMOTE_URL).
    fn apply_env_overrides(&mut self) {
        if let Ok(val) = std::env::var("STRATA_DB") {
            self.storage.db_path = val;
        }
        if let Ok(val) = std::env::var("STRATA_LOG_LEVEL") {
            self.server.log_level = val;
        }
        if let Ok(val) = std::env::var("STRATA_REMOTE_URL") {
            self.remote.url = val;
            if self.remote.provider == "none" {
                self.remote.provider = "http".into();
            }
        }
    }

    /// Resolve the database path, expanding `~` if needed.
    pub fn resolved_db_path(&self) -> PathBuf {
        expand_tilde(&self.storage.db_path)
    }
}

pub fn expand_tilde(path: &str) -> PathBuf {
    match (path.strip_prefix("~/"), dirs::home_dir()) {
        (Some(rest), Some(home)) => home.join(rest),
        _ => PathBuf::from(path),
    }
}
