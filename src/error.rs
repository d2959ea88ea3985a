//! Typed failures surfaced by the [`MemoryEngine`](crate::engine::MemoryEngine) facade.
//!
//! Structural errors (isolation violations, embedding failures, dimension mismatches)
//! reach the direct caller. Transient remote errors are retried and degraded internally;
//! `BudgetExceeded` and `SyncDeadLetter` are raised by background jobs and reported
//! through logs and monitor alerts rather than returned from foreground calls.

#[derive(Debug, thiserror::Error)]
pub enum MemoryError {
    #[error("content must not be empty")]
    EmptyContent,

    #[error("query must not be empty")]
    EmptyQuery,

    #[error("embedding failed: {0}")]
    EmbeddingFailure(String),

    #[error("embedding dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error(
        "isolation violation: record {record_id} belongs to project {found}, query scoped to {expected}"
    )]
    IsolationViolation {
        record_id: String,
        expected: String,
        found: String,
    },

    #[error("remote store unavailable: {0}")]
    TransientIo(String),

    #[error("project {project_id} footprint {footprint_bytes}B exceeds ceiling {ceiling_bytes}B")]
    BudgetExceeded {
        project_id: String,
        footprint_bytes: u64,
        ceiling_bytes: u64,
    },

    #[error("sync item {item_id} for record {record_id} dead-lettered after {attempts} attempts")]
    SyncDeadLetter {
        item_id: i64,
        record_id: String,
        attempts: u32,
    },

    #[error("memory not found: {0}")]
    NotFound(String),

    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl MemoryError {
    /// Whether the failure is a correctness bug rather than bad input or a flaky dependency.
    pub fn is_structural(&self) -> bool {
        matches!(
            self,
            Self::IsolationViolation { .. }
                | Self::EmbeddingFailure(_)
                | Self::DimensionMismatch { .. }
        )
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, Self::TransientIo(_))
    }
}

pub type Result<T, E = MemoryError> = std::result::Result<T, E>;
