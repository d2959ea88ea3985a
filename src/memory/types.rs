//! Core memory type definitions.
//!
//! Defines [`MemoryRecord`] (a stored memory), its typed [`MemoryMetadata`],
//! [`InteractionType`] and [`SyncState`], the workflow [`Pattern`], semantic
//! [`Cluster`]s and bridges, the sync outbox [`SyncQueueItem`], and the explicit
//! [`RequestContext`] threaded through every engine call.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// What kind of interaction produced a memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InteractionType {
    Conversation,
    Question,
    CodeChange,
    /// An error and the fix that resolved it. Favoured by retention scoring.
    ErrorFix,
    /// A reusable workflow or code pattern.
    Pattern,
    Decision,
    Documentation,
}

impl InteractionType {
    pub const ALL: [InteractionType; 7] = [
        Self::Conversation,
        Self::Question,
        Self::CodeChange,
        Self::ErrorFix,
        Self::Pattern,
        Self::Decision,
        Self::Documentation,
    ];

    /// SQL-compatible string representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Conversation => "conversation",
            Self::Question => "question",
            Self::CodeChange => "code_change",
            Self::ErrorFix => "error_fix",
            Self::Pattern => "pattern",
            Self::Decision => "decision",
            Self::Documentation => "documentation",
        }
    }

    /// Retention weight in `[0, 1]`: errors, fixes, and patterns are kept longest.
    pub fn retention_weight(&self) -> f64 {
        match self {
            Self::ErrorFix => 1.0,
            Self::Pattern => 0.9,
            Self::Decision => 0.8,
            Self::CodeChange => 0.6,
            Self::Documentation => 0.5,
            Self::Question => 0.4,
            Self::Conversation => 0.2,
        }
    }
}

impl std::fmt::Display for InteractionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for InteractionType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| format!("unknown interaction type: {s}"))
    }
}

/// Where a record stands relative to the remote store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncState {
    /// Built in memory, not yet written locally.
    New,
    Queued,
    InFlight,
    Synced,
    /// Last push failed; waiting for backoff to elapse.
    Failed,
    /// Exceeded max attempts. Locally readable, excluded from auto-retry.
    DeadLetter,
}

impl SyncState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::New => "new",
            Self::Queued => "queued",
            Self::InFlight => "in_flight",
            Self::Synced => "synced",
            Self::Failed => "failed",
            Self::DeadLetter => "dead_letter",
        }
    }
}

impl std::fmt::Display for SyncState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for SyncState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "new" => Ok(Self::New),
            "queued" => Ok(Self::Queued),
            "in_flight" => Ok(Self::InFlight),
            "synced" => Ok(Self::Synced),
            "failed" => Ok(Self::Failed),
            "dead_letter" => Ok(Self::DeadLetter),
            _ => Err(format!("unknown sync state: {s}")),
        }
    }
}

fn is_false(b: &bool) -> bool {
    !*b
}

/// Typed flags that ranking and retention logic depend on, plus an opaque
/// extension map for everything else the caller attaches.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryMetadata {
    #[serde(skip_serializing_if = "is_false")]
    pub deprecated: bool,
    #[serde(skip_serializing_if = "is_false")]
    pub important: bool,
    /// Never pruned, regardless of score.
    #[serde(skip_serializing_if = "is_false")]
    pub pinned: bool,
    #[serde(skip_serializing_if = "is_false")]
    pub shared: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub framework: Option<String>,
    /// Function or symbol the memory is about.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub function: Option<String>,
    /// Distinct users that retrieved this memory.
    #[serde(skip_serializing_if = "BTreeSet::is_empty")]
    pub accessed_by: BTreeSet<String>,
    /// Ids absorbed into this record by the optimizer's merge pass.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub merged_from: Vec<String>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// A memory record, matching the `memories` table schema.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryRecord {
    /// UUID v7 (time-sortable) primary key.
    pub id: String,
    /// The one project this record belongs to.
    pub project_id: String,
    pub content: String,
    pub embedding: Vec<f32>,
    pub metadata: MemoryMetadata,
    pub interaction_type: InteractionType,
    /// Tools invoked, in order, while producing this memory.
    pub tool_chain: Vec<String>,
    pub file_paths: Vec<String>,
    /// Historical success in `[0.0, 1.0]`.
    pub success_score: f32,
    pub created_at: DateTime<Utc>,
    pub last_accessed_at: DateTime<Utc>,
    pub access_count: u32,
    pub sync_state: SyncState,
    /// Hybrid logical clock stamp of the last content-bearing write.
    pub version: u64,
    /// Stored deflated, with a top-k embedding when that is smaller; decoded on read.
    #[serde(default)]
    pub compressed: bool,
}

impl MemoryRecord {
    /// Approximate in-memory size in bytes, used for working-set accounting.
    pub fn estimated_size(&self) -> usize {
        const OVERHEAD: usize = 160;
        self.content.len()
            + self.embedding.len() * std::mem::size_of::<f32>()
            + self.tool_chain.iter().map(String::len).sum::<usize>()
            + self.file_paths.iter().map(String::len).sum::<usize>()
            + OVERHEAD
    }
}

/// A record with its raw similarity to a query embedding.
#[derive(Debug, Clone)]
pub struct ScoredRecord {
    pub record: MemoryRecord,
    pub similarity: f32,
}

/// A recurring workflow: a trigger situation and the tool sequence that handled it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Pattern {
    /// SHA-256 of the action sequence.
    pub hash: String,
    pub project_id: String,
    pub trigger_embedding: Vec<f32>,
    pub action_sequence: Vec<String>,
    pub occurrence_count: u32,
    /// Running mean of reported outcomes in `[0.0, 1.0]`.
    pub success_rate: f32,
    pub last_used: DateTime<Utc>,
    pub auto_apply: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Cluster {
    pub id: String,
    pub project_id: String,
    pub member_ids: Vec<String>,
    /// Normalized mean of member embeddings.
    pub centroid: Vec<f32>,
    /// Mean member-to-centroid cosine.
    pub stability: f32,
    pub label: String,
}

/// A record similar to more than one cluster.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bridge {
    pub memory_id: String,
    pub project_id: String,
    pub cluster_ids: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncOperation {
    Put,
    Delete,
}

impl SyncOperation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Put => "put",
            Self::Delete => "delete",
        }
    }
}

impl std::str::FromStr for SyncOperation {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "put" => Ok(Self::Put),
            "delete" => Ok(Self::Delete),
            _ => Err(format!("unknown sync operation: {s}")),
        }
    }
}

/// One row of the durable sync outbox.
#[derive(Debug, Clone, Serialize)]
pub struct SyncQueueItem {
    pub id: i64,
    pub table_name: String,
    pub record_id: String,
    pub project_id: String,
    pub operation: SyncOperation,
    /// JSON snapshot of the record at enqueue time (`null` for deletes).
    pub payload: serde_json::Value,
    pub attempts: u32,
    /// One of the outbox states: queued, in_flight, synced, failed, dead_letter.
    pub state: SyncState,
    pub next_attempt_at: DateTime<Utc>,
    pub last_error: Option<String>,
}

/// Who is asking, for which project. Passed explicitly into every engine call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestContext {
    pub project_id: String,
    pub user_id: Option<String>,
    pub session_id: Option<String>,
}

impl RequestContext {
    pub fn new(project_id: impl Into<String>) -> Self {
        Self {
            project_id: project_id.into(),
            user_id: None,
            session_id: None,
        }
    }

    pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }
}

/// Which tier produced a result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreTier {
    Local,
    Remote,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum ResultSource {
    Local,
    Remote,
    /// Found in both tiers and reconciled.
    Merged { contributors: Vec<StoreTier> },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interaction_type_roundtrip() {
        for t in InteractionType::ALL {
            assert_eq!(t.as_str().parse::<InteractionType>().unwrap(), t);
        }
        assert!("gossip".parse::<InteractionType>().is_err());
    }

    #[test]
    fn error_fix_outweighs_conversation() {
        assert!(
            InteractionType::ErrorFix.retention_weight()
                > InteractionType::Conversation.retention_weight()
        );
    }

    #[test]
    fn metadata_keeps_unknown_keys() {
        let json = serde_json::json!({
            "deprecated": true,
            "language": "rust",
            "ticket": "OPS-12"
        });
        let meta: MemoryMetadata = serde_json::from_value(json).unwrap();
        assert!(meta.deprecated);
        assert_eq!(meta.language.as_deref(), Some("rust"));
        assert_eq!(meta.extra["ticket"], "OPS-12");

        let back = serde_json::to_value(&meta).unwrap();
        assert_eq!(back["ticket"], "OPS-12");
        assert!(back.get("pinned").is_none());
    }

    #[test]
    fn sync_state_roundtrip() {
        for s in [
            SyncState::New,
            SyncState::Queued,
            SyncState::InFlight,
            SyncState::Synced,
            SyncState::Failed,
            SyncState::DeadLetter,
        ] {
            assert_eq!(s.as_str().parse::<SyncState>().unwrap(), s);
        }
    }
}
