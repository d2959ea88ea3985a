//! SQL DDL for all Strata tables.
//!
//! Defines `memories`, `patterns`, `clusters`, `cluster_members`, `cluster_bridges`,
//! `project_settings`, the append-only `sync_outbox`, the `memory_log` audit trail, and
//! `schema_meta`. All DDL uses `IF NOT EXISTS` for idempotent initialization.

use rusqlite::Connection;

/// All schema DDL statements for Strata's core tables.
const SCHEMA_SQL: &str = r#"
-- Core memory storage. Every row belongs to exactly one project.
CREATE TABLE IF NOT EXISTS memories (
    id TEXT PRIMARY KEY,
    project_id TEXT NOT NULL,
    content TEXT NOT NULL,
    content_z BLOB,
    embedding BLOB NOT NULL,
    embedding_encoding TEXT NOT NULL DEFAULT 'dense' CHECK(embedding_encoding IN ('dense','top_k')),
    embedding_dim INTEGER NOT NULL,
    metadata TEXT NOT NULL DEFAULT '{}',
    interaction_type TEXT NOT NULL,
    tool_chain TEXT NOT NULL DEFAULT '[]',
    file_paths TEXT NOT NULL DEFAULT '[]',
    success_score REAL NOT NULL DEFAULT 0.5 CHECK(success_score >= 0.0 AND success_score <= 1.0),
    created_at TEXT NOT NULL,
    last_accessed_at TEXT NOT NULL,
    access_count INTEGER NOT NULL DEFAULT 1,
    version INTEGER NOT NULL,
    sync_state TEXT NOT NULL DEFAULT 'queued'
        CHECK(sync_state IN ('new','queued','in_flight','synced','failed','dead_letter'))
);

CREATE INDEX IF NOT EXISTS idx_memories_project ON memories(project_id);
CREATE INDEX IF NOT EXISTS idx_memories_project_access ON memories(project_id, last_accessed_at);
CREATE INDEX IF NOT EXISTS idx_memories_sync_state ON memories(sync_state);

-- Recurring workflows, scoped per project
CREATE TABLE IF NOT EXISTS patterns (
    project_id TEXT NOT NULL,
    hash TEXT NOT NULL,
    trigger_embedding BLOB NOT NULL,
    action_sequence TEXT NOT NULL,
    occurrence_count INTEGER NOT NULL DEFAULT 1,
    success_rate REAL NOT NULL DEFAULT 0.0,
    last_used TEXT NOT NULL,
    auto_apply INTEGER NOT NULL DEFAULT 0,
    PRIMARY KEY (project_id, hash)
);

-- Semantic clusters
CREATE TABLE IF NOT EXISTS clusters (
    id TEXT PRIMARY KEY,
    project_id TEXT NOT NULL,
    centroid BLOB NOT NULL,
    stability REAL NOT NULL,
    label TEXT NOT NULL,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_clusters_project ON clusters(project_id);

CREATE TABLE IF NOT EXISTS cluster_members (
    cluster_id TEXT NOT NULL REFERENCES clusters(id) ON DELETE CASCADE,
    memory_id TEXT NOT NULL REFERENCES memories(id) ON DELETE CASCADE,
    PRIMARY KEY (cluster_id, memory_id)
);

CREATE INDEX IF NOT EXISTS idx_cluster_members_memory ON cluster_members(memory_id);

-- Records similar to more than one cluster
CREATE TABLE IF NOT EXISTS cluster_bridges (
    memory_id TEXT PRIMARY KEY REFERENCES memories(id) ON DELETE CASCADE,
    project_id TEXT NOT NULL,
    cluster_ids TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

-- Persisted per-project context state
CREATE TABLE IF NOT EXISTS project_settings (
    project_id TEXT PRIMARY KEY,
    similarity_threshold REAL NOT NULL,
    settings TEXT NOT NULL DEFAULT '{}',
    current_file TEXT,
    current_function TEXT,
    updated_at TEXT NOT NULL
);

-- Durable outbox of writes awaiting propagation to the remote store
CREATE TABLE IF NOT EXISTS sync_outbox (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    table_name TEXT NOT NULL,
    record_id TEXT NOT NULL,
    project_id TEXT NOT NULL,
    operation TEXT NOT NULL CHECK(operation IN ('put','delete')),
    payload TEXT NOT NULL,
    state TEXT NOT NULL DEFAULT 'queued'
        CHECK(state IN ('queued','in_flight','synced','failed','dead_letter')),
    attempts INTEGER NOT NULL DEFAULT 0,
    next_attempt_at TEXT NOT NULL,
    last_error TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_outbox_due ON sync_outbox(state, next_attempt_at);

-- Audit log
CREATE TABLE IF NOT EXISTS memory_log (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    operation TEXT NOT NULL
        CHECK(operation IN ('create','update','merge','compress','prune','delete','sync','dead_letter')),
    memory_id TEXT NOT NULL,
    details TEXT,
    created_at TEXT NOT NULL
);

-- Schema metadata
CREATE TABLE IF NOT EXISTS schema_meta (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
);
"#;

/// Initialize all schema tables. Idempotent (uses IF NOT EXISTS).
pub fn init_schema(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(SCHEMA_SQL)?;

    // Set initial schema version if not already present
    conn.execute(
        "INSERT OR IGNORE INTO schema_meta (key, value) VALUES ('schema_version', '1')",
        [],
    )?;

    Ok(())
}
