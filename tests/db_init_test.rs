use strata::db;

fn names(conn: &rusqlite::Connection, kind: &str) -> Vec<String> {
    conn.prepare("SELECT name FROM sqlite_master WHERE type = ?1 ORDER BY name")
        .unwrap()
        .query_map([kind], |row| row.get(0))
        .unwrap()
        .collect::<Result<Vec<_>, _>>()
        .unwrap()
}

#[test]
fn full_schema_creates_all_tables_and_indexes() {
    let conn = db::open_memory_database().unwrap();

    let tables = names(&conn, "table");
    for table in [
        "memories",
        "patterns",
        "clusters",
        "cluster_members",
        "cluster_bridges",
        "project_settings",
        "sync_outbox",
        "memory_log",
        "schema_meta",
    ] {
        assert!(tables.contains(&table.to_string()), "{table} table missing");
    }

    let indexes = names(&conn, "index");
    for index in [
        "idx_memories_project",
        "idx_memories_project_access",
        "idx_outbox_due",
        "idx_outbox_record",
        "idx_cluster_members_memory",
    ] {
        assert!(indexes.contains(&index.to_string()), "{index} index missing");
    }
}

#[test]
fn check_constraints_reject_bad_rows() {
    let conn = db::open_memory_database().unwrap();

    let insert = |success: f64, state: &str| {
        conn.execute(
            "INSERT INTO memories (id, project_id, content, embedding, embedding_dim,
                                   interaction_type, success_score, created_at,
                                   last_accessed_at, version, sync_state)
             VALUES (lower(hex(randomblob(8))), 'alpha', 'x', x'0000803f', 1,
                     'conversation', ?1, '2026-01-01T00:00:00Z', '2026-01-01T00:00:00Z', 1, ?2)",
            rusqlite::params![success, state],
        )
    };

    assert!(insert(0.5, "queued").is_ok());
    assert!(insert(1.5, "queued").is_err(), "success_score above 1 must be rejected");
    assert!(insert(0.5, "lost").is_err(), "unknown sync state must be rejected");
}

#[test]
fn deleting_a_memory_cascades_to_cluster_membership() {
    let conn = db::open_memory_database().unwrap();
    conn.execute_batch(
        "INSERT INTO memories (id, project_id, content, embedding, embedding_dim, interaction_type,
                               created_at, last_accessed_at, version)
         VALUES ('m1', 'alpha', 'x', x'0000803f', 1, 'conversation',
                 '2026-01-01T00:00:00Z', '2026-01-01T00:00:00Z', 1);
         INSERT INTO clusters (id, project_id, centroid, stability, label, created_at, updated_at)
         VALUES ('c1', 'alpha', x'0000803f', 1.0, 'conversation', '2026-01-01T00:00:00Z', '2026-01-01T00:00:00Z');
         INSERT INTO cluster_members (cluster_id, memory_id) VALUES ('c1', 'm1');
         DELETE FROM memories WHERE id = 'm1';",
    )
    .unwrap();

    let members: i64 = conn
        .query_row("SELECT COUNT(*) FROM cluster_members", [], |r| r.get(0))
        .unwrap();
    assert_eq!(members, 0);
}
