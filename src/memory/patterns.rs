//! Workflow pattern and project settings persistence.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};

use super::types::Pattern;
use super::{bytes_to_embedding, embedding_to_bytes, fmt_ts, parse_ts};

pub fn upsert_pattern(conn: &Connection, pattern: &Pattern) -> Result<()> {
    conn.execute(
        "INSERT INTO patterns (project_id, hash, trigger_embedding, action_sequence, \
             occurrence_count, success_rate, last_used, auto_apply) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8) \
         ON CONFLICT(project_id, hash) DO UPDATE SET \
             trigger_embedding = excluded.trigger_embedding, \
             occurrence_count = excluded.occurrence_count, \
             success_rate = excluded.success_rate, \
             last_used = excluded.last_used, \
             auto_apply = excluded.auto_apply",
        params![
            pattern.project_id,
            pattern.hash,
            embedding_to_bytes(&pattern.trigger_embedding),
            serde_json::to_string(&pattern.action_sequence)?,
            pattern.occurrence_count as i64,
            pattern.success_rate as f64,
            fmt_ts(&pattern.last_used),
            pattern.auto_apply,
        ],
    )?;
    Ok(())
}

pub fn load_patterns(conn: &Connection, project_id: &str) -> Result<Vec<Pattern>> {
    let mut stmt = conn.prepare(
        "SELECT hash, trigger_embedding, action_sequence, occurrence_count, success_rate, \
             last_used, auto_apply \
         FROM patterns WHERE project_id = ?1 ORDER BY last_used DESC",
    )?;
    let rows = stmt
        .query_map(params![project_id], |row| {
            let trigger: Vec<u8> = row.get(1)?;
            let actions: String = row.get(2)?;
            let last_used: String = row.get(5)?;
            Ok((
                row.get::<_, String>(0)?,
                trigger,
                actions,
                row.get::<_, i64>(3)?,
                row.get::<_, f64>(4)?,
                parse_ts(&last_used)?,
                row.get::<_, bool>(6)?,
            ))
        })?
        .collect::<Result<Vec<_>, _>>()
        .with_context(|| format!("failed to load patterns for {project_id}"))?;

    rows.into_iter()
        .map(|(hash, trigger, actions, count, rate, last_used, auto_apply)| {
            Ok(Pattern {
                hash,
                project_id: project_id.to_string(),
                trigger_embedding: bytes_to_embedding(&trigger),
                action_sequence: serde_json::from_str(&actions)?,
                occurrence_count: count as u32,
                success_rate: rate as f32,
                last_used,
                auto_apply,
            })
        })
        .collect()
}

/// Persisted per-project context state.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProjectSettings {
    /// Override for the default similarity floor.
    pub similarity_threshold: Option<f32>,
    #[serde(default)]
    pub language: Option<String>,
    #[serde(default)]
    pub framework: Option<String>,
    #[serde(default)]
    pub extra: serde_json::Map<String, serde_json::Value>,
    #[serde(default)]
    pub current_file: Option<String>,
    #[serde(default)]
    pub current_function: Option<String>,
    #[serde(skip)]
    pub updated_at: Option<DateTime<Utc>>,
}

#[derive(Serialize, Deserialize, Default)]
struct SettingsBlob {
    #[serde(default)]
    language: Option<String>,
    #[serde(default)]
    framework: Option<String>,
    #[serde(default)]
    extra: serde_json::Map<String, serde_json::Value>,
}

pub fn save_settings(
    conn: &Connection,
    project_id: &str,
    settings: &ProjectSettings,
    default_threshold: f32,
) -> Result<()> {
    let blob = SettingsBlob {
        language: settings.language.clone(),
        framework: settings.framework.clone(),
        extra: settings.extra.clone(),
    };
    conn.execute(
        "INSERT INTO project_settings (project_id, similarity_threshold, settings, current_file, \
             current_function, updated_at) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6) \
         ON CONFLICT(project_id) DO UPDATE SET \
             similarity_threshold = excluded.similarity_threshold, settings = excluded.settings, \
             current_file = excluded.current_file, current_function = excluded.current_function, \
             updated_at = excluded.updated_at",
        params![
            project_id,
            settings.similarity_threshold.unwrap_or(default_threshold) as f64,
            serde_json::to_string(&blob)?,
            settings.current_file,
            settings.current_function,
            fmt_ts(&Utc::now()),
        ],
    )?;
    Ok(())
}

pub fn load_settings(conn: &Connection, project_id: &str) -> Result<Option<ProjectSettings>> {
    let row = conn
        .query_row(
            "SELECT similarity_threshold, settings, current_file, current_function, updated_at \
             FROM project_settings WHERE project_id = ?1",
            params![project_id],
            |row| {
                Ok((
                    row.get::<_, f64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, Option<String>>(2)?,
                    row.get::<_, Option<String>>(3)?,
                    row.get::<_, String>(4)?,
                ))
            },
        )
        .optional()?;

    let Some((threshold, blob, current_file, current_function, updated_at)) = row else {
        return Ok(None);
    };
    let blob: SettingsBlob = serde_json::from_str(&blob)?;
    Ok(Some(ProjectSettings {
        similarity_threshold: Some(threshold as f32),
        language: blob.language,
        framework: blob.framework,
        extra: blob.extra,
        current_file,
        current_function,
        updated_at: Some(parse_ts(&updated_at)?),
    }))
}
