pub mod doctor;
pub mod maintenance;
pub mod search;
pub mod stats;

use anyhow::Result;
use strata::{MemoryEngine, StrataConfig};

/// Open the engine for a one-shot command.
pub async fn open_engine(config: &StrataConfig) -> Result<MemoryEngine> {
    Ok(MemoryEngine::open(config.clone()).await?)
}

pub fn format_bytes(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{bytes} B")
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    }
}

/// Character-safe preview for terminal output.
pub fn preview(content: &str, max_chars: usize) -> String {
    let mut chars = content.chars();
    let head: String = chars.by_ref().take(max_chars).collect();
    if chars.next().is_some() {
        format!("{head}...")
    } else {
        head
    }
}
