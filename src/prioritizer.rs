//! Context-aware re-ranking.
//!
//! Every signal is a multiplier on raw cosine similarity, so favourable signals compound
//! and a single penalty (deprecation) scales the whole score down.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::cmp::Ordering;

use crate::config::PrioritizerConfig;
use crate::memory::cosine_similarity;
use crate::memory::patterns::ProjectSettings;
use crate::memory::types::{MemoryRecord, Pattern, ScoredRecord};

/// Trigger similarity at which a once-seen pattern is taken to be the record's own echo.
const SELF_TRIGGER_SIMILARITY: f32 = 0.9999;

/// What the caller is doing right now, as far as ranking cares.
#[derive(Debug, Clone, Copy, Default)]
pub struct RankingContext<'a> {
    pub current_file: Option<&'a str>,
    pub current_function: Option<&'a str>,
    pub language: Option<&'a str>,
    pub framework: Option<&'a str>,
    pub patterns: &'a [Pattern],
}

impl<'a> RankingContext<'a> {
    pub fn from_settings(settings: &'a ProjectSettings, patterns: &'a [Pattern]) -> Self {
        Self {
            current_file: settings.current_file.as_deref(),
            current_function: settings.current_function.as_deref(),
            language: settings.language.as_deref(),
            framework: settings.framework.as_deref(),
            patterns,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Prioritized {
    pub record: MemoryRecord,
    pub similarity: f32,
    pub boost: f32,
    /// `similarity × boost`
    pub score: f32,
}

#[derive(Debug, Clone, Serialize)]
pub struct PatternMatch {
    pub pattern: Pattern,
    pub similarity: f32,
}

pub struct Prioritizer {
    config: PrioritizerConfig,
}

impl Prioritizer {
    pub fn new(mut config: PrioritizerConfig) -> Self {
        config.recency_steps.sort_by_key(|s| s.max_age_secs);
        Self { config }
    }

    /// Product of every boost that applies to `record`.
    pub fn boost(&self, record: &MemoryRecord, ctx: &RankingContext<'_>, now: DateTime<Utc>) -> f32 {
        let c = &self.config;
        let mut boost = 1.0;

        if matches_current_context(record, ctx) {
            boost *= c.current_context_boost;
        }
        boost *= self.recency_boost(record, now);
        boost *= self.pattern_boost(record, ctx.patterns);

        if record.metadata.shared || record.metadata.accessed_by.len() >= c.shared_min_accessors {
            boost *= c.shared_boost;
        }

        if record.metadata.deprecated {
            boost *= c.deprecated_penalty;
        }
        if record.success_score >= c.high_success_score {
            boost *= c.high_success_boost;
        }
        if record.access_count >= c.high_access_count {
            boost *= c.high_access_boost;
        }
        if matches_stack(record, ctx) {
            boost *= c.stack_match_boost;
        }
        boost
    }

    fn recency_boost(&self, record: &MemoryRecord, now: DateTime<Utc>) -> f32 {
        let age = (now - record.last_accessed_at).num_seconds().max(0);
        if age > self.config.recency_window_secs {
            return 1.0;
        }
        self.config
            .recency_steps
            .iter()
            .find(|step| age <= step.max_age_secs)
            .map_or(1.0, |step| step.boost)
    }

    /// `1 + max × successRate` of the best matching pattern, or 1.
    ///
    /// A pattern learned from this record alone is not evidence for it and is skipped.
    fn pattern_boost(&self, record: &MemoryRecord, patterns: &[Pattern]) -> f32 {
        patterns
            .iter()
            .filter(|p| !learned_from(p, record))
            .filter(|p| {
                (!record.tool_chain.is_empty() && p.action_sequence == record.tool_chain)
                    || cosine_similarity(&p.trigger_embedding, &record.embedding)
                        >= self.config.pattern_similarity
            })
            .map(|p| 1.0 + self.config.pattern_boost_max * p.success_rate)
            .fold(1.0, f32::max)
    }

    /// Apply boosts and sort best first. Ties go to the most recently accessed record.
    pub fn rank(
        &self,
        candidates: Vec<ScoredRecord>,
        ctx: &RankingContext<'_>,
        now: DateTime<Utc>,
    ) -> Vec<Prioritized> {
        let mut ranked: Vec<Prioritized> = candidates
            .into_iter()
            .map(|c| {
                let boost = self.boost(&c.record, ctx, now);
                Prioritized {
                    score: c.similarity * boost,
                    similarity: c.similarity,
                    boost,
                    record: c.record,
                }
            })
            .collect();
        ranked.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(Ordering::Equal)
                .then_with(|| b.record.last_accessed_at.cmp(&a.record.last_accessed_at))
                .then_with(|| b.record.version.cmp(&a.record.version))
        });
        ranked
    }

    /// Patterns whose trigger resembles the query, best (cosine × success) first.
    pub fn top_patterns(&self, patterns: &[Pattern], query: &[f32], max: usize) -> Vec<PatternMatch> {
        let mut matches: Vec<PatternMatch> = patterns
            .iter()
            .filter_map(|p| {
                let similarity = cosine_similarity(&p.trigger_embedding, query);
                (similarity >= self.config.pattern_similarity).then(|| PatternMatch {
                    pattern: p.clone(),
                    similarity,
                })
            })
            .collect();
        matches.sort_by(|a, b| {
            let sa = a.similarity * a.pattern.success_rate;
            let sb = b.similarity * b.pattern.success_rate;
            sb.partial_cmp(&sa).unwrap_or(Ordering::Equal)
        });
        matches.truncate(max);
        matches
    }
}

fn learned_from(pattern: &Pattern, record: &MemoryRecord) -> bool {
    pattern.occurrence_count <= 1
        && pattern.action_sequence == record.tool_chain
        && cosine_similarity(&pattern.trigger_embedding, &record.embedding) >= SELF_TRIGGER_SIMILARITY
}

/// Same file, or one path is the other plus leading directories. A bare file name only
/// matches exactly.
fn same_file(a: &str, b: &str) -> bool {
    let a = a.trim_start_matches("./");
    let b = b.trim_start_matches("./");
    if a.is_empty() || b.is_empty() {
        return false;
    }
    let (long, short) = if a.len() >= b.len() { (a, b) } else { (b, a) };
    long == short
        || (short.contains('/')
            && long
                .strip_suffix(short)
                .is_some_and(|head| head.ends_with('/')))
}

fn matches_current_context(record: &MemoryRecord, ctx: &RankingContext<'_>) -> bool {
    let file_match = ctx
        .current_file
        .is_some_and(|current| record.file_paths.iter().any(|p| same_file(p, current)));
    let function_match = ctx
        .current_function
        .is_some_and(|f| record.metadata.function.as_deref() == Some(f));
    file_match || function_match
}

fn matches_stack(record: &MemoryRecord, ctx: &RankingContext<'_>) -> bool {
    let eq = |a: Option<&str>, b: Option<&str>| match (a, b) {
        (Some(a), Some(b)) => a.eq_ignore_ascii_case(b),
        _ => false,
    };
    eq(record.metadata.language.as_deref(), ctx.language)
        || eq(record.metadata.framework.as_deref(), ctx.framework)
}
