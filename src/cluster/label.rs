//! Topic labels: dominant interaction type plus the most frequent keywords.

use std::collections::HashMap;

use crate::embedding::hashing::tokenize;
use crate::memory::types::{InteractionType, MemoryRecord};

const KEYWORDS: usize = 3;

const STOPWORDS: &[&str] = &[
    "the", "and", "for", "with", "that", "this", "from", "into", "are", "was", "were", "but",
    "not", "you", "your", "have", "has", "had", "can", "use", "used", "using", "when", "then",
    "than", "there", "their", "its", "all", "any", "out", "about", "before", "after", "also",
    "just", "only", "should", "would", "could", "will", "does", "did", "done", "how", "what",
    "why", "which", "who", "get", "set", "new", "now",
];

fn is_keyword(token: &str) -> bool {
    token.chars().count() >= 3
        && !token.chars().all(|c| c.is_ascii_digit())
        && !STOPWORDS.contains(&token)
}

/// Label like `error_fix: migration, schema, sqlite`.
pub fn label_for(members: &[&MemoryRecord]) -> String {
    let mut types: HashMap<InteractionType, usize> = HashMap::new();
    let mut words: HashMap<String, usize> = HashMap::new();
    for record in members {
        *types.entry(record.interaction_type).or_default() += 1;
        for token in tokenize(&record.content) {
            if is_keyword(&token) {
                *words.entry(token).or_default() += 1;
            }
        }
    }

    let dominant = types
        .into_iter()
        .max_by(|a, b| a.1.cmp(&b.1).then_with(|| b.0.as_str().cmp(a.0.as_str())))
        .map(|(t, _)| t.as_str())
        .unwrap_or("mixed");

    let mut ranked: Vec<(String, usize)> = words.into_iter().collect();
    ranked.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    let keywords: Vec<String> = ranked.into_iter().take(KEYWORDS).map(|(w, _)| w).collect();

    if keywords.is_empty() {
        dominant.to_string()
    } else {
        format!("{dominant}: {}", keywords.join(", "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::store::tests::sample_record;

    #[test]
    fn label_names_type_and_keywords() {
        let mut a = sample_record("alpha", "sqlite migration failed on schema v2", vec![1.0]);
        a.interaction_type = InteractionType::ErrorFix;
        let mut b = sample_record("alpha", "rerun the sqlite migration with the schema lock", vec![1.0]);
        b.interaction_type = InteractionType::ErrorFix;
        let c = sample_record("alpha", "sqlite pragma tweak", vec![1.0]);

        let label = label_for(&[&a, &b, &c]);
        assert_eq!(label, "error_fix: sqlite, migration, schema");
    }

    #[test]
    fn stopwords_and_numbers_are_ignored() {
        let r = sample_record("alpha", "the and 12345 with", vec![1.0]);
        assert_eq!(label_for(&[&r]), "code_change");
    }
}
