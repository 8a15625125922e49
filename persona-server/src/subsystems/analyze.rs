//! Query complexity analysis.
//!
//! Derives a 1–10 complexity score and the retrieval budget (document
//! count, similarity threshold) for a query. Two strategies:
//! - **heuristic** — purely lexical, no model call
//! - **model** — one generative call returning an expanded query and a
//!   document-count estimate in a fixed two-line format
//!
//! Score → budget buckets and the inverse score → threshold mapping are
//! fixed tables; the 0.3/0.4/0.3 blend weights come from config.

use persona_core::config::AnalysisConfig;
use persona_core::generation::GenerativeBackend;
use persona_core::models::ConversationTurn;
use persona_core::KeyPool;
use serde::Serialize;
use std::collections::HashSet;

/// Words matched against the start-of-question table.
const QUESTION_STARTERS: &[(&str, f32)] = &[
    ("how", 8.0),
    ("why", 7.0),
    ("compare", 9.0),
    ("explain", 7.0),
    ("describe", 6.0),
    ("which", 4.0),
    ("what", 3.0),
    ("when", 2.0),
    ("where", 2.0),
    ("who", 2.0),
];

/// Complexity-signaling keywords anywhere in the query.
const COMPLEXITY_KEYWORDS: &[(&str, f32)] = &[
    ("difference", 7.0),
    ("differences", 7.0),
    ("versus", 8.0),
    ("vs", 8.0),
    ("tradeoff", 8.0),
    ("tradeoffs", 8.0),
    ("analyze", 8.0),
    ("evaluate", 8.0),
    ("implications", 7.0),
    ("relationship", 6.0),
    ("impact", 6.0),
    ("architecture", 6.0),
];

pub const STOPWORDS: &[&str] = &[
    "a", "an", "and", "are", "as", "at", "be", "but", "by", "do", "does", "for", "from", "has",
    "have", "i", "in", "is", "it", "its", "me", "my", "of", "on", "or", "s", "so", "t", "the",
    "their", "then", "there", "these", "they", "this", "to", "was", "were", "will", "with", "you",
    "your",
];

/// Lowercase alphanumeric tokens, punctuation stripped.
pub fn tokenize(text: &str) -> Vec<String> {
    text.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(String::from)
        .collect()
}

/// Tokens with stopwords removed.
pub fn content_tokens(text: &str) -> Vec<String> {
    tokenize(text)
        .into_iter()
        .filter(|t| !STOPWORDS.contains(&t.as_str()))
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    Heuristic,
    ModelAssisted,
}

#[derive(Debug, Clone, Serialize)]
pub struct ComplexityReport {
    /// 1.0..=10.0
    pub score: f32,
    /// Adaptive top-k budget
    pub doc_count: usize,
    /// Similarity floor for candidate filtering
    pub threshold: f32,
    /// Backfill floor: never fewer documents than this when available
    pub min_docs: usize,
    pub strategy: Strategy,
}

/// Score → top-k bucket table.
pub fn doc_count_for(score: f32) -> usize {
    if score < 3.0 {
        3
    } else if score < 5.0 {
        5
    } else if score < 7.0 {
        10
    } else if score < 9.0 {
        20
    } else {
        30
    }
}

/// Similarity threshold, inversely related to complexity: harder
/// queries cast a wider net.
pub fn threshold_for(score: f32) -> f32 {
    if score >= 8.0 {
        0.15
    } else if score >= 6.0 {
        0.18
    } else if score >= 4.0 {
        0.20
    } else {
        0.25
    }
}

/// Minimum documents to keep after threshold filtering.
pub fn min_docs_for(score: f32) -> usize {
    ((score / 2.0).round() as usize).max(2)
}

/// Local heuristic analysis: length, question-starter weight, and
/// complexity-keyword weight combined with the configured blend.
pub fn analyze(query: &str, config: &AnalysisConfig) -> ComplexityReport {
    let tokens = tokenize(query);
    let content = content_tokens(query);

    let unique: HashSet<&str> = content.iter().map(String::as_str).collect();
    let unique_ratio = if content.is_empty() {
        1.0
    } else {
        unique.len() as f32 / content.len() as f32
    };

    // Length: grows with token count, discounted for repetitive queries
    let length_base = (1.0 + content.len() as f32 / 3.0).min(10.0);
    let length_score = (length_base * (0.5 + 0.5 * unique_ratio)).clamp(1.0, 10.0);

    let question_score = tokens
        .iter()
        .filter_map(|t| {
            QUESTION_STARTERS
                .iter()
                .find(|(w, _)| w == t)
                .map(|(_, weight)| *weight)
        })
        .fold(f32::NAN, f32::max);
    let question_score = if question_score.is_nan() { 2.0 } else { question_score };

    let keyword_score = tokens
        .iter()
        .filter_map(|t| {
            COMPLEXITY_KEYWORDS
                .iter()
                .find(|(w, _)| w == t)
                .map(|(_, weight)| *weight)
        })
        .fold(f32::NAN, f32::max);
    let keyword_score = if keyword_score.is_nan() { 1.0 } else { keyword_score };

    let score = (config.length_weight * length_score
        + config.question_weight * question_score
        + config.keyword_weight * keyword_score)
        .clamp(1.0, 10.0);

    ComplexityReport {
        score,
        doc_count: doc_count_for(score),
        threshold: threshold_for(score),
        min_docs: min_docs_for(score),
        strategy: Strategy::Heuristic,
    }
}

/// Model-assisted analysis: a single generative call returns both the
/// expanded query and a document-count estimate in the two-line format
/// `EXPANDED: …` / `DOCS: n`. Parse failure falls back to the original
/// query and a default count of 3, never an error.
pub async fn analyze_with_model(
    query: &str,
    history: &[ConversationTurn],
    keys: &KeyPool,
    backend: &dyn GenerativeBackend,
) -> (String, usize) {
    let history_text = history
        .iter()
        .map(|t| format!("{}: {}", t.role.as_str(), t.content))
        .collect::<Vec<_>>()
        .join("\n");

    let prompt = format!(
        "Given this conversation:\n{history}\n\n\
         Rewrite the user's query so it stands alone, and estimate how many \
         profile documents (1-15) are needed to answer it well.\n\
         Respond in exactly two lines:\n\
         EXPANDED: <rewritten query>\n\
         DOCS: <number>\n\n\
         Query: {query}",
        history = history_text,
        query = query,
    );

    let prompt = &prompt;
    let reply = keys
        .with_rotation(|key| async move {
            backend.generate(&key, &[ConversationTurn::user(prompt.clone())]).await
        })
        .await;

    match reply {
        Ok(text) => parse_two_line(&text).unwrap_or_else(|| {
            tracing::warn!("Unparseable analyzer reply, falling back to defaults");
            (query.to_string(), 3)
        }),
        Err(e) => {
            tracing::warn!(error = %e, "Model-assisted analysis failed, using defaults");
            (query.to_string(), 3)
        }
    }
}

fn parse_two_line(text: &str) -> Option<(String, usize)> {
    let mut expanded = None;
    let mut docs = None;

    for line in text.lines() {
        let line = line.trim();
        if let Some(rest) = line.strip_prefix("EXPANDED:") {
            let rest = rest.trim();
            if !rest.is_empty() {
                expanded = Some(rest.to_string());
            }
        } else if let Some(rest) = line.strip_prefix("DOCS:") {
            docs = rest.trim().parse::<usize>().ok().map(|n| n.clamp(1, 15));
        }
    }

    match (expanded, docs) {
        (Some(e), Some(d)) => Some((e, d)),
        _ => None,
    }
}

// ============================================================================
// TESTS
// ============================================================================
