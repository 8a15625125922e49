//! Contextual query expansion.
//!
//! Enriches a raw query with recent conversation turns so retrieval can
//! resolve references like "tell me more about that". The heuristic path
//! appends a compact context fragment built from paired user/assistant
//! turns; the model path asks the generative service for a single
//! free-text rewrite and falls back to the heuristic on any failure.

use std::collections::HashMap;

use persona_core::generation::GenerativeBackend;
use persona_core::models::{ConversationTurn, Role};
use persona_core::KeyPool;

use super::analyze::content_tokens;

/// Trailing turns considered when building expansion context.
const EXPANSION_WINDOW: usize = 3;

/// Referential pronouns that mark a query as a follow-up.
const REFERENTIAL_PRONOUNS: &[&str] = &[
    "it", "this", "that", "they", "them", "those", "these", "he", "she", "his", "her",
];

/// Phrases that mark a query as a follow-up.
const FOLLOWUP_PHRASES: &[&str] = &[
    "what about",
    "how about",
    "tell me more",
    "and then",
    "why is that",
    "anything else",
    "go on",
];

/// Heuristic expansion: the raw query plus a "Context from conversation"
/// fragment built from the last few user/assistant pairs.
pub fn expand_heuristic(query: &str, history: &[ConversationTurn]) -> String {
    let fragment = history_fragment(history);
    if fragment.is_empty() {
        query.to_string()
    } else {
        format!("{}\nContext from conversation: {}", query, fragment)
    }
}

fn history_fragment(history: &[ConversationTurn]) -> String {
    let mut pairs: Vec<String> = Vec::new();
    let mut pending_user: Option<&str> = None;

    for turn in history {
        match turn.role {
            Role::User => pending_user = Some(&turn.content),
            Role::Assistant => {
                if let Some(user) = pending_user.take() {
                    pairs.push(format!("asked \"{}\", answered \"{}\"", user, turn.content));
                }
            }
            Role::System => {}
        }
    }

    // Unpaired trailing user turn still carries context
    if let Some(user) = pending_user {
        pairs.push(format!("asked \"{}\"", user));
    }

    let start = pairs.len().saturating_sub(EXPANSION_WINDOW);
    pairs[start..].join("; ")
}

/// Model-assisted expansion through the credential pool. Any failure
/// degrades to the heuristic expansion rather than erroring.
pub async fn expand_with_model(
    query: &str,
    history: &[ConversationTurn],
    keys: &KeyPool,
    backend: &dyn GenerativeBackend,
) -> String {
    let history_text = history
        .iter()
        .rev()
        .take(EXPANSION_WINDOW * 2)
        .rev()
        .map(|t| format!("{}: {}", t.role.as_str(), t.content))
        .collect::<Vec<_>>()
        .join("\n");

    let prompt = format!(
        "Rewrite the following query so it is self-contained, resolving any \
         references using the conversation. Reply with the rewritten query only.\n\n\
         Conversation:\n{history}\n\nQuery: {query}",
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
        Ok(text) if !text.trim().is_empty() => text.trim().to_string(),
        Ok(_) => expand_heuristic(query, history),
        Err(e) => {
            tracing::warn!(error = %e, "Model expansion failed, using heuristic");
            expand_heuristic(query, history)
        }
    }
}

/// True when the query likely refers back to the previous exchange:
/// very short, contains a referential pronoun, or contains a known
/// follow-up phrase.
pub fn detect_followup(query: &str) -> bool {
    let lower = query.to_lowercase();
    let tokens = content_tokens(query);

    if tokens.len() <= 2 {
        return true;
    }

    let raw_tokens: Vec<String> = lower
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(String::from)
        .collect();
    if raw_tokens.iter().any(|t| REFERENTIAL_PRONOUNS.contains(&t.as_str())) {
        return true;
    }

    FOLLOWUP_PHRASES.iter().any(|p| lower.contains(p))
}

/// Top-n content terms of a text ranked by frequency, ties broken by
/// first appearance. Used to broaden follow-up retrieval with terms from
/// the previous assistant turn.
pub fn extract_key_terms(text: &str, n: usize) -> Vec<String> {
    let tokens = content_tokens(text);
    let mut counts: HashMap<&str, usize> = HashMap::new();
    let mut first_seen: HashMap<&str, usize> = HashMap::new();

    for (i, token) in tokens.iter().enumerate() {
        if token.len() < 3 {
            continue;
        }
        *counts.entry(token).or_insert(0) += 1;
        first_seen.entry(token).or_insert(i);
    }

    let mut ranked: Vec<(&str, usize)> = counts.into_iter().collect();
    ranked.sort_by(|a, b| b.1.cmp(&a.1).then(first_seen[a.0].cmp(&first_seen[b.0])));

    ranked.into_iter().take(n).map(|(t, _)| t.to_string()).collect()
}

// ============================================================================
// TESTS
// ============================================================================
