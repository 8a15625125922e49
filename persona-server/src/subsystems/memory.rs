//! Memory subsystem: classification, privacy, retrieval, confirmation.
//!
//! Memory records are long-lived facts with a category, importance, and
//! privacy level. Classification is lexical (keyword tables) plus a few
//! structural patterns that force privacy regardless of wording.
//! Retrieval fans out across matched categories, a general semantic
//! search, and an importance sweep that surfaces critical facts no
//! matter what the query asked.
//!
//! Nothing here writes a memory on its own authority: a generative
//! judgment only *proposes* a memory, and `store_memory` is a separate
//! caller-confirmed operation.

use std::collections::HashMap;
use std::sync::OnceLock;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use persona_core::config::MemoryConfig;
use persona_core::generation::GenerativeBackend;
use persona_core::models::{
    CandidateOrigin, ConversationTurn, MemoryAttrs, MemoryCategory, MemoryJudgment, RecordKind,
    RetrievalCandidate,
};
use persona_core::store::{RecordFilter, StoreRecord, VectorStore};
use persona_core::{EmbeddingBackend, KeyPool, PersonaError};
use regex::Regex;
use uuid::Uuid;

/// Keyword table per category with the privacy level a match implies.
/// Order matters: classification keeps the *last* matching category.
const CATEGORY_KEYWORDS: &[(MemoryCategory, i32, &[&str])] = &[
    (
        MemoryCategory::Work,
        0,
        &["work", "job", "company", "office", "colleague", "client", "project"],
    ),
    (
        MemoryCategory::Education,
        0,
        &["school", "college", "university", "degree", "studied", "course"],
    ),
    (
        MemoryCategory::Technical,
        0,
        &["server", "database", "deploy", "linux", "rust", "python", "kubernetes"],
    ),
    (
        MemoryCategory::Preference,
        0,
        &["prefer", "favorite", "favourite", "like", "love", "hate", "dislike"],
    ),
    (
        MemoryCategory::Contact,
        1,
        &["phone", "email", "address", "contact", "whatsapp"],
    ),
    (
        MemoryCategory::Personal,
        1,
        &["birthday", "family", "wife", "husband", "married", "kids", "born"],
    ),
    (
        MemoryCategory::Health,
        1,
        &["doctor", "medication", "allergy", "allergies", "diagnosis", "therapy"],
    ),
    (
        MemoryCategory::Financial,
        1,
        &["bank", "salary", "credit card", "debit", "iban", "invoice", "payment"],
    ),
    (
        MemoryCategory::Credentials,
        1,
        &["password", "passcode", "pin", "login", "credential", "api key", "token"],
    ),
];

/// Structural patterns that force privacy regardless of keywords:
/// long digit runs, letter+digit identifiers, SSN-shaped numbers.
fn structural_patterns() -> &'static [Regex; 3] {
    static PATTERNS: OnceLock<[Regex; 3]> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        [
            Regex::new(r"\b\d{9,}\b").expect("digit-run pattern"),
            Regex::new(r"\b[A-Za-z]{2,}-?\d{4,}\b").expect("id pattern"),
            Regex::new(r"\b\d{3}-\d{2}-\d{4}\b").expect("ssn pattern"),
        ]
    })
}

#[derive(Debug, Clone)]
pub struct Classification {
    pub category: MemoryCategory,
    pub tags: Vec<String>,
    pub privacy_level: i32,
}

/// Classify a fact. The category is the last keyword table entry that
/// matched; the privacy level is the maximum over every match, so a
/// fact touching any sensitive category stays private. Structural
/// identifier patterns force privacy 1 and add an "id" tag.
pub fn classify(text: &str, summary: &str) -> Classification {
    let haystack = format!("{} {}", text, summary).to_lowercase();

    let mut category = MemoryCategory::General;
    let mut privacy = 0;
    let mut tags: Vec<String> = Vec::new();

    for (cat, cat_privacy, keywords) in CATEGORY_KEYWORDS {
        if keywords.iter().any(|k| haystack.contains(k)) {
            category = *cat;
            privacy = privacy.max(*cat_privacy);
            tags.push(cat.as_str().to_string());
        }
    }

    if structural_patterns().iter().any(|p| p.is_match(text)) {
        privacy = 1;
        if !tags.iter().any(|t| t == "id") {
            tags.push("id".to_string());
        }
    }

    Classification {
        category,
        tags,
        privacy_level: privacy,
    }
}

/// Categories the query text lexically touches. Unlike `classify` this
/// has no privacy side effect; it only steers the retrieval fan-out.
pub fn detect_categories(query: &str) -> Vec<MemoryCategory> {
    let lower = query.to_lowercase();
    CATEGORY_KEYWORDS
        .iter()
        .filter(|(_, _, keywords)| keywords.iter().any(|k| lower.contains(k)))
        .map(|(cat, _, _)| *cat)
        .collect()
}

/// Recency bonus: linear decay from `recency_bonus_max` to zero over
/// `recency_horizon_days`, floored at zero.
pub fn recency_bonus(created_at: DateTime<Utc>, now: DateTime<Utc>, config: &MemoryConfig) -> f32 {
    let days = (now - created_at).num_seconds() as f32 / 86_400.0;
    (config.recency_bonus_max * (1.0 - days / config.recency_horizon_days)).max(0.0)
}

/// Multi-stage memory retrieval:
/// category-filtered searches for each lexically matched category, one
/// general semantic search at 2×budget, and an importance sweep that
/// surfaces critical facts regardless of relevance. Results are
/// de-duplicated by id, scored, and truncated to the budget.
///
/// Store failures degrade that stage to empty rather than erroring.
pub async fn retrieve_memories(
    query: &str,
    query_vector: &[f32],
    owner_id: &str,
    budget: usize,
    store: &dyn VectorStore,
    config: &MemoryConfig,
) -> Vec<RetrievalCandidate> {
    let memory_filter = RecordFilter::owner(owner_id).with_kind(RecordKind::Memory);

    let category_searches = detect_categories(query).into_iter().map(|category| {
        let filter = memory_filter.clone().with_category(category);
        async move { store.query(query_vector, budget, &filter).await }
    });

    let mut matches = Vec::new();

    for result in join_all(category_searches).await {
        match result {
            Ok(mut found) => matches.append(&mut found),
            Err(e) => tracing::warn!(error = %e, "Category memory search failed"),
        }
    }

    match store.query(query_vector, budget * 2, &memory_filter).await {
        Ok(mut found) => matches.append(&mut found),
        Err(e) => tracing::warn!(error = %e, "General memory search failed"),
    }

    let critical_filter = memory_filter.clone().with_min_importance(config.importance_floor);
    match store.fetch(&critical_filter, budget).await {
        Ok(mut found) => matches.append(&mut found),
        Err(e) => tracing::warn!(error = %e, "Importance sweep failed"),
    }

    // De-duplicate by id, keeping the best similarity seen for each
    let mut by_id: HashMap<String, persona_core::store::StoreMatch> = HashMap::new();
    for m in matches {
        by_id
            .entry(m.id.clone())
            .and_modify(|existing| {
                if m.score > existing.score {
                    existing.score = m.score;
                }
            })
            .or_insert(m);
    }

    let now = Utc::now();
    let mut candidates: Vec<RetrievalCandidate> = by_id
        .into_values()
        .map(|m| {
            let importance = m.memory.as_ref().map(|a| a.importance).unwrap_or(5);
            let final_score =
                m.score + importance as f32 / 20.0 + recency_bonus(m.created_at, now, config);
            RetrievalCandidate {
                id: m.id,
                text: m.text,
                base_score: m.score,
                final_score,
                origin: CandidateOrigin::Memory,
                memory: m.memory,
                created_at: m.created_at,
            }
        })
        .collect();

    candidates.sort_by(|a, b| {
        b.final_score
            .partial_cmp(&a.final_score)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    candidates.truncate(budget);
    candidates
}

/// Render a memory for the context block. Private memories shown to a
/// non-owner are acknowledged but never revealed: the category stays,
/// the content is replaced with a non-disclosure notice.
pub fn format_memory(candidate: &RetrievalCandidate, requester_is_owner: bool) -> String {
    let attrs = match &candidate.memory {
        Some(a) => a,
        None => return candidate.text.clone(),
    };

    if attrs.privacy_level > 0 && !requester_is_owner {
        format!(
            "[{} memory withheld: private information exists in this category but is not shared]",
            attrs.category.as_str()
        )
    } else {
        format!("[{}] {}", attrs.category.as_str(), candidate.text)
    }
}

// ============================================================================
// Confirmation workflow
// ============================================================================

/// Ask the model whether the user's message carries vital information
/// worth remembering. Any failure (call or parse) yields the default
/// "not vital" judgment; this path never fails the request.
pub async fn judge_memory(
    query: &str,
    context: &str,
    keys: &KeyPool,
    backend: &dyn GenerativeBackend,
) -> MemoryJudgment {
    let prompt = format!(
        "Decide whether the user's message contains vital personal information \
         worth remembering long-term.\n\
         Known context:\n{context}\n\nUser message: {query}\n\n\
         Reply with a single JSON object:\n\
         {{\"is_vital\": bool, \"present_in_context\": 0-100, \"summary\": str, \
         \"extracted_info\": str, \"category\": str, \"importance\": 1-10}}",
        context = context,
        query = query,
    );

    let prompt = &prompt;
    let reply = keys
        .with_rotation(|key| async move {
            backend.generate(&key, &[ConversationTurn::user(prompt.clone())]).await
        })
        .await;

    match reply {
        Ok(text) => parse_judgment(&text),
        Err(e) => {
            tracing::warn!(error = %e, "Memory judgment call failed");
            MemoryJudgment::default()
        }
    }
}

/// Parse a judgment from model output, tolerating markdown code fences
/// and surrounding prose. Unparseable output is a default judgment.
pub fn parse_judgment(text: &str) -> MemoryJudgment {
    let start = text.find('{');
    let end = text.rfind('}');

    let parsed = match (start, end) {
        (Some(s), Some(e)) if e > s => serde_json::from_str::<MemoryJudgment>(&text[s..=e]).ok(),
        _ => None,
    };

    match parsed {
        Some(mut judgment) => {
            judgment.importance = judgment.importance.clamp(1, 10);
            judgment.present_in_context = judgment.present_in_context.clamp(0, 100);
            judgment
        }
        None => {
            tracing::warn!("Unparseable memory judgment, treating as not vital");
            MemoryJudgment::default()
        }
    }
}

// ============================================================================
// Persistence (caller-confirmed)
// ============================================================================

/// A memory submitted for persistence after the caller confirmed it.
#[derive(Debug, Clone)]
pub struct NewMemory {
    pub owner_id: String,
    pub text: String,
    pub summary: String,
    pub category: Option<MemoryCategory>,
    pub tags: Vec<String>,
    pub privacy_level: Option<i32>,
    pub importance: Option<i32>,
}

/// Persist a confirmed memory. Unspecified attributes are filled in by
/// classification; structural identifier patterns force privacy even
/// over an explicit caller value.
pub async fn store_memory(
    memory: NewMemory,
    store: &dyn VectorStore,
    embedder: &dyn EmbeddingBackend,
) -> Result<String, PersonaError> {
    if memory.owner_id.trim().is_empty() {
        return Err(PersonaError::InvalidInput("owner_id is required".to_string()));
    }
    if memory.text.trim().is_empty() {
        return Err(PersonaError::InvalidInput("memory text is required".to_string()));
    }

    let classification = classify(&memory.text, &memory.summary);
    let forced_private = structural_patterns().iter().any(|p| p.is_match(&memory.text));

    let privacy_level = match memory.privacy_level {
        Some(level) if forced_private => level.max(1),
        Some(level) => level,
        None => classification.privacy_level,
    };

    let mut tags = classification.tags;
    for tag in memory.tags {
        if !tags.contains(&tag) {
            tags.push(tag);
        }
    }

    let attrs = MemoryAttrs {
        summary: memory.summary,
        category: memory.category.unwrap_or(classification.category),
        tags,
        importance: memory.importance.unwrap_or(5).clamp(1, 10),
        privacy_level,
    };

    let embedding = embedder.embed(&memory.text).await?;
    let id = format!("mem_{}_{}", memory.owner_id, Uuid::new_v4());

    store
        .upsert(StoreRecord {
            id: id.clone(),
            owner_id: memory.owner_id,
            kind: RecordKind::Memory,
            source: None,
            text: memory.text,
            embedding,
            memory: Some(attrs),
            created_at: Utc::now(),
        })
        .await?;

    tracing::info!(id = %id, "Memory stored");
    Ok(id)
}

// ============================================================================
// TESTS
// ============================================================================
