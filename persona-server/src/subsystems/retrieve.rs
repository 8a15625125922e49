//! Retrieval and re-ranking.
//!
//! Turns a raw query plus its expansion into a bounded context block:
//! hybrid embedding (weighted blend of raw and expanded vectors), one
//! store query for documents, score against the *raw* vector, threshold
//! filtering with a minimum-document backfill, merge with the memory
//! subsystem's candidates, and a character-capped context assembly with
//! staged fallbacks.
//!
//! Retrieval never fails a request. Every stage degrades: embedding
//! failure yields an empty context, a store error an empty candidate
//! list, a grading failure the neutral default score.

use persona_core::config::{MemoryConfig, RetrievalConfig};
use persona_core::embeddings::{blend_vectors, cosine_similarity};
use persona_core::generation::GenerativeBackend;
use persona_core::models::{
    CandidateOrigin, ConversationTurn, RecordKind, RetrievalCandidate,
};
use persona_core::store::{RecordFilter, VectorStore};
use persona_core::{EmbeddingBackend, KeyPool};

use super::analyze::ComplexityReport;
use super::memory::{format_memory, retrieve_memories};

/// Neutral grade when model-assisted relevance cannot be obtained.
const DEFAULT_GRADE: f32 = 5.0;

/// Everything the retrieval stage needs from its caller.
pub struct RetrievalRequest<'a> {
    pub query: &'a str,
    pub expanded_query: &'a str,
    pub owner_id: &'a str,
    pub requester_is_owner: bool,
    pub report: &'a ComplexityReport,
}

#[derive(Debug, Default)]
pub struct RetrievalOutcome {
    pub candidates: Vec<RetrievalCandidate>,
    pub context: String,
    pub doc_count_used: usize,
}

pub async fn retrieve_context(
    request: &RetrievalRequest<'_>,
    store: &dyn VectorStore,
    embedder: &dyn EmbeddingBackend,
    keys: &KeyPool,
    generator: &dyn GenerativeBackend,
    retrieval: &RetrievalConfig,
    memory: &MemoryConfig,
) -> RetrievalOutcome {
    let raw_vector = match embedder.embed(request.query).await {
        Ok(v) => v,
        Err(e) => {
            tracing::warn!(error = %e, "Query embedding failed, serving without context");
            return RetrievalOutcome::default();
        }
    };

    // The expansion often equals the raw query; skip the second call then.
    let expanded_vector = if request.expanded_query == request.query {
        raw_vector.clone()
    } else {
        match embedder.embed(request.expanded_query).await {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!(error = %e, "Expanded embedding failed, using raw vector only");
                raw_vector.clone()
            }
        }
    };

    let hybrid = blend_vectors(
        &raw_vector,
        &expanded_vector,
        retrieval.raw_weight,
        retrieval.expanded_weight,
    );

    let top_k = (request.report.doc_count * 2).min(retrieval.candidate_cap);
    let doc_filter = RecordFilter::owner(request.owner_id).with_kind(RecordKind::Document);

    let doc_matches = match store.query(&hybrid, top_k, &doc_filter).await {
        Ok(found) => found,
        Err(e) => {
            tracing::warn!(error = %e, "Document query failed");
            Vec::new()
        }
    };

    // Relevance is judged against the raw query vector, not the hybrid,
    // so expansion can widen recall without distorting ranking.
    let mut documents: Vec<RetrievalCandidate> = doc_matches
        .into_iter()
        .map(|m| {
            let base = match &m.embedding {
                Some(stored) => cosine_similarity(&raw_vector, stored),
                None => m.score,
            };
            RetrievalCandidate {
                id: m.id,
                text: m.text,
                base_score: base,
                final_score: base * 10.0,
                origin: CandidateOrigin::Document,
                memory: None,
                created_at: m.created_at,
            }
        })
        .collect();

    documents.sort_by(|a, b| {
        b.base_score
            .partial_cmp(&a.base_score)
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    if retrieval.relevance == "model" && !documents.is_empty() {
        grade_documents(request.query, &mut documents, keys, generator).await;
    }

    let kept = apply_threshold(documents, request.report.threshold, request.report.min_docs);

    let memories = if memory.enabled {
        retrieve_memories(
            request.query,
            &raw_vector,
            request.owner_id,
            request.report.doc_count,
            store,
            memory,
        )
        .await
    } else {
        Vec::new()
    };

    let mut candidates = kept;
    candidates.extend(memories);
    candidates.sort_by(|a, b| {
        b.final_score
            .partial_cmp(&a.final_score)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    candidates.truncate(request.report.doc_count.max(request.report.min_docs));

    let doc_count_used = candidates
        .iter()
        .filter(|c| c.origin == CandidateOrigin::Document)
        .count();

    let context = assemble_context(
        &candidates,
        request.requester_is_owner,
        retrieval.max_context_chars,
    );

    tracing::debug!(
        candidates = candidates.len(),
        documents = doc_count_used,
        context_chars = context.len(),
        "Retrieval complete"
    );

    RetrievalOutcome {
        candidates,
        context,
        doc_count_used,
    }
}

/// Keep candidates above the similarity threshold, but never fewer than
/// `min_docs` when that many exist. `documents` must arrive sorted by
/// descending base score.
fn apply_threshold(
    documents: Vec<RetrievalCandidate>,
    threshold: f32,
    min_docs: usize,
) -> Vec<RetrievalCandidate> {
    let above = documents
        .iter()
        .take_while(|c| c.base_score >= threshold)
        .count();
    let keep = above.max(min_docs.min(documents.len()));
    let mut kept = documents;
    kept.truncate(keep);
    kept
}

/// Model-graded relevance: one call grading every candidate 0-10, one
/// line per document in `i: score` form. Missing or unparseable grades
/// fall back to the neutral default; a failed call leaves every
/// candidate at the default.
async fn grade_documents(
    query: &str,
    documents: &mut [RetrievalCandidate],
    keys: &KeyPool,
    backend: &dyn GenerativeBackend,
) {
    let listing = documents
        .iter()
        .enumerate()
        .map(|(i, c)| format!("{}: {}", i + 1, c.text))
        .collect::<Vec<_>>()
        .join("\n");

    let prompt = format!(
        "Grade how relevant each document is to the query, 0 (unrelated) to \
         10 (directly answers it). Reply with one line per document in the \
         form `<number>: <grade>`.\n\nQuery: {query}\n\nDocuments:\n{listing}",
        query = query,
        listing = listing,
    );

    for doc in documents.iter_mut() {
        doc.final_score = DEFAULT_GRADE;
    }

    let prompt = &prompt;
    let reply = keys
        .with_rotation(|key| async move {
            backend.generate(&key, &[ConversationTurn::user(prompt.clone())]).await
        })
        .await;

    let text = match reply {
        Ok(t) => t,
        Err(e) => {
            tracing::warn!(error = %e, "Relevance grading failed, using default grades");
            return;
        }
    };

    for line in text.lines() {
        let Some((index, grade)) = line.trim().split_once(':') else {
            continue;
        };
        let (Ok(index), Ok(grade)) = (index.trim().parse::<usize>(), grade.trim().parse::<f32>())
        else {
            continue;
        };
        if let Some(doc) = index.checked_sub(1).and_then(|i| documents.get_mut(i)) {
            doc.final_score = grade.clamp(0.0, 10.0);
        }
    }
}

/// Join formatted candidate texts under a character cap. Fallbacks when
/// the formatted block exceeds the cap: first drop the formatting and
/// join raw texts, then hard-truncate at a character boundary.
fn assemble_context(
    candidates: &[RetrievalCandidate],
    requester_is_owner: bool,
    max_chars: usize,
) -> String {
    let formatted = candidates
        .iter()
        .map(|c| match c.origin {
            CandidateOrigin::Document => c.text.clone(),
            CandidateOrigin::Memory => format_memory(c, requester_is_owner),
        })
        .collect::<Vec<_>>()
        .join("\n");

    if formatted.len() <= max_chars {
        return formatted;
    }

    tracing::warn!(
        chars = formatted.len(),
        cap = max_chars,
        "Context over cap, falling back to raw texts"
    );

    // Private memories stay redacted even on the fallback path
    let raw = candidates
        .iter()
        .map(|c| match c.origin {
            CandidateOrigin::Memory if !requester_is_owner => format_memory(c, false),
            _ => c.text.clone(),
        })
        .collect::<Vec<_>>()
        .join("\n");

    if raw.len() <= max_chars {
        return raw;
    }

    let mut cut = max_chars;
    while cut > 0 && !raw.is_char_boundary(cut) {
        cut -= 1;
    }
    raw[..cut].to_string()
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::Utc;
    use persona_core::generation::GenerationError;
    use persona_core::models::{MemoryAttrs, MemoryCategory};
    use persona_core::store::{InMemoryVectorStore, StoreRecord};
    use persona_core::EmbeddingError;

    struct StubEmbedder;

    #[async_trait]
    impl EmbeddingBackend for StubEmbedder {
        async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
            let mut v = vec![0.0f32; 16];
            for token in text.to_lowercase().split_whitespace() {
                let bucket = token.bytes().map(|b| b as usize).sum::<usize>() % 16;
                v[bucket] += 1.0;
            }
            Ok(v)
        }

        fn dimensions(&self) -> usize {
            16
        }

        fn name(&self) -> &str {
            "stub"
        }
    }

    struct NoCallGenerator;

    #[async_trait]
    impl GenerativeBackend for NoCallGenerator {
        async fn generate(
            &self,
            _api_key: &str,
            _messages: &[ConversationTurn],
        ) -> Result<String, GenerationError> {
            panic!("generator must not be called on the cosine path");
        }

        fn name(&self) -> &str {
            "no-call"
        }
    }

    fn keys() -> KeyPool {
        KeyPool::new(vec!["k".to_string()], 15, std::time::Duration::from_secs(60)).unwrap()
    }

    async fn seed_doc(store: &InMemoryVectorStore, embedder: &StubEmbedder, id: &str, owner: &str, text: &str) {
        let embedding = embedder.embed(text).await.unwrap();
        store
            .upsert(StoreRecord {
                id: id.to_string(),
                owner_id: owner.to_string(),
                kind: RecordKind::Document,
                source: Some("profile".to_string()),
                text: text.to_string(),
                embedding,
                memory: None,
                created_at: Utc::now(),
            })
            .await
            .unwrap();
    }

    fn report(doc_count: usize, threshold: f32, min_docs: usize) -> ComplexityReport {
        ComplexityReport {
            score: 5.0,
            doc_count,
            threshold,
            min_docs,
            strategy: super::super::analyze::Strategy::Heuristic,
        }
    }

    fn candidate(id: &str, base: f32) -> RetrievalCandidate {
        RetrievalCandidate {
            id: id.to_string(),
            text: format!("text {}", id),
            base_score: base,
            final_score: base * 10.0,
            origin: CandidateOrigin::Document,
            memory: None,
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn retrieval_finds_owner_documents_only() {
        let store = InMemoryVectorStore::new();
        let embedder = StubEmbedder;
        seed_doc(&store, &embedder, "d1", "u1", "Sahil works at Acme as an engineer").await;
        seed_doc(&store, &embedder, "d2", "u2", "a different owner's document").await;

        let rep = report(5, 0.0, 2);
        let request = RetrievalRequest {
            query: "Sahil works at Acme as an engineer",
            expanded_query: "Sahil works at Acme as an engineer",
            owner_id: "u1",
            requester_is_owner: true,
            report: &rep,
        };

        let outcome = retrieve_context(
            &request,
            &store,
            &embedder,
            &keys(),
            &NoCallGenerator,
            &RetrievalConfig::default(),
            &MemoryConfig::default(),
        )
        .await;

        assert!(outcome.context.contains("Sahil works at Acme"));
        assert!(!outcome.context.contains("different owner"));
        assert_eq!(outcome.doc_count_used, 1);
    }

    #[tokio::test]
    async fn unknown_owner_gets_empty_context() {
        let store = InMemoryVectorStore::new();
        let embedder = StubEmbedder;
        seed_doc(&store, &embedder, "d1", "u1", "Sahil works at Acme").await;

        let rep = report(5, 0.0, 2);
        let request = RetrievalRequest {
            query: "where does Sahil work",
            expanded_query: "where does Sahil work",
            owner_id: "nobody",
            requester_is_owner: false,
            report: &rep,
        };

        let outcome = retrieve_context(
            &request,
            &store,
            &embedder,
            &keys(),
            &NoCallGenerator,
            &RetrievalConfig::default(),
            &MemoryConfig::default(),
        )
        .await;

        assert!(outcome.context.is_empty());
        assert!(outcome.candidates.is_empty());
    }

    #[test]
    fn threshold_keeps_min_docs_when_all_fall_below() {
        let docs = vec![candidate("a", 0.10), candidate("b", 0.08), candidate("c", 0.02)];
        let kept = apply_threshold(docs, 0.25, 2);
        assert_eq!(kept.len(), 2, "backfill to min_docs");
        assert_eq!(kept[0].id, "a");
    }

    #[test]
    fn threshold_passes_everything_above() {
        let docs = vec![candidate("a", 0.9), candidate("b", 0.5), candidate("c", 0.1)];
        let kept = apply_threshold(docs, 0.25, 2);
        assert_eq!(kept.len(), 2);
        let kept = apply_threshold(
            vec![candidate("a", 0.9), candidate("b", 0.5), candidate("c", 0.4)],
            0.25,
            2,
        );
        assert_eq!(kept.len(), 3);
    }

    #[test]
    fn threshold_handles_fewer_docs_than_min() {
        let kept = apply_threshold(vec![candidate("a", 0.01)], 0.25, 3);
        assert_eq!(kept.len(), 1);
    }

    #[test]
    fn doc_final_score_is_similarity_times_ten() {
        let c = candidate("a", 0.73);
        assert!((c.final_score - 7.3).abs() < 1e-5);
    }

    #[test]
    fn context_falls_back_to_raw_then_truncates() {
        let candidates: Vec<RetrievalCandidate> =
            (0..4).map(|i| candidate(&format!("d{}", i), 0.5)).collect();

        let full = assemble_context(&candidates, true, 10_000);
        assert_eq!(full.lines().count(), 4);

        let truncated = assemble_context(&candidates, true, 10);
        assert!(truncated.len() <= 10);
    }

    #[test]
    fn private_memory_redacted_in_context_for_guests() {
        let mem = RetrievalCandidate {
            id: "m1".to_string(),
            text: "my password is hunter2".to_string(),
            base_score: 0.9,
            final_score: 1.4,
            origin: CandidateOrigin::Memory,
            memory: Some(MemoryAttrs {
                summary: "password".to_string(),
                category: MemoryCategory::Credentials,
                tags: vec![],
                importance: 8,
                privacy_level: 1,
            }),
            created_at: Utc::now(),
        };

        let guest_view = assemble_context(std::slice::from_ref(&mem), false, 10_000);
        assert!(!guest_view.contains("hunter2"));

        let owner_view = assemble_context(std::slice::from_ref(&mem), true, 10_000);
        assert!(owner_view.contains("hunter2"));
    }

    #[tokio::test]
    async fn memories_merge_into_candidates() {
        let store = InMemoryVectorStore::new();
        let embedder = StubEmbedder;
        seed_doc(&store, &embedder, "d1", "u1", "Sahil works at Acme").await;

        let text = "allergic to penicillin";
        let embedding = embedder.embed(text).await.unwrap();
        store
            .upsert(StoreRecord {
                id: "m1".to_string(),
                owner_id: "u1".to_string(),
                kind: RecordKind::Memory,
                source: None,
                text: text.to_string(),
                embedding,
                memory: Some(MemoryAttrs {
                    summary: "penicillin allergy".to_string(),
                    category: MemoryCategory::Health,
                    tags: vec![],
                    importance: 9,
                    privacy_level: 0,
                }),
                created_at: Utc::now(),
            })
            .await
            .unwrap();

        let rep = report(5, 0.0, 2);
        let request = RetrievalRequest {
            query: "where does Sahil work",
            expanded_query: "where does Sahil work",
            owner_id: "u1",
            requester_is_owner: true,
            report: &rep,
        };

        let outcome = retrieve_context(
            &request,
            &store,
            &embedder,
            &keys(),
            &NoCallGenerator,
            &RetrievalConfig::default(),
            &MemoryConfig::default(),
        )
        .await;

        assert!(
            outcome.candidates.iter().any(|c| c.id == "m1"),
            "importance 9 memory surfaces via the sweep"
        );
    }
}
