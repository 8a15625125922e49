//! Document ingestion and owner data removal.

use chrono::Utc;
use persona_core::models::RecordKind;
use persona_core::store::{RecordFilter, StoreRecord, VectorStore};
use persona_core::{EmbeddingBackend, PersonaError};
use uuid::Uuid;

/// Embed and store one profile document under the owner's namespace.
/// Returns the generated record id.
pub async fn ingest_document(
    owner_id: &str,
    text: &str,
    source: Option<String>,
    store: &dyn VectorStore,
    embedder: &dyn EmbeddingBackend,
) -> Result<String, PersonaError> {
    if owner_id.trim().is_empty() {
        return Err(PersonaError::InvalidInput("owner_id is required".to_string()));
    }
    if text.trim().is_empty() {
        return Err(PersonaError::InvalidInput("document text is required".to_string()));
    }

    let embedding = embedder.embed(text).await?;
    let id = format!("doc_{}_{}", owner_id, Uuid::new_v4());

    store
        .upsert(StoreRecord {
            id: id.clone(),
            owner_id: owner_id.to_string(),
            kind: RecordKind::Document,
            source,
            text: text.to_string(),
            embedding,
            memory: None,
            created_at: Utc::now(),
        })
        .await?;

    tracing::info!(id = %id, chars = text.len(), "Document ingested");
    Ok(id)
}

/// Delete an owner's records, optionally restricted to one source tag.
/// Returns how many records were removed.
pub async fn delete_owner_data(
    owner_id: &str,
    source: Option<&str>,
    store: &dyn VectorStore,
) -> Result<u64, PersonaError> {
    if owner_id.trim().is_empty() {
        return Err(PersonaError::InvalidInput("owner_id is required".to_string()));
    }

    let mut filter = RecordFilter::owner(owner_id);
    if let Some(source) = source {
        filter = filter.with_source(source);
    }

    let deleted = store.delete_matching(&filter).await?;
    tracing::info!(owner = %owner_id, deleted, "Owner data deleted");
    Ok(deleted)
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use persona_core::store::InMemoryVectorStore;
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

    #[tokio::test]
    async fn ingest_generates_owner_prefixed_id() {
        let store = InMemoryVectorStore::new();
        let id = ingest_document("u1", "Sahil works at Acme", None, &store, &StubEmbedder)
            .await
            .unwrap();
        assert!(id.starts_with("doc_u1_"));
    }

    #[tokio::test]
    async fn empty_text_is_rejected_before_any_call() {
        let store = InMemoryVectorStore::new();
        let result = ingest_document("u1", "   ", None, &store, &StubEmbedder).await;
        assert!(matches!(result, Err(PersonaError::InvalidInput(_))));
    }

    #[tokio::test]
    async fn delete_respects_source_filter() {
        let store = InMemoryVectorStore::new();
        ingest_document("u1", "a", Some("resume".to_string()), &store, &StubEmbedder)
            .await
            .unwrap();
        ingest_document("u1", "b", Some("linkedin".to_string()), &store, &StubEmbedder)
            .await
            .unwrap();

        let deleted = delete_owner_data("u1", Some("resume"), &store).await.unwrap();
        assert_eq!(deleted, 1);

        let deleted_rest = delete_owner_data("u1", None, &store).await.unwrap();
        assert_eq!(deleted_rest, 1);
    }

    #[tokio::test]
    async fn delete_scopes_to_owner() {
        let store = InMemoryVectorStore::new();
        ingest_document("u1", "a", None, &store, &StubEmbedder).await.unwrap();
        ingest_document("u2", "b", None, &store, &StubEmbedder).await.unwrap();

        let deleted = delete_owner_data("u1", None, &store).await.unwrap();
        assert_eq!(deleted, 1);
        assert_eq!(delete_owner_data("u2", None, &store).await.unwrap(), 1);
    }
}
