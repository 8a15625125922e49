//! Vector store abstraction.
//!
//! The nearest-neighbor store is an opaque collaborator: upsert, cosine
//! query with conjunctive metadata filters, batched delete. Every filter
//! carries a mandatory `owner_id` — cross-owner leakage is a correctness
//! violation, so the field is not optional at the type level.
//!
//! Two implementations: `PgVectorStore` (pgvector over sqlx, runtime
//! queries) and `InMemoryVectorStore` (tests, local development).

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use pgvector::Vector;
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, QueryBuilder, Row};
use thiserror::Error;

use crate::config::{DatabaseConfig, StoreConfig};
use crate::embeddings::cosine_similarity;
use crate::models::{MemoryAttrs, MemoryCategory, RecordKind};

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Unknown store backend: {0}")]
    UnknownBackend(String),
}

/// A record to be written. Immutable once stored; superseding
/// information is written as a newer record, never an update.
#[derive(Debug, Clone)]
pub struct StoreRecord {
    pub id: String,
    pub owner_id: String,
    pub kind: RecordKind,
    pub source: Option<String>,
    pub text: String,
    pub embedding: Vec<f32>,
    pub memory: Option<MemoryAttrs>,
    pub created_at: DateTime<Utc>,
}

/// A ranked match returned by a store query.
#[derive(Debug, Clone)]
pub struct StoreMatch {
    pub id: String,
    /// Cosine similarity for vector queries; 0.0 for metadata-only fetches
    pub score: f32,
    pub text: String,
    pub kind: RecordKind,
    pub source: Option<String>,
    pub memory: Option<MemoryAttrs>,
    pub created_at: DateTime<Utc>,
    /// Raw stored vector, when the backend returns it
    pub embedding: Option<Vec<f32>>,
}

/// Conjunctive equality/range predicate over record metadata.
#[derive(Debug, Clone)]
pub struct RecordFilter {
    pub owner_id: String,
    pub kind: Option<RecordKind>,
    pub category: Option<MemoryCategory>,
    pub min_importance: Option<i32>,
    pub source: Option<String>,
}

impl RecordFilter {
    pub fn owner(owner_id: impl Into<String>) -> Self {
        Self {
            owner_id: owner_id.into(),
            kind: None,
            category: None,
            min_importance: None,
            source: None,
        }
    }

    pub fn with_kind(mut self, kind: RecordKind) -> Self {
        self.kind = Some(kind);
        self
    }

    pub fn with_category(mut self, category: MemoryCategory) -> Self {
        self.category = Some(category);
        self
    }

    pub fn with_min_importance(mut self, importance: i32) -> Self {
        self.min_importance = Some(importance);
        self
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }
}

#[async_trait]
pub trait VectorStore: Send + Sync {
    async fn upsert(&self, record: StoreRecord) -> Result<(), StoreError>;

    /// Nearest-neighbor query, highest similarity first. Results are
    /// always scoped by the filter's owner.
    async fn query(
        &self,
        vector: &[f32],
        top_k: usize,
        filter: &RecordFilter,
    ) -> Result<Vec<StoreMatch>, StoreError>;

    /// Metadata-only fetch, most recent first. Used for sweeps that
    /// must surface regardless of query relevance (importance floor).
    async fn fetch(&self, filter: &RecordFilter, limit: usize) -> Result<Vec<StoreMatch>, StoreError>;

    /// Delete by id, batched internally.
    async fn delete(&self, ids: &[String]) -> Result<(), StoreError>;

    /// Delete everything matching the filter, returning the count.
    async fn delete_matching(&self, filter: &RecordFilter) -> Result<u64, StoreError>;

    /// Backend name for logging.
    fn name(&self) -> &str;
}

/// Create the configured store backend.
pub async fn create_store(
    store: &StoreConfig,
    database: &DatabaseConfig,
) -> Result<Box<dyn VectorStore>, StoreError> {
    match store.backend.as_str() {
        "pgvector" => {
            let pg = PgVectorStore::connect(database, store.delete_batch_size).await?;
            Ok(Box::new(pg))
        }
        "memory" => Ok(Box::new(InMemoryVectorStore::new())),
        other => Err(StoreError::UnknownBackend(other.to_string())),
    }
}

// ============================================================================
// PgVectorStore
// ============================================================================

pub struct PgVectorStore {
    pool: PgPool,
    delete_batch_size: usize,
}

impl PgVectorStore {
    pub async fn connect(
        config: &DatabaseConfig,
        delete_batch_size: usize,
    ) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .connect(&config.url)
            .await?;
        Ok(Self::new(pool, delete_batch_size))
    }

    pub fn new(pool: PgPool, delete_batch_size: usize) -> Self {
        Self {
            pool,
            delete_batch_size: delete_batch_size.max(1),
        }
    }

    /// Create the backing table and index if they do not exist.
    pub async fn ensure_schema(&self, dimensions: usize) -> Result<(), StoreError> {
        sqlx::query(&format!(
            r#"
            CREATE TABLE IF NOT EXISTS persona_records (
                id TEXT PRIMARY KEY,
                owner_id TEXT NOT NULL,
                kind TEXT NOT NULL,
                source TEXT,
                content TEXT NOT NULL,
                embedding vector({dimensions}),
                summary TEXT,
                category TEXT,
                tags JSONB NOT NULL DEFAULT '[]'::jsonb,
                importance INT,
                privacy_level INT,
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#
        ))
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS persona_records_owner_idx ON persona_records (owner_id, kind)",
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    fn push_filter(builder: &mut QueryBuilder<'_, sqlx::Postgres>, filter: &RecordFilter) {
        builder.push(" owner_id = ").push_bind(filter.owner_id.clone());
        if let Some(kind) = filter.kind {
            builder.push(" AND kind = ").push_bind(kind.as_str());
        }
        if let Some(category) = filter.category {
            builder.push(" AND category = ").push_bind(category.as_str());
        }
        if let Some(importance) = filter.min_importance {
            builder.push(" AND importance >= ").push_bind(importance);
        }
        if let Some(source) = &filter.source {
            builder.push(" AND source = ").push_bind(source.clone());
        }
    }

    fn row_to_match(row: &sqlx::postgres::PgRow, score: f32) -> StoreMatch {
        let kind: String = row.get("kind");
        let category: Option<String> = row.get("category");
        let memory = if kind == "memory" {
            let tags: serde_json::Value = row.get("tags");
            Some(MemoryAttrs {
                summary: row.get::<Option<String>, _>("summary").unwrap_or_default(),
                category: category
                    .as_deref()
                    .and_then(MemoryCategory::parse)
                    .unwrap_or(MemoryCategory::General),
                tags: tags
                    .as_array()
                    .map(|a| {
                        a.iter()
                            .filter_map(|v| v.as_str().map(String::from))
                            .collect()
                    })
                    .unwrap_or_default(),
                importance: row.get::<Option<i32>, _>("importance").unwrap_or(5),
                privacy_level: row.get::<Option<i32>, _>("privacy_level").unwrap_or(0),
            })
        } else {
            None
        };

        let embedding: Option<Vector> = row.get("embedding");

        StoreMatch {
            id: row.get("id"),
            score,
            text: row.get("content"),
            kind: if kind == "memory" {
                RecordKind::Memory
            } else {
                RecordKind::Document
            },
            source: row.get("source"),
            memory,
            created_at: row.get("created_at"),
            embedding: embedding.map(|v| v.to_vec()),
        }
    }
}

#[async_trait]
impl VectorStore for PgVectorStore {
    async fn upsert(&self, record: StoreRecord) -> Result<(), StoreError> {
        let (summary, category, tags, importance, privacy_level) = match &record.memory {
            Some(m) => (
                Some(m.summary.clone()),
                Some(m.category.as_str().to_string()),
                serde_json::json!(m.tags),
                Some(m.importance),
                Some(m.privacy_level),
            ),
            None => (None, None, serde_json::json!([]), None, None),
        };

        sqlx::query(
            r#"
            INSERT INTO persona_records
                (id, owner_id, kind, source, content, embedding,
                 summary, category, tags, importance, privacy_level, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            ON CONFLICT (id) DO NOTHING
            "#,
        )
        .bind(&record.id)
        .bind(&record.owner_id)
        .bind(record.kind.as_str())
        .bind(&record.source)
        .bind(&record.text)
        .bind(Vector::from(record.embedding.clone()))
        .bind(summary)
        .bind(category)
        .bind(tags)
        .bind(importance)
        .bind(privacy_level)
        .bind(record.created_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn query(
        &self,
        vector: &[f32],
        top_k: usize,
        filter: &RecordFilter,
    ) -> Result<Vec<StoreMatch>, StoreError> {
        let query_vector = Vector::from(vector.to_vec());

        let mut builder = QueryBuilder::new(
            "SELECT id, owner_id, kind, source, content, embedding, summary, category, \
             tags, importance, privacy_level, created_at, 1 - (embedding <=> ",
        );
        builder.push_bind(query_vector.clone());
        builder.push(") AS score FROM persona_records WHERE embedding IS NOT NULL AND ");
        Self::push_filter(&mut builder, filter);
        builder.push(" ORDER BY embedding <=> ").push_bind(query_vector);
        builder.push(" LIMIT ").push_bind(top_k as i64);

        let rows = builder.build().fetch_all(&self.pool).await?;

        Ok(rows
            .iter()
            .map(|row| {
                let score: f64 = row.get("score");
                Self::row_to_match(row, score as f32)
            })
            .collect())
    }

    async fn fetch(&self, filter: &RecordFilter, limit: usize) -> Result<Vec<StoreMatch>, StoreError> {
        let mut builder = QueryBuilder::new(
            "SELECT id, owner_id, kind, source, content, embedding, summary, category, \
             tags, importance, privacy_level, created_at FROM persona_records WHERE ",
        );
        Self::push_filter(&mut builder, filter);
        builder.push(" ORDER BY created_at DESC LIMIT ").push_bind(limit as i64);

        let rows = builder.build().fetch_all(&self.pool).await?;
        Ok(rows.iter().map(|row| Self::row_to_match(row, 0.0)).collect())
    }

    async fn delete(&self, ids: &[String]) -> Result<(), StoreError> {
        for chunk in ids.chunks(self.delete_batch_size) {
            sqlx::query("DELETE FROM persona_records WHERE id = ANY($1)")
                .bind(chunk)
                .execute(&self.pool)
                .await?;
        }
        Ok(())
    }

    async fn delete_matching(&self, filter: &RecordFilter) -> Result<u64, StoreError> {
        let mut builder = QueryBuilder::new("DELETE FROM persona_records WHERE ");
        Self::push_filter(&mut builder, filter);
        let result = builder.build().execute(&self.pool).await?;
        Ok(result.rows_affected())
    }

    fn name(&self) -> &str {
        "pgvector"
    }
}

// ============================================================================
// InMemoryVectorStore
// ============================================================================

/// Mutex-guarded map store with linear cosine scan. Backs tests and
/// local development; semantics mirror the pgvector implementation.
#[derive(Default)]
pub struct InMemoryVectorStore {
    records: Mutex<HashMap<String, StoreRecord>>,
}

impl InMemoryVectorStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn matches(record: &StoreRecord, filter: &RecordFilter) -> bool {
        if record.owner_id != filter.owner_id {
            return false;
        }
        if let Some(kind) = filter.kind {
            if record.kind != kind {
                return false;
            }
        }
        if let Some(category) = filter.category {
            match &record.memory {
                Some(m) if m.category == category => {}
                _ => return false,
            }
        }
        if let Some(min) = filter.min_importance {
            match &record.memory {
                Some(m) if m.importance >= min => {}
                _ => return false,
            }
        }
        if let Some(source) = &filter.source {
            if record.source.as_deref() != Some(source.as_str()) {
                return false;
            }
        }
        true
    }

    fn to_match(record: &StoreRecord, score: f32) -> StoreMatch {
        StoreMatch {
            id: record.id.clone(),
            score,
            text: record.text.clone(),
            kind: record.kind,
            source: record.source.clone(),
            memory: record.memory.clone(),
            created_at: record.created_at,
            embedding: Some(record.embedding.clone()),
        }
    }
}

#[async_trait]
impl VectorStore for InMemoryVectorStore {
    async fn upsert(&self, record: StoreRecord) -> Result<(), StoreError> {
        let mut records = self.records.lock().expect("store mutex poisoned");
        records.insert(record.id.clone(), record);
        Ok(())
    }

    async fn query(
        &self,
        vector: &[f32],
        top_k: usize,
        filter: &RecordFilter,
    ) -> Result<Vec<StoreMatch>, StoreError> {
        let records = self.records.lock().expect("store mutex poisoned");
        let mut scored: Vec<StoreMatch> = records
            .values()
            .filter(|r| Self::matches(r, filter))
            .map(|r| Self::to_match(r, cosine_similarity(vector, &r.embedding)))
            .collect();

        scored.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(top_k);
        Ok(scored)
    }

    async fn fetch(&self, filter: &RecordFilter, limit: usize) -> Result<Vec<StoreMatch>, StoreError> {
        let records = self.records.lock().expect("store mutex poisoned");
        let mut matched: Vec<StoreMatch> = records
            .values()
            .filter(|r| Self::matches(r, filter))
            .map(|r| Self::to_match(r, 0.0))
            .collect();

        matched.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        matched.truncate(limit);
        Ok(matched)
    }

    async fn delete(&self, ids: &[String]) -> Result<(), StoreError> {
        let mut records = self.records.lock().expect("store mutex poisoned");
        for id in ids {
            records.remove(id);
        }
        Ok(())
    }

    async fn delete_matching(&self, filter: &RecordFilter) -> Result<u64, StoreError> {
        let mut records = self.records.lock().expect("store mutex poisoned");
        let doomed: Vec<String> = records
            .values()
            .filter(|r| Self::matches(r, filter))
            .map(|r| r.id.clone())
            .collect();
        for id in &doomed {
            records.remove(id);
        }
        Ok(doomed.len() as u64)
    }

    fn name(&self) -> &str {
        "memory"
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn doc(id: &str, owner: &str, text: &str, embedding: Vec<f32>) -> StoreRecord {
        StoreRecord {
            id: id.to_string(),
            owner_id: owner.to_string(),
            kind: RecordKind::Document,
            source: Some("test".to_string()),
            text: text.to_string(),
            embedding,
            memory: None,
            created_at: Utc::now(),
        }
    }

    fn memory(id: &str, owner: &str, importance: i32, category: MemoryCategory) -> StoreRecord {
        StoreRecord {
            id: id.to_string(),
            owner_id: owner.to_string(),
            kind: RecordKind::Memory,
            source: None,
            text: format!("memory {}", id),
            embedding: vec![0.5, 0.5, 0.0],
            memory: Some(MemoryAttrs {
                summary: format!("summary {}", id),
                category,
                tags: vec![],
                importance,
                privacy_level: 0,
            }),
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn query_is_owner_scoped() {
        let store = InMemoryVectorStore::new();
        store.upsert(doc("a", "u1", "alpha", vec![1.0, 0.0, 0.0])).await.unwrap();
        store.upsert(doc("b", "u2", "beta", vec![1.0, 0.0, 0.0])).await.unwrap();

        let matches = store
            .query(&[1.0, 0.0, 0.0], 10, &RecordFilter::owner("u1"))
            .await
            .unwrap();

        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].id, "a");
    }

    #[tokio::test]
    async fn query_orders_by_similarity() {
        let store = InMemoryVectorStore::new();
        store.upsert(doc("near", "u1", "near", vec![1.0, 0.0, 0.0])).await.unwrap();
        store.upsert(doc("far", "u1", "far", vec![0.0, 1.0, 0.0])).await.unwrap();

        let matches = store
            .query(&[1.0, 0.1, 0.0], 10, &RecordFilter::owner("u1"))
            .await
            .unwrap();

        assert_eq!(matches[0].id, "near");
        assert!(matches[0].score > matches[1].score);
    }

    #[tokio::test]
    async fn category_and_importance_filters() {
        let store = InMemoryVectorStore::new();
        store.upsert(memory("m1", "u1", 9, MemoryCategory::Work)).await.unwrap();
        store.upsert(memory("m2", "u1", 3, MemoryCategory::Work)).await.unwrap();
        store.upsert(memory("m3", "u1", 9, MemoryCategory::Health)).await.unwrap();

        let filter = RecordFilter::owner("u1")
            .with_kind(RecordKind::Memory)
            .with_category(MemoryCategory::Work)
            .with_min_importance(8);
        let matches = store.fetch(&filter, 10).await.unwrap();

        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].id, "m1");
    }

    #[tokio::test]
    async fn delete_matching_counts_and_respects_source() {
        let store = InMemoryVectorStore::new();
        store.upsert(doc("a", "u1", "alpha", vec![1.0, 0.0, 0.0])).await.unwrap();
        store.upsert(doc("b", "u1", "beta", vec![1.0, 0.0, 0.0])).await.unwrap();
        store.upsert(doc("c", "u2", "gamma", vec![1.0, 0.0, 0.0])).await.unwrap();

        let deleted = store
            .delete_matching(&RecordFilter::owner("u1").with_source("test"))
            .await
            .unwrap();
        assert_eq!(deleted, 2);

        let remaining = store
            .query(&[1.0, 0.0, 0.0], 10, &RecordFilter::owner("u2"))
            .await
            .unwrap();
        assert_eq!(remaining.len(), 1);
    }

    #[tokio::test]
    async fn delete_by_id() {
        let store = InMemoryVectorStore::new();
        store.upsert(doc("a", "u1", "alpha", vec![1.0, 0.0, 0.0])).await.unwrap();
        store.delete(&["a".to_string()]).await.unwrap();
        let matches = store
            .query(&[1.0, 0.0, 0.0], 10, &RecordFilter::owner("u1"))
            .await
            .unwrap();
        assert!(matches.is_empty());
    }
}
