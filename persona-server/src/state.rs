//! Shared application state.
//!
//! Every collaborator sits behind a trait object so handlers and tests
//! can swap implementations without touching the pipeline.

use std::sync::Arc;

use persona_core::embeddings::{EmbeddingClientConfig, HttpEmbeddingClient};
use persona_core::generation::{GenerativeBackend, HttpGenerativeClient};
use persona_core::store::{create_store, VectorStore};
use persona_core::{EmbeddingBackend, KeyPool, PersonaConfig, PersonaError};

use crate::session::{InMemorySessionStore, SessionStore};

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<PersonaConfig>,
    pub store: Arc<dyn VectorStore>,
    pub embedder: Arc<dyn EmbeddingBackend>,
    pub generator: Arc<dyn GenerativeBackend>,
    pub keys: Arc<KeyPool>,
    pub sessions: Arc<dyn SessionStore>,
}

impl AppState {
    /// Wire up production collaborators from config.
    pub async fn from_config(config: PersonaConfig) -> Result<Self, PersonaError> {
        let store: Arc<dyn VectorStore> =
            Arc::from(create_store(&config.store, &config.database).await?);

        let embed_config = EmbeddingClientConfig::from(&config.embedding);
        let embedder: Arc<dyn EmbeddingBackend> = if config.embedding.base_url.is_empty() {
            Arc::new(HttpEmbeddingClient::new(embed_config)?)
        } else {
            Arc::new(HttpEmbeddingClient::with_base_url(
                embed_config,
                config.embedding.base_url.clone(),
            )?)
        };

        let generator: Arc<dyn GenerativeBackend> = if config.generation.base_url.is_empty() {
            Arc::new(HttpGenerativeClient::new(
                config.generation.model.clone(),
                config.generation.max_tokens,
            )?)
        } else {
            Arc::new(HttpGenerativeClient::with_base_url(
                config.generation.model.clone(),
                config.generation.max_tokens,
                config.generation.base_url.clone(),
            )?)
        };

        let keys = Arc::new(KeyPool::from_config(&config.generation, &config.rotation)?);

        Ok(Self {
            config: Arc::new(config),
            store,
            embedder,
            generator,
            keys,
            sessions: Arc::new(InMemorySessionStore::new()),
        })
    }

    /// Assemble state from explicit collaborators. Used by tests and by
    /// embedders of the pipeline that bring their own backends.
    pub fn with_components(
        config: PersonaConfig,
        store: Arc<dyn VectorStore>,
        embedder: Arc<dyn EmbeddingBackend>,
        generator: Arc<dyn GenerativeBackend>,
        keys: Arc<KeyPool>,
        sessions: Arc<dyn SessionStore>,
    ) -> Self {
        Self {
            config: Arc::new(config),
            store,
            embedder,
            generator,
            keys,
            sessions,
        }
    }
}
