pub mod config;
pub mod embeddings;
pub mod error;
pub mod generation;
pub mod keypool;
pub mod models;
pub mod prompt;
pub mod store;

pub use config::PersonaConfig;
pub use embeddings::{
    blend_vectors, cosine_similarity, EmbeddingBackend, EmbeddingClientConfig, EmbeddingError,
    HttpEmbeddingClient, DEFAULT_DIMENSIONS,
};
pub use error::PersonaError;
pub use generation::{GenerationError, GenerativeBackend, HttpGenerativeClient};
pub use keypool::KeyPool;
pub use prompt::{InteractionKind, PromptSpec};
pub use store::{
    create_store, InMemoryVectorStore, PgVectorStore, RecordFilter, StoreError, StoreMatch,
    StoreRecord, VectorStore,
};
