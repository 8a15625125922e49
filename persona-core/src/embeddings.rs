//! Embedding client and vector math for the retrieval pipeline.
//!
//! The embedding service is an opaque contract: `embed(text)` returns a
//! fixed-length float vector, deterministic for identical input. The
//! HTTP client targets the Gemini `embedContent` wire format; tests run
//! it against a wiremock server.

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use tokio_retry::strategy::{jitter, ExponentialBackoff};
use tokio_retry::Retry;

/// Embedding dimension fixed by the reference service.
pub const DEFAULT_DIMENSIONS: usize = 768;

/// Abstraction over embedding providers.
#[async_trait]
pub trait EmbeddingBackend: Send + Sync {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError>;

    /// Returns the embedding dimension (768 in the reference instance).
    fn dimensions(&self) -> usize;

    /// Backend name for logging.
    fn name(&self) -> &str;
}

#[derive(Error, Debug)]
pub enum EmbeddingError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("API error ({code}): {message}")]
    Api { code: u16, message: String },

    #[error("Invalid response: expected {expected} dimensions, got {actual}")]
    InvalidDimensions { expected: usize, actual: usize },

    #[error("Missing API key")]
    MissingApiKey,

    #[error("All {attempts} retry attempts failed")]
    RetryExhausted { attempts: usize },
}

/// HTTP embedding client configuration.
#[derive(Debug, Clone)]
pub struct EmbeddingClientConfig {
    pub api_key: String,
    pub model: String,
    pub dimensions: usize,
    pub max_retries: usize,
    pub retry_delay_ms: u64,
}

impl From<&crate::config::EmbeddingConfig> for EmbeddingClientConfig {
    fn from(c: &crate::config::EmbeddingConfig) -> Self {
        let api_key = if c.api_key.is_empty() {
            std::env::var("PERSONA_EMBED_KEY").unwrap_or_default()
        } else {
            c.api_key.clone()
        };
        Self {
            api_key,
            model: c.model.clone(),
            dimensions: c.dimensions,
            max_retries: c.max_retries,
            retry_delay_ms: c.retry_delay_ms,
        }
    }
}

// ============================================================================
// Wire structs (private)
// ============================================================================

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct EmbedRequest {
    model: String,
    content: EmbedContent,
    output_dimensionality: usize,
}

#[derive(Debug, Serialize)]
struct EmbedContent {
    parts: Vec<EmbedPart>,
}

#[derive(Debug, Serialize)]
struct EmbedPart {
    text: String,
}

#[derive(Debug, Deserialize)]
struct EmbedResponse {
    embedding: EmbedValues,
}

#[derive(Debug, Deserialize)]
struct EmbedValues {
    values: Vec<f32>,
}

#[derive(Debug, Deserialize)]
struct ApiErrorResponse {
    error: Option<ApiErrorDetail>,
}

#[derive(Debug, Deserialize)]
struct ApiErrorDetail {
    code: u16,
    message: String,
}

// ============================================================================
// HttpEmbeddingClient
// ============================================================================

/// Embedding client over HTTP with exponential-backoff retries.
#[derive(Debug, Clone)]
pub struct HttpEmbeddingClient {
    client: Client,
    config: EmbeddingClientConfig,
    base_url: String,
}

impl HttpEmbeddingClient {
    pub fn new(config: EmbeddingClientConfig) -> Result<Self, EmbeddingError> {
        Self::with_base_url(
            config,
            "https://generativelanguage.googleapis.com/v1beta".to_string(),
        )
    }

    /// Create a client with a custom base URL (for testing / integration).
    pub fn with_base_url(
        config: EmbeddingClientConfig,
        base_url: String,
    ) -> Result<Self, EmbeddingError> {
        if config.api_key.is_empty() {
            return Err(EmbeddingError::MissingApiKey);
        }

        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;

        Ok(Self {
            client,
            config,
            base_url,
        })
    }

    async fn embed_once(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        let url = format!(
            "{}/models/{}:embedContent?key={}",
            self.base_url, self.config.model, self.config.api_key
        );

        let request = EmbedRequest {
            model: format!("models/{}", self.config.model),
            content: EmbedContent {
                parts: vec![EmbedPart {
                    text: text.to_string(),
                }],
            },
            output_dimensionality: self.config.dimensions,
        };

        let response = self.client.post(&url).json(&request).send().await?;
        let status = response.status();

        if !status.is_success() {
            let error_body = response.text().await.unwrap_or_default();
            let detail = serde_json::from_str::<ApiErrorResponse>(&error_body)
                .ok()
                .and_then(|e| e.error);
            let (code, message) = detail
                .map(|e| (e.code, e.message))
                .unwrap_or((status.as_u16(), error_body));

            tracing::error!(code = code, message = %message, "Embedding API error");
            return Err(EmbeddingError::Api { code, message });
        }

        let body: EmbedResponse = response.json().await?;
        let values = body.embedding.values;

        if values.len() != self.config.dimensions {
            return Err(EmbeddingError::InvalidDimensions {
                expected: self.config.dimensions,
                actual: values.len(),
            });
        }

        Ok(values)
    }
}

#[async_trait]
impl EmbeddingBackend for HttpEmbeddingClient {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        let retry_strategy = ExponentialBackoff::from_millis(self.config.retry_delay_ms)
            .max_delay(Duration::from_secs(10))
            .map(jitter)
            .take(self.config.max_retries);

        match Retry::spawn(retry_strategy, || self.embed_once(text)).await {
            Ok(v) => Ok(v),
            Err(e) => {
                tracing::error!(
                    attempts = self.config.max_retries,
                    error = %e,
                    "All embedding retry attempts failed"
                );
                Err(EmbeddingError::RetryExhausted {
                    attempts: self.config.max_retries,
                })
            }
        }
    }

    fn dimensions(&self) -> usize {
        self.config.dimensions
    }

    fn name(&self) -> &str {
        "http-embed"
    }
}

// ============================================================================
// Vector math
// ============================================================================

/// Weighted linear combination of two equal-length vectors, then
/// L2-normalized. If the combined norm is zero the unnormalized blend is
/// returned unchanged (a degenerate query still yields a usable vector).
pub fn blend_vectors(raw: &[f32], expanded: &[f32], raw_weight: f32, expanded_weight: f32) -> Vec<f32> {
    let mut blended: Vec<f32> = raw
        .iter()
        .zip(expanded.iter())
        .map(|(r, e)| r * raw_weight + e * expanded_weight)
        .collect();

    let norm: f32 = blended.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm > 0.0 {
        for v in blended.iter_mut() {
            *v /= norm;
        }
    }
    blended
}

/// Cosine similarity in [-1, 1]; zero-norm inputs score 0.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|v| v * v).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a * norm_b)
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn test_config(api_key: &str) -> EmbeddingClientConfig {
        EmbeddingClientConfig {
            api_key: api_key.to_string(),
            model: "gemini-embedding-001".to_string(),
            dimensions: DEFAULT_DIMENSIONS,
            max_retries: 3,
            retry_delay_ms: 10,
        }
    }

    fn mock_embedding_response() -> serde_json::Value {
        let values: Vec<f32> = (0..768).map(|i| (i as f32) / 768.0).collect();
        serde_json::json!({ "embedding": { "values": values } })
    }

    #[tokio::test]
    async fn embed_returns_768_dim_vector() {
        let mock_server = MockServer::start().await;
        let client =
            HttpEmbeddingClient::with_base_url(test_config("test-key"), mock_server.uri())
                .expect("Failed to create client");

        Mock::given(method("POST"))
            .and(path("/models/gemini-embedding-001:embedContent"))
            .respond_with(ResponseTemplate::new(200).set_body_json(mock_embedding_response()))
            .mount(&mock_server)
            .await;

        let result = client.embed("hello world").await;
        assert!(result.is_ok(), "Expected Ok, got Err: {:?}", result.err());
        assert_eq!(result.unwrap().len(), 768);
    }

    #[tokio::test]
    async fn embed_exhausts_retries_on_500() {
        let mock_server = MockServer::start().await;
        let client =
            HttpEmbeddingClient::with_base_url(test_config("test-key"), mock_server.uri())
                .expect("Failed to create client");

        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500).set_body_json(serde_json::json!({
                "error": { "code": 500, "message": "Internal server error" }
            })))
            .mount(&mock_server)
            .await;

        match client.embed("hello world").await {
            Err(EmbeddingError::RetryExhausted { attempts }) => assert_eq!(attempts, 3),
            other => panic!("Expected RetryExhausted, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn embed_retries_on_429_then_succeeds() {
        let mock_server = MockServer::start().await;
        let client =
            HttpEmbeddingClient::with_base_url(test_config("test-key"), mock_server.uri())
                .expect("Failed to create client");

        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(429).set_body_json(serde_json::json!({
                "error": { "code": 429, "message": "Rate limit exceeded" }
            })))
            .up_to_n_times(1)
            .mount(&mock_server)
            .await;

        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(mock_embedding_response()))
            .mount(&mock_server)
            .await;

        let result = client.embed("hello world").await;
        assert!(result.is_ok(), "Expected success after retry");
    }

    #[tokio::test]
    async fn missing_api_key_is_rejected_at_construction() {
        match HttpEmbeddingClient::new(test_config("")) {
            Err(EmbeddingError::MissingApiKey) => {}
            other => panic!("Expected MissingApiKey, got {:?}", other.err()),
        }
    }

    #[tokio::test]
    async fn wrong_dimensions_are_rejected() {
        let mock_server = MockServer::start().await;
        let client =
            HttpEmbeddingClient::with_base_url(test_config("test-key"), mock_server.uri())
                .expect("Failed to create client");

        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "embedding": { "values": [0.1, 0.2, 0.3] }
            })))
            .mount(&mock_server)
            .await;

        let result = client.embed("hello world").await;
        assert!(
            matches!(
                result,
                Err(EmbeddingError::RetryExhausted { .. })
            ),
            "short vectors should fail every attempt"
        );
    }

    #[test]
    fn blend_is_normalized() {
        let raw = vec![1.0, 0.0, 0.0];
        let expanded = vec![0.0, 1.0, 0.0];
        let blended = blend_vectors(&raw, &expanded, 0.3, 0.7);
        let norm: f32 = blended.iter().map(|v| v * v).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5, "norm was {}", norm);
        assert!(blended[1] > blended[0], "expanded weight dominates");
    }

    #[test]
    fn blend_zero_norm_returns_unnormalized() {
        let blended = blend_vectors(&[0.0, 0.0], &[0.0, 0.0], 0.3, 0.7);
        assert_eq!(blended, vec![0.0, 0.0]);
    }

    #[test]
    fn cosine_bounds_and_degenerate_input() {
        assert!((cosine_similarity(&[1.0, 0.0], &[1.0, 0.0]) - 1.0).abs() < 1e-6);
        assert!((cosine_similarity(&[1.0, 0.0], &[-1.0, 0.0]) + 1.0).abs() < 1e-6);
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 0.0]), 0.0);
    }
}
