//! Generative model client.
//!
//! Invoked through the `KeyPool` so every call carries an explicit
//! credential; the client itself holds no key state. Rate-limit and
//! quota failures are classified so the pool can rotate and retry.

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

use crate::models::{ConversationTurn, Role};

#[derive(Error, Debug)]
pub enum GenerationError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("API error ({code}): {message}")]
    Api { code: u16, message: String },

    #[error("Model returned no candidates")]
    EmptyResponse,

    #[error("All {attempts} credentials exhausted by rate limits")]
    AllKeysExhausted { attempts: usize },
}

impl GenerationError {
    /// True when the upstream failure signals a rate-limit or quota
    /// condition, which the key pool recovers from by rotating.
    pub fn is_rate_limited(&self) -> bool {
        match self {
            GenerationError::Api { code, message } => {
                let message = message.to_lowercase();
                *code == 429
                    || message.contains("rate limit")
                    || message.contains("quota")
                    || message.contains("resource_exhausted")
            }
            _ => false,
        }
    }
}

/// Abstraction over generative providers.
#[async_trait]
pub trait GenerativeBackend: Send + Sync {
    /// Produce a reply for the given message sequence using the supplied
    /// credential. The last message is the fully rendered prompt.
    async fn generate(
        &self,
        api_key: &str,
        messages: &[ConversationTurn],
    ) -> Result<String, GenerationError>;

    /// Backend name for logging.
    fn name(&self) -> &str;
}

// ============================================================================
// Wire structs (private)
// ============================================================================

#[derive(Debug, Serialize)]
struct GenerateRequest {
    contents: Vec<WireContent>,
    #[serde(rename = "generationConfig")]
    generation_config: WireGenerationConfig,
}

#[derive(Debug, Serialize)]
struct WireContent {
    role: String,
    parts: Vec<WirePart>,
}

#[derive(Debug, Serialize, Deserialize)]
struct WirePart {
    text: String,
}

#[derive(Debug, Serialize)]
struct WireGenerationConfig {
    #[serde(rename = "maxOutputTokens")]
    max_output_tokens: u32,
}

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    candidates: Option<Vec<WireCandidate>>,
}

#[derive(Debug, Deserialize)]
struct WireCandidate {
    content: Option<WireCandidateContent>,
}

#[derive(Debug, Deserialize)]
struct WireCandidateContent {
    parts: Option<Vec<WirePart>>,
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
// HttpGenerativeClient
// ============================================================================

/// Generative client over HTTP targeting the `generateContent` wire format.
#[derive(Debug, Clone)]
pub struct HttpGenerativeClient {
    client: Client,
    model: String,
    max_tokens: u32,
    base_url: String,
}

impl HttpGenerativeClient {
    pub fn new(model: String, max_tokens: u32) -> Result<Self, GenerationError> {
        Self::with_base_url(
            model,
            max_tokens,
            "https://generativelanguage.googleapis.com/v1beta".to_string(),
        )
    }

    /// Create a client with a custom base URL (for testing / integration).
    pub fn with_base_url(
        model: String,
        max_tokens: u32,
        base_url: String,
    ) -> Result<Self, GenerationError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;

        Ok(Self {
            client,
            model,
            max_tokens,
            base_url,
        })
    }

    fn wire_role(role: Role) -> &'static str {
        match role {
            Role::Assistant => "model",
            // The wire format has no system role; system text rides as user
            Role::User | Role::System => "user",
        }
    }
}

#[async_trait]
impl GenerativeBackend for HttpGenerativeClient {
    async fn generate(
        &self,
        api_key: &str,
        messages: &[ConversationTurn],
    ) -> Result<String, GenerationError> {
        let url = format!(
            "{}/models/{}:generateContent?key={}",
            self.base_url, self.model, api_key
        );

        let request = GenerateRequest {
            contents: messages
                .iter()
                .map(|m| WireContent {
                    role: Self::wire_role(m.role).to_string(),
                    parts: vec![WirePart {
                        text: m.content.clone(),
                    }],
                })
                .collect(),
            generation_config: WireGenerationConfig {
                max_output_tokens: self.max_tokens,
            },
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

            tracing::warn!(code = code, message = %message, "Generation API error");
            return Err(GenerationError::Api { code, message });
        }

        let body: GenerateResponse = response.json().await?;
        let text = body
            .candidates
            .and_then(|mut c| if c.is_empty() { None } else { Some(c.remove(0)) })
            .and_then(|c| c.content)
            .and_then(|c| c.parts)
            .map(|parts| {
                parts
                    .into_iter()
                    .map(|p| p.text)
                    .collect::<Vec<_>>()
                    .join("")
            })
            .filter(|t| !t.is_empty())
            .ok_or(GenerationError::EmptyResponse)?;

        Ok(text)
    }

    fn name(&self) -> &str {
        "http-generate"
    }
}

// ============================================================================
// TESTS
// ============================================================================
