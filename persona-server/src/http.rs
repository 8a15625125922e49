//! Persona HTTP REST API
//!
//! Axum-based HTTP server exposing the ask pipeline, document ingest,
//! and the memory confirmation endpoint.
//!
//! Architecture: each endpoint has a thin axum handler that delegates to
//! a pure inner function. The inner functions are directly testable
//! without axum dispatch machinery.
//!
//! Endpoints:
//! - GET    /health    — health check with backend info
//! - GET    /version   — server version info
//! - POST   /ask       — question through the full pipeline
//! - POST   /documents — ingest one profile document
//! - DELETE /documents — delete an owner's records
//! - POST   /memories  — persist a caller-confirmed memory

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use persona_core::models::MemoryCategory;
use persona_core::PersonaError;
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tokio::sync::broadcast;

use crate::state::AppState;
use crate::subsystems::ask::{ask, AskRequest};
use crate::subsystems::ingest::{delete_owner_data, ingest_document};
use crate::subsystems::memory::{store_memory, NewMemory};

/// Build the Axum router with all endpoints
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/version", get(version_handler))
        .route("/ask", post(ask_handler))
        .route("/documents", post(documents_handler).delete(delete_documents_handler))
        .route("/memories", post(memories_handler))
        .with_state(state)
}

/// Start the HTTP server on the configured address.
/// Gracefully shuts down when the broadcast shutdown signal fires.
pub async fn start_http_server(
    state: AppState,
    mut shutdown: broadcast::Receiver<()>,
) -> anyhow::Result<()> {
    let addr = format!("{}:{}", state.config.http.host, state.config.http.port);
    let app = build_router(state);
    let listener = TcpListener::bind(&addr).await?;
    tracing::info!("Persona HTTP API listening on http://{}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = shutdown.recv().await;
            tracing::info!("HTTP server shutting down...");
        })
        .await?;

    Ok(())
}

// ============================================================================
// Request / Response DTOs
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct AskHttpRequest {
    pub owner_id: Option<String>,
    pub persona_name: Option<String>,
    pub question: Option<String>,
    pub session_id: Option<String>,
    #[serde(default)]
    pub is_owner: bool,
    pub background: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct DocumentRequest {
    pub owner_id: Option<String>,
    pub text: Option<String>,
    pub source: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct DeleteDocumentsRequest {
    pub owner_id: Option<String>,
    pub source: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct MemoryRequest {
    pub owner_id: Option<String>,
    pub text: Option<String>,
    #[serde(default)]
    pub summary: String,
    pub category: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    pub privacy_level: Option<i32>,
    pub importance: Option<i32>,
}

/// Standard HTTP error response
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub status: String,
}

impl ErrorResponse {
    pub fn new(msg: impl Into<String>) -> Self {
        Self {
            error: msg.into(),
            status: "error".to_string(),
        }
    }
}

fn error_body(msg: impl Into<String>) -> serde_json::Value {
    serde_json::json!(ErrorResponse::new(msg))
}

fn error_status(e: &PersonaError) -> StatusCode {
    match e {
        PersonaError::InvalidInput(_) => StatusCode::BAD_REQUEST,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

// ============================================================================
// Inner (directly testable) business logic functions
// ============================================================================

/// Inner health check — reports backend wiring, no upstream calls.
pub fn health_inner(state: &AppState) -> (StatusCode, serde_json::Value) {
    (
        StatusCode::OK,
        serde_json::json!({
            "status": "healthy",
            "version": env!("CARGO_PKG_VERSION"),
            "store": state.store.name(),
            "embedding": state.embedder.name(),
            "generation": state.generator.name(),
            "credentials": state.keys.key_count(),
        }),
    )
}

/// Inner version — returns version info (pure, no IO).
pub fn version_inner() -> serde_json::Value {
    serde_json::json!({
        "version": env!("CARGO_PKG_VERSION"),
        "protocol": "persona/1",
    })
}

/// Inner ask — validates the request shape, then runs the pipeline.
/// Validation failures return 400 before any downstream call is made.
pub async fn ask_inner(state: &AppState, req: AskHttpRequest) -> (StatusCode, serde_json::Value) {
    let owner_id = match req.owner_id {
        Some(o) if !o.trim().is_empty() => o,
        _ => return (StatusCode::BAD_REQUEST, error_body("owner_id field is required")),
    };
    let question = match req.question {
        Some(q) if !q.trim().is_empty() => q,
        _ => return (StatusCode::BAD_REQUEST, error_body("question field is required")),
    };

    let request = AskRequest {
        persona_name: req.persona_name.unwrap_or_else(|| owner_id.clone()),
        session_id: req.session_id.unwrap_or_else(|| format!("default-{}", owner_id)),
        owner_id,
        question,
        requester_is_owner: req.is_owner,
        background: req.background,
    };

    match ask(state, &request).await {
        Ok(outcome) => {
            let memory_pending = outcome.memory_candidate.is_some();
            (
                StatusCode::OK,
                serde_json::json!({
                    "response": outcome.response_text,
                    "expanded_query": outcome.expanded_query,
                    "complexity": outcome.report,
                    "documents_used": outcome.doc_count_used,
                    "memory_confirmation_needed": memory_pending,
                    "memory_candidate": outcome.memory_candidate,
                    "status": "ok",
                }),
            )
        }
        Err(e) => (error_status(&e), error_body(e.to_string())),
    }
}

/// Inner document ingest.
pub async fn documents_inner(
    state: &AppState,
    req: DocumentRequest,
) -> (StatusCode, serde_json::Value) {
    let owner_id = match req.owner_id {
        Some(o) if !o.trim().is_empty() => o,
        _ => return (StatusCode::BAD_REQUEST, error_body("owner_id field is required")),
    };
    let text = match req.text {
        Some(t) if !t.trim().is_empty() => t,
        _ => return (StatusCode::BAD_REQUEST, error_body("text field is required")),
    };

    match ingest_document(
        &owner_id,
        &text,
        req.source,
        state.store.as_ref(),
        state.embedder.as_ref(),
    )
    .await
    {
        Ok(id) => (
            StatusCode::OK,
            serde_json::json!({ "id": id, "status": "ok" }),
        ),
        Err(e) => (error_status(&e), error_body(e.to_string())),
    }
}

/// Inner owner-data delete.
pub async fn delete_documents_inner(
    state: &AppState,
    req: DeleteDocumentsRequest,
) -> (StatusCode, serde_json::Value) {
    let owner_id = match req.owner_id {
        Some(o) if !o.trim().is_empty() => o,
        _ => return (StatusCode::BAD_REQUEST, error_body("owner_id field is required")),
    };

    match delete_owner_data(&owner_id, req.source.as_deref(), state.store.as_ref()).await {
        Ok(deleted) => (
            StatusCode::OK,
            serde_json::json!({ "deleted": deleted, "status": "ok" }),
        ),
        Err(e) => (error_status(&e), error_body(e.to_string())),
    }
}

/// Inner confirmed-memory store.
pub async fn memories_inner(
    state: &AppState,
    req: MemoryRequest,
) -> (StatusCode, serde_json::Value) {
    let owner_id = match req.owner_id {
        Some(o) if !o.trim().is_empty() => o,
        _ => return (StatusCode::BAD_REQUEST, error_body("owner_id field is required")),
    };
    let text = match req.text {
        Some(t) if !t.trim().is_empty() => t,
        _ => return (StatusCode::BAD_REQUEST, error_body("text field is required")),
    };
    let category = match req.category.as_deref() {
        Some(raw) => match MemoryCategory::parse(raw) {
            Some(c) => Some(c),
            None => {
                return (
                    StatusCode::BAD_REQUEST,
                    error_body(format!("unknown category: {}", raw)),
                )
            }
        },
        None => None,
    };

    let memory = NewMemory {
        owner_id,
        text,
        summary: req.summary,
        category,
        tags: req.tags,
        privacy_level: req.privacy_level,
        importance: req.importance,
    };

    match store_memory(memory, state.store.as_ref(), state.embedder.as_ref()).await {
        Ok(id) => (
            StatusCode::OK,
            serde_json::json!({ "id": id, "status": "ok" }),
        ),
        Err(e) => (error_status(&e), error_body(e.to_string())),
    }
}

// ============================================================================
// Axum handler wrappers (thin — delegate to inner functions)
// ============================================================================

pub async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    let (status, body) = health_inner(&state);
    (status, Json(body))
}

pub async fn version_handler() -> impl IntoResponse {
    (StatusCode::OK, Json(version_inner()))
}

pub async fn ask_handler(
    State(state): State<AppState>,
    Json(req): Json<AskHttpRequest>,
) -> impl IntoResponse {
    let (status, body) = ask_inner(&state, req).await;
    (status, Json(body))
}

pub async fn documents_handler(
    State(state): State<AppState>,
    Json(req): Json<DocumentRequest>,
) -> impl IntoResponse {
    let (status, body) = documents_inner(&state, req).await;
    (status, Json(body))
}

pub async fn delete_documents_handler(
    State(state): State<AppState>,
    Json(req): Json<DeleteDocumentsRequest>,
) -> impl IntoResponse {
    let (status, body) = delete_documents_inner(&state, req).await;
    (status, Json(body))
}

pub async fn memories_handler(
    State(state): State<AppState>,
    Json(req): Json<MemoryRequest>,
) -> impl IntoResponse {
    let (status, body) = memories_inner(&state, req).await;
    (status, Json(body))
}

// ============================================================================
// Unit Tests — inner functions against in-memory backends
// ============================================================================
