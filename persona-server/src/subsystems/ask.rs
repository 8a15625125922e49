//! The ask pipeline.
//!
//! One consolidated path from question to reply: complexity analysis,
//! query expansion, follow-up broadening, retrieval, prompt assembly,
//! generation through the credential pool, link formatting, and the
//! post-reply memory judgment. There are no per-caller variants; owner
//! and third-party requests differ only in the interaction kind and
//! privacy handling.

use std::sync::OnceLock;

use persona_core::models::{ConversationTurn, MemoryJudgment, Role};
use persona_core::prompt::{InteractionKind, PromptSpec, HISTORY_WINDOW};
use persona_core::PersonaError;
use regex::Regex;

use crate::state::AppState;

use super::analyze::{self, ComplexityReport, Strategy};
use super::expand;
use super::memory;
use super::retrieve::{self, RetrievalRequest};

/// Key terms borrowed from the previous reply when broadening follow-ups.
const FOLLOWUP_TERMS: usize = 3;

#[derive(Debug, Clone)]
pub struct AskRequest {
    pub owner_id: String,
    pub persona_name: String,
    pub question: String,
    pub session_id: String,
    pub requester_is_owner: bool,
    pub background: Option<String>,
}

#[derive(Debug)]
pub struct AskOutcome {
    pub response_text: String,
    pub expanded_query: String,
    pub report: ComplexityReport,
    pub doc_count_used: usize,
    /// Set when the reply surfaced a vital new fact awaiting the
    /// caller's explicit confirmation before persistence.
    pub memory_candidate: Option<MemoryJudgment>,
}

pub async fn ask(state: &AppState, request: &AskRequest) -> Result<AskOutcome, PersonaError> {
    if request.owner_id.trim().is_empty() {
        return Err(PersonaError::InvalidInput("owner_id is required".to_string()));
    }
    if request.question.trim().is_empty() {
        return Err(PersonaError::InvalidInput("question is required".to_string()));
    }

    let history = state.sessions.recent(&request.session_id, HISTORY_WINDOW).await;

    // Analysis and expansion. The model strategy answers both in one
    // call; the heuristic path computes them locally.
    let mut report = analyze::analyze(&request.question, &state.config.analysis);
    let mut expanded = if state.config.analysis.strategy == "model" {
        let (expanded, doc_count) = analyze::analyze_with_model(
            &request.question,
            &history,
            &state.keys,
            state.generator.as_ref(),
        )
        .await;
        report.doc_count = doc_count;
        report.strategy = Strategy::ModelAssisted;
        expanded
    } else {
        expand::expand_heuristic(&request.question, &history)
    };

    // Follow-ups lean on what was just said: borrow the dominant terms
    // of the previous reply so retrieval stays on topic.
    if expand::detect_followup(&request.question) {
        if let Some(last_reply) = history.iter().rev().find(|t| t.role == Role::Assistant) {
            let terms = expand::extract_key_terms(&last_reply.content, FOLLOWUP_TERMS);
            if !terms.is_empty() {
                expanded = format!("{} {}", expanded, terms.join(" "));
            }
        }
    }

    tracing::debug!(
        score = report.score,
        doc_count = report.doc_count,
        expanded = %expanded,
        "Query analyzed"
    );

    let retrieval_request = RetrievalRequest {
        query: &request.question,
        expanded_query: &expanded,
        owner_id: &request.owner_id,
        requester_is_owner: request.requester_is_owner,
        report: &report,
    };

    let outcome = retrieve::retrieve_context(
        &retrieval_request,
        state.store.as_ref(),
        state.embedder.as_ref(),
        &state.keys,
        state.generator.as_ref(),
        &state.config.retrieval,
        &state.config.memory,
    )
    .await;

    let interaction = if request.requester_is_owner {
        InteractionKind::OwnerReflection
    } else {
        InteractionKind::ThirdParty
    };

    let prompt = PromptSpec::new(&request.persona_name, &request.question)?
        .background(request.background.clone().unwrap_or_default())
        .context(&outcome.context)
        .history(&history)
        .interaction(interaction)
        .render();

    let messages: Vec<ConversationTurn> = history
        .iter()
        .cloned()
        .chain(std::iter::once(ConversationTurn::user(prompt)))
        .collect();

    let messages = &messages;
    let reply = state
        .keys
        .with_rotation(|key| async move {
            state.generator.generate(&key, messages).await
        })
        .await?;

    let response_text = format_links(&reply);

    // Post-reply judgment: does the question itself carry a vital fact
    // the profile does not already cover?
    let memory_candidate = if state.config.memory.enabled {
        let judgment = memory::judge_memory(
            &request.question,
            &outcome.context,
            &state.keys,
            state.generator.as_ref(),
        )
        .await;
        judgment.needs_confirmation().then_some(judgment)
    } else {
        None
    };

    state
        .sessions
        .append(&request.session_id, ConversationTurn::user(&request.question))
        .await;
    state
        .sessions
        .append(&request.session_id, ConversationTurn::assistant(&response_text))
        .await;

    Ok(AskOutcome {
        response_text,
        expanded_query: expanded,
        doc_count_used: outcome.doc_count_used,
        report,
        memory_candidate,
    })
}

/// Rewrite bare URLs as HTML anchors opening in a new tab. Text without
/// URLs passes through untouched.
pub fn format_links(text: &str) -> String {
    static URL: OnceLock<Regex> = OnceLock::new();
    let url = URL.get_or_init(|| Regex::new(r#"https?://[^\s<>()"]+"#).expect("url pattern"));
    url.replace_all(text, |caps: &regex::Captures<'_>| {
        let link = &caps[0];
        format!("<a href=\"{link}\" target=\"_blank\">{link}</a>")
    })
    .into_owned()
}

// ============================================================================
// TESTS
// ============================================================================
