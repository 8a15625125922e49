//! Domain types shared between the core library and the serving pipeline.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Speaker role in a conversation turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::System => "system",
        }
    }
}

/// One message in a session. Only a bounded trailing window is ever
/// used for prompting; full history persistence is the caller's concern.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationTurn {
    pub role: Role,
    pub content: String,
}

impl ConversationTurn {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

/// Fixed taxonomy for memory records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MemoryCategory {
    Contact,
    Preference,
    Personal,
    Credentials,
    Financial,
    Work,
    Education,
    Health,
    Technical,
    General,
}

impl MemoryCategory {
    pub const ALL: [MemoryCategory; 10] = [
        MemoryCategory::Contact,
        MemoryCategory::Preference,
        MemoryCategory::Personal,
        MemoryCategory::Credentials,
        MemoryCategory::Financial,
        MemoryCategory::Work,
        MemoryCategory::Education,
        MemoryCategory::Health,
        MemoryCategory::Technical,
        MemoryCategory::General,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            MemoryCategory::Contact => "contact",
            MemoryCategory::Preference => "preference",
            MemoryCategory::Personal => "personal",
            MemoryCategory::Credentials => "credentials",
            MemoryCategory::Financial => "financial",
            MemoryCategory::Work => "work",
            MemoryCategory::Education => "education",
            MemoryCategory::Health => "health",
            MemoryCategory::Technical => "technical",
            MemoryCategory::General => "general",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL
            .iter()
            .copied()
            .find(|c| c.as_str() == s.to_lowercase())
    }
}

/// Kind tag on a stored record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordKind {
    Document,
    Memory,
}

impl RecordKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordKind::Document => "document",
            RecordKind::Memory => "memory",
        }
    }
}

/// Memory-specific attributes on a stored record.
///
/// Records are never mutated; superseding information is written as a
/// newer record and consumers prefer the most recent on conflict.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryAttrs {
    pub summary: String,
    pub category: MemoryCategory,
    pub tags: Vec<String>,
    /// 1..=10
    pub importance: i32,
    /// 0 = shareable with any requester, 1 = owner-only
    pub privacy_level: i32,
}

/// Ephemeral per-query candidate produced by retrieval and re-ranking.
#[derive(Debug, Clone)]
pub struct RetrievalCandidate {
    pub id: String,
    pub text: String,
    /// Raw vector similarity as returned by the store
    pub base_score: f32,
    /// Composite score after re-ranking
    pub final_score: f32,
    pub origin: CandidateOrigin,
    pub memory: Option<MemoryAttrs>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CandidateOrigin {
    Document,
    Memory,
}

/// Structured judgment parsed from the generative model after a reply:
/// does the user's message contain vital information worth remembering,
/// and is it already present in the retrieved context?
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryJudgment {
    #[serde(default)]
    pub is_vital: bool,
    /// 0–100: how much of the fact the context already covered
    #[serde(default)]
    pub present_in_context: i32,
    #[serde(default)]
    pub summary: String,
    #[serde(default)]
    pub extracted_info: String,
    #[serde(default)]
    pub category: String,
    #[serde(default = "default_importance")]
    pub importance: i32,
}

fn default_importance() -> i32 {
    5
}

impl Default for MemoryJudgment {
    fn default() -> Self {
        Self {
            is_vital: false,
            present_in_context: 100,
            summary: String::new(),
            extracted_info: String::new(),
            category: "general".to_string(),
            importance: 5,
        }
    }
}

impl MemoryJudgment {
    /// A memory is proposed for persistence only when the model flagged
    /// it as vital AND it is materially new relative to the context.
    pub fn needs_confirmation(&self) -> bool {
        self.is_vital && self.present_in_context < 50
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn category_round_trips_through_strings() {
        for c in MemoryCategory::ALL {
            assert_eq!(MemoryCategory::parse(c.as_str()), Some(c));
        }
        assert_eq!(MemoryCategory::parse("FINANCIAL"), Some(MemoryCategory::Financial));
        assert_eq!(MemoryCategory::parse("unknown"), None);
    }

    #[test]
    fn judgment_confirmation_gate() {
        let mut j = MemoryJudgment {
            is_vital: true,
            present_in_context: 10,
            ..Default::default()
        };
        assert!(j.needs_confirmation());

        j.present_in_context = 50;
        assert!(!j.needs_confirmation(), "already-known facts are not proposed");

        j.present_in_context = 10;
        j.is_vital = false;
        assert!(!j.needs_confirmation());
    }
}
