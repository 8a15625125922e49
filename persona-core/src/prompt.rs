//! Structured prompt assembly.
//!
//! Prompts are built from a typed spec validated at construction: a
//! prompt cannot be rendered without a persona name and a question, and
//! history is always a bounded trailing window.

use crate::models::ConversationTurn;
use crate::PersonaError;

/// Maximum conversation turns carried into the prompt.
pub const HISTORY_WINDOW: usize = 5;

/// Who is talking to the persona.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum InteractionKind {
    /// The owner is reflecting on their own information
    OwnerReflection,
    /// A third party is chatting with the persona
    #[default]
    ThirdParty,
}

#[derive(Debug, Clone)]
pub struct PromptSpec {
    name: String,
    question: String,
    background: String,
    context: String,
    history: Vec<ConversationTurn>,
    interaction: InteractionKind,
}

impl PromptSpec {
    pub fn new(name: impl Into<String>, question: impl Into<String>) -> Result<Self, PersonaError> {
        let name = name.into();
        let question = question.into();

        if name.trim().is_empty() {
            return Err(PersonaError::InvalidInput("persona name is required".to_string()));
        }
        if question.trim().is_empty() {
            return Err(PersonaError::InvalidInput("question is required".to_string()));
        }

        Ok(Self {
            name,
            question,
            background: String::new(),
            context: String::new(),
            history: Vec::new(),
            interaction: InteractionKind::default(),
        })
    }

    pub fn background(mut self, background: impl Into<String>) -> Self {
        self.background = background.into();
        self
    }

    pub fn context(mut self, context: impl Into<String>) -> Self {
        self.context = context.into();
        self
    }

    /// Keeps only the trailing `HISTORY_WINDOW` turns.
    pub fn history(mut self, turns: &[ConversationTurn]) -> Self {
        let start = turns.len().saturating_sub(HISTORY_WINDOW);
        self.history = turns[start..].to_vec();
        self
    }

    pub fn interaction(mut self, kind: InteractionKind) -> Self {
        self.interaction = kind;
        self
    }

    fn interaction_line(&self) -> String {
        match self.interaction {
            InteractionKind::OwnerReflection => format!(
                "The user is {name} reflecting on their own information. Answer their own questions as {name}.",
                name = self.name
            ),
            InteractionKind::ThirdParty => {
                format!("The user is interacting with {}'s model. Respond as {}.", self.name, self.name)
            }
        }
    }

    /// Render the persona prompt.
    pub fn render(&self) -> String {
        let history_text = if self.history.is_empty() {
            "(no prior conversation)".to_string()
        } else {
            self.history
                .iter()
                .map(|t| {
                    let mut role = t.role.as_str().to_string();
                    if let Some(first) = role.get_mut(0..1) {
                        first.make_ascii_uppercase();
                    }
                    format!("{}: {}", role, t.content)
                })
                .collect::<Vec<_>>()
                .join("\n")
        };

        format!(
            "You are {name}, responding as yourself.\n\n\
             ### Interaction Type ###\n\
             {interaction}\n\n\
             ### Profile Information ###\n\
             {context}\n\n\
             ### Conversation History ###\n\
             {history}\n\n\
             ### Instructions ###\n\
             - Introduce yourself as {name} whenever necessary.\n\
             - Respond as a real person, not as an AI.\n\
             - Match the user's tone, phrasing, and vocabulary naturally.\n\
             - If the user specifies a tone, style, or format, strictly follow it.\n\
             - Ensure accuracy and do not assume facts beyond the given data.\n\
             - If relevant information is unavailable, respond naturally without making up details.\n\
             - Use Markdown formatting where appropriate to structure your response.\n\n\
             ### Your Background {name} ###\n\
             {background}\n\n\
             ### User's Question ###\n\
             {question}\n\n\
             ### Your Response ###",
            name = self.name,
            interaction = self.interaction_line(),
            context = self.context,
            history = history_text,
            background = self.background,
            question = self.question,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_name_or_question_is_rejected() {
        assert!(PromptSpec::new("", "where do you work?").is_err());
        assert!(PromptSpec::new("Sahil", "   ").is_err());
        assert!(PromptSpec::new("Sahil", "where do you work?").is_ok());
    }

    #[test]
    fn render_includes_all_sections() {
        let prompt = PromptSpec::new("Sahil", "Where do you work?")
            .unwrap()
            .background("Engineer at Acme")
            .context("Sahil works at Acme as an engineer")
            .render();

        assert!(prompt.contains("You are Sahil, responding as yourself."));
        assert!(prompt.contains("Sahil works at Acme as an engineer"));
        assert!(prompt.contains("Engineer at Acme"));
        assert!(prompt.contains("### User's Question ###\nWhere do you work?"));
    }

    #[test]
    fn history_window_is_bounded() {
        let turns: Vec<ConversationTurn> = (0..10)
            .map(|i| ConversationTurn::user(format!("turn {}", i)))
            .collect();

        let prompt = PromptSpec::new("Sahil", "q")
            .unwrap()
            .history(&turns)
            .render();

        assert!(!prompt.contains("turn 4"), "older turns are dropped");
        assert!(prompt.contains("turn 5"));
        assert!(prompt.contains("turn 9"));
    }

    #[test]
    fn interaction_kind_changes_framing() {
        let owner = PromptSpec::new("Sahil", "q")
            .unwrap()
            .interaction(InteractionKind::OwnerReflection)
            .render();
        let third = PromptSpec::new("Sahil", "q").unwrap().render();

        assert!(owner.contains("reflecting on their own information"));
        assert!(third.contains("interacting with Sahil's model"));
    }
}
