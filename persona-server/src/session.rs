//! Session history storage behind a trait seam.
//!
//! The pipeline only ever reads a bounded trailing window, so the trait
//! exposes append and recent-n. The in-memory implementation is the
//! default; a persistent backend can slot in without touching callers.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use persona_core::models::ConversationTurn;

/// Cap on turns retained per session. Old turns roll off the front.
const SESSION_RETENTION: usize = 50;

#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn append(&self, session_id: &str, turn: ConversationTurn);

    /// The last `n` turns for a session, oldest first.
    async fn recent(&self, session_id: &str, n: usize) -> Vec<ConversationTurn>;
}

#[derive(Default)]
pub struct InMemorySessionStore {
    sessions: Mutex<HashMap<String, Vec<ConversationTurn>>>,
}

impl InMemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SessionStore for InMemorySessionStore {
    async fn append(&self, session_id: &str, turn: ConversationTurn) {
        let mut sessions = self.sessions.lock().expect("session mutex poisoned");
        let turns = sessions.entry(session_id.to_string()).or_default();
        turns.push(turn);
        if turns.len() > SESSION_RETENTION {
            let excess = turns.len() - SESSION_RETENTION;
            turns.drain(..excess);
        }
    }

    async fn recent(&self, session_id: &str, n: usize) -> Vec<ConversationTurn> {
        let sessions = self.sessions.lock().expect("session mutex poisoned");
        match sessions.get(session_id) {
            Some(turns) => {
                let start = turns.len().saturating_sub(n);
                turns[start..].to_vec()
            }
            None => Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn recent_returns_trailing_window_oldest_first() {
        let store = InMemorySessionStore::new();
        for i in 0..8 {
            store.append("s1", ConversationTurn::user(format!("turn {}", i))).await;
        }

        let recent = store.recent("s1", 3).await;
        assert_eq!(recent.len(), 3);
        assert_eq!(recent[0].content, "turn 5");
        assert_eq!(recent[2].content, "turn 7");
    }

    #[tokio::test]
    async fn sessions_are_isolated() {
        let store = InMemorySessionStore::new();
        store.append("s1", ConversationTurn::user("hello")).await;

        assert!(store.recent("s2", 10).await.is_empty());
        assert_eq!(store.recent("s1", 10).await.len(), 1);
    }

    #[tokio::test]
    async fn retention_caps_stored_turns() {
        let store = InMemorySessionStore::new();
        for i in 0..60 {
            store.append("s1", ConversationTurn::user(format!("turn {}", i))).await;
        }

        let all = store.recent("s1", 100).await;
        assert_eq!(all.len(), SESSION_RETENTION);
        assert_eq!(all[0].content, "turn 10", "oldest turns rolled off");
    }
}
