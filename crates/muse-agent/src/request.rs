//! Inbound chat request and its normalization into conversation state

use serde::{Deserialize, Serialize};

use crate::{
    conversation::ConversationState,
    turn::{Role, SUMMARY_MARKER, Turn},
};

/// One prior message as sent by the caller
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub role: String,
    pub content: String,
}

/// A chat request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatRequest {
    pub message: String,
    #[serde(default)]
    pub history: Vec<HistoryEntry>,
    #[serde(default, alias = "language")]
    pub language_hint: Option<String>,
}

impl ChatRequest {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            history: Vec::new(),
            language_hint: None,
        }
    }

    /// Normalize history into turns. Unknown roles and empty messages are
    /// dropped. A system entry carrying the memory marker is restored as the
    /// summary turn; other system entries are dropped.
    pub fn history_turns(&self) -> Vec<Turn> {
        self.history
            .iter()
            .filter_map(|entry| {
                let content = entry.content.trim();
                if content.is_empty() {
                    return None;
                }
                match Role::parse(&entry.role) {
                    Some(Role::User) => Some(Turn::user(content)),
                    Some(Role::Assistant) => Some(Turn::assistant(content)),
                    Some(Role::System) if content.starts_with(SUMMARY_MARKER) => {
                        Some(Turn::restored_summary(content))
                    }
                    _ => {
                        tracing::debug!(role = %entry.role, "dropping history entry");
                        None
                    }
                }
            })
            .collect()
    }

    pub fn into_state(self) -> ConversationState {
        let history = self.history_turns();
        ConversationState::new(history, &self.message, self.language_hint)
    }
}
