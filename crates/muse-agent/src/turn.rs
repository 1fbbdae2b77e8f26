//! Conversation turns

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Header that marks a compacted memory turn. Matching is structural
/// (via [`TurnKind::Summary`]); the header only lets a summary survive a
/// round-trip through caller-supplied history.
pub const SUMMARY_MARKER: &str = "[LONG-TERM MEMORY]";

/// Caveat placed between the marker and the summary body
const SUMMARY_CAVEAT: &str = "\
SYSTEM WARNING: This is compressed context.
- Check [USER PROFILE] for user facts.
- Check [ACTIVE TECHNICAL CONTEXT] for ongoing topics.
- If recent messages contradict this, TRUST THE RECENT MESSAGES.";

/// Who authored a turn
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
}

impl Role {
    /// Parse a caller-supplied role. Unknown roles yield `None`.
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "user" | "human" => Some(Role::User),
            "assistant" | "ai" => Some(Role::Assistant),
            "system" => Some(Role::System),
            _ => None,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::System => "system",
        }
    }
}

/// Structural kind of a turn
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnKind {
    /// A conversational message
    Message,
    /// A synthetic compacted-memory turn
    Summary,
}

/// One message in the conversation. Immutable once created; only
/// compaction removes turns.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Turn {
    pub id: Uuid,
    pub role: Role,
    pub kind: TurnKind,
    pub content: String,
    /// Creation order, stamped when the turn enters a conversation
    pub order: u64,
}

impl Turn {
    fn new(role: Role, kind: TurnKind, content: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            role,
            kind,
            content: content.into(),
            order: 0,
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, TurnKind::Message, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, TurnKind::Message, content)
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, TurnKind::Message, content)
    }

    /// A compacted memory turn. The body is wrapped with the marker header
    /// and a caveat telling generation to prefer recent messages.
    pub fn summary(body: &str) -> Self {
        let content = format!("{SUMMARY_MARKER}\n{SUMMARY_CAVEAT}\n\n{}", body.trim());
        Self::new(Role::System, TurnKind::Summary, content)
    }

    /// Rebuild a summary turn echoed back by the caller
    pub fn restored_summary(content: impl Into<String>) -> Self {
        Self::new(Role::System, TurnKind::Summary, content)
    }

    pub fn is_summary(&self) -> bool {
        self.kind == TurnKind::Summary
    }

    /// Summary text without the wrapper, as fed back into the next compaction
    pub fn summary_body(&self) -> Option<&str> {
        if !self.is_summary() {
            return None;
        }
        let body = self.content.trim_start();
        let body = body.strip_prefix(SUMMARY_MARKER).unwrap_or(body).trim_start();
        let body = body.strip_prefix(SUMMARY_CAVEAT).unwrap_or(body);
        Some(body.trim())
    }
}

/// Render turns as `role: content` lines for prompts
pub fn transcript(turns: &[Turn]) -> String {
    turns
        .iter()
        .map(|t| format!("{}: {}", t.role.label(), t.content))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Content of the assistant turns among the last `window` turns
pub fn recent_assistant_turns(turns: &[Turn], window: usize) -> Vec<&str> {
    let start = turns.len().saturating_sub(window);
    turns[start..]
        .iter()
        .filter(|t| t.role == Role::Assistant && t.kind == TurnKind::Message)
        .map(|t| t.content.as_str())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_role_parse() {
        assert_eq!(Role::parse("User"), Some(Role::User));
        assert_eq!(Role::parse("assistant"), Some(Role::Assistant));
        assert_eq!(Role::parse("tool"), None);
    }

    #[test]
    fn test_summary_turn_is_marked_structurally() {
        let turn = Turn::summary("[USER PROFILE]\n- name: Ana");
        assert!(turn.is_summary());
        assert_eq!(turn.role, Role::System);
        assert!(turn.content.starts_with(SUMMARY_MARKER));
        assert!(turn.content.contains("TRUST THE RECENT MESSAGES"));
    }

    #[test]
    fn test_summary_body_strips_marker_and_caveat() {
        let turn = Turn::summary("  [USER PROFILE]\n- name: Ana\n");
        assert_eq!(turn.summary_body(), Some("[USER PROFILE]\n- name: Ana"));

        let echoed = Turn::restored_summary(turn.content.clone());
        assert_eq!(echoed.summary_body(), Some("[USER PROFILE]\n- name: Ana"));

        let bare = Turn::restored_summary(format!("{SUMMARY_MARKER}\n- likes Rust"));
        assert_eq!(bare.summary_body(), Some("- likes Rust"));
    }

    #[test]
    fn test_system_turn_is_not_a_summary() {
        let turn = Turn::system(format!("{SUMMARY_MARKER} spoofed"));
        assert!(!turn.is_summary());
        assert!(turn.summary_body().is_none());
    }

    #[test]
    fn test_recent_assistant_turns_window() {
        let turns = vec![
            Turn::assistant("old"),
            Turn::user("q1"),
            Turn::assistant("a1"),
            Turn::user("q2"),
        ];
        assert_eq!(recent_assistant_turns(&turns, 3), vec!["a1"]);
        assert_eq!(recent_assistant_turns(&turns, 10), vec!["old", "a1"]);
    }

    #[test]
    fn test_transcript_format() {
        let turns = vec![Turn::user("oi"), Turn::assistant("opa")];
        assert_eq!(transcript(&turns), "user: oi\nassistant: opa");
    }
}
