//! Conversation state threaded through one pipeline run, and the update
//! operations nodes use to change it.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{
    error::{Error, Result},
    gateway::Intent,
    guard::Verdict,
    retrieval::Snippet,
    turn::{Role, Turn},
};

/// Per-request conversation state.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConversationState {
    /// Ordered turns; only ever appended to, except by compaction
    pub turns: Vec<Turn>,
    /// Stand-alone form of the latest user turn
    pub rewritten_query: Option<String>,
    pub intent: Option<Intent>,
    pub retrieved_context: Vec<Snippet>,
    pub verdict: Option<Verdict>,
    /// Normalized language code of the reply
    pub reply_language: Option<String>,
    /// Caller's raw language hint, consumed by language detection
    pub language_hint: Option<String>,
    pub long_term_summary: Option<String>,
    /// Reply in `reply_language`, set when translation ran
    pub translated_reply: Option<String>,
    next_order: u64,
}

/// Scalar fields a node may replace. `None` means "leave unchanged".
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Fields {
    pub rewritten_query: Option<String>,
    pub intent: Option<Intent>,
    pub retrieved_context: Option<Vec<Snippet>>,
    pub verdict: Option<Verdict>,
    pub reply_language: Option<String>,
    pub long_term_summary: Option<String>,
    pub translated_reply: Option<String>,
}

/// One merge operation on the state
#[derive(Debug, Clone, PartialEq)]
pub enum Update {
    /// Append turns at the end of the list
    Append(Vec<Turn>),
    /// Overwrite the given scalar fields
    ReplaceFields(Fields),
    /// Delete the given turns and append one summary turn, as one step
    Compact { delete: Vec<Uuid>, summary: Turn },
}

/// The partial update a node returns. The engine applies it only after the
/// node completes.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StateUpdate {
    ops: Vec<Update>,
}

impl StateUpdate {
    /// An update that changes nothing
    pub fn none() -> Self {
        Self::default()
    }

    pub fn append(mut self, turn: Turn) -> Self {
        self.ops.push(Update::Append(vec![turn]));
        self
    }

    pub fn replace(mut self, fields: Fields) -> Self {
        self.ops.push(Update::ReplaceFields(fields));
        self
    }

    pub fn compact(mut self, delete: Vec<Uuid>, summary: Turn) -> Self {
        self.ops.push(Update::Compact { delete, summary });
        self
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn ops(&self) -> &[Update] {
        &self.ops
    }

    /// Number of turns this update appends (summary turns included)
    pub fn appended_turns(&self) -> usize {
        self.ops
            .iter()
            .map(|op| match op {
                Update::Append(turns) => turns.len(),
                Update::Compact { .. } => 1,
                Update::ReplaceFields(_) => 0,
            })
            .sum()
    }
}

impl ConversationState {
    /// Build a fresh state by replaying history plus the new user message.
    pub fn new(history: Vec<Turn>, message: &str, language_hint: Option<String>) -> Self {
        let mut state = Self {
            language_hint,
            ..Default::default()
        };
        for turn in history {
            state.push_turn(turn);
        }
        state.push_turn(Turn::user(message));
        state
    }

    fn push_turn(&mut self, mut turn: Turn) {
        turn.order = self.next_order;
        self.next_order += 1;
        self.turns.push(turn);
    }

    /// The latest user turn's text
    pub fn latest_user_message(&self) -> Option<&str> {
        self.turns
            .iter()
            .rev()
            .find(|t| t.role == Role::User)
            .map(|t| t.content.as_str())
    }

    /// The most recent assistant message, i.e. the generated reply
    pub fn last_assistant_message(&self) -> Option<&str> {
        self.turns
            .iter()
            .rev()
            .find(|t| t.role == Role::Assistant)
            .map(|t| t.content.as_str())
    }

    /// Final reply text: the translation if one ran, else the generated reply
    pub fn final_reply(&self) -> Option<&str> {
        self.translated_reply
            .as_deref()
            .or_else(|| self.last_assistant_message())
    }

    /// Current summary turn, if any
    pub fn summary_turn(&self) -> Option<&Turn> {
        self.turns.iter().find(|t| t.is_summary())
    }

    /// Merge an update. Either every operation applies or none does.
    pub fn apply(&mut self, update: StateUpdate) -> Result<()> {
        let mut next = self.clone();
        for op in update.ops {
            next.apply_op(op)?;
        }
        *self = next;
        Ok(())
    }

    fn apply_op(&mut self, op: Update) -> Result<()> {
        match op {
            Update::Append(turns) => {
                for turn in turns {
                    self.push_turn(turn);
                }
            }
            Update::ReplaceFields(fields) => {
                let Fields {
                    rewritten_query,
                    intent,
                    retrieved_context,
                    verdict,
                    reply_language,
                    long_term_summary,
                    translated_reply,
                } = fields;
                if rewritten_query.is_some() {
                    self.rewritten_query = rewritten_query;
                }
                if intent.is_some() {
                    self.intent = intent;
                }
                if let Some(context) = retrieved_context {
                    self.retrieved_context = context;
                }
                if verdict.is_some() {
                    self.verdict = verdict;
                }
                if reply_language.is_some() {
                    self.reply_language = reply_language;
                }
                if long_term_summary.is_some() {
                    self.long_term_summary = long_term_summary;
                }
                if translated_reply.is_some() {
                    self.translated_reply = translated_reply;
                }
            }
            Update::Compact { delete, summary } => {
                let known: HashSet<Uuid> = self.turns.iter().map(|t| t.id).collect();
                if let Some(missing) = delete.iter().find(|id| !known.contains(id)) {
                    return Err(Error::Invariant(format!(
                        "compaction deletes unknown turn {missing}"
                    )));
                }
                if !summary.is_summary() {
                    return Err(Error::Invariant(
                        "compaction summary is not marked as a summary turn".into(),
                    ));
                }
                let delete: HashSet<Uuid> = delete.into_iter().collect();
                self.turns.retain(|t| !delete.contains(&t.id));
                self.long_term_summary = summary.summary_body().map(str::to_string);
                self.push_turn(summary);
            }
        }
        Ok(())
    }
}
