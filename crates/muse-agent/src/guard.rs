//! Answerability guard.
//!
//! Judges whether the retrieved snippets are enough to answer the rewritten
//! query without outside knowledge and without repeating what the assistant
//! already said. Any failure yields a "not answerable" verdict.

use std::sync::LazyLock;

use muse_ai::ModelTier;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::{
    conversation::{ConversationState, Fields, StateUpdate},
    error::Result,
    judgment::{self, JudgmentClient, JudgmentRequest},
    retrieval::Snippet,
    turn::recent_assistant_turns,
};

/// Why the guard decided what it decided
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerdictReason {
    SufficientFactualCoverage,
    MissingSpecificFact,
    ContentExhausted,
    AmbiguousIntent,
    RequiresExternalKnowledge,
    NoContextRetrieved,
    GuardProcessingError,
    LowConfidence,
    Other,
}

impl VerdictReason {
    pub fn parse(s: &str) -> Self {
        match s.trim().to_lowercase().as_str() {
            "sufficient_factual_coverage" => Self::SufficientFactualCoverage,
            "missing_specific_fact" | "missing_fact" => Self::MissingSpecificFact,
            "content_exhausted" => Self::ContentExhausted,
            "ambiguous_intent" => Self::AmbiguousIntent,
            "requires_external_knowledge" => Self::RequiresExternalKnowledge,
            "no_context_retrieved" => Self::NoContextRetrieved,
            "guard_processing_error" => Self::GuardProcessingError,
            "low_confidence" => Self::LowConfidence,
            _ => Self::Other,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SufficientFactualCoverage => "sufficient_factual_coverage",
            Self::MissingSpecificFact => "missing_specific_fact",
            Self::ContentExhausted => "content_exhausted",
            Self::AmbiguousIntent => "ambiguous_intent",
            Self::RequiresExternalKnowledge => "requires_external_knowledge",
            Self::NoContextRetrieved => "no_context_retrieved",
            Self::GuardProcessingError => "guard_processing_error",
            Self::LowConfidence => "low_confidence",
            Self::Other => "other",
        }
    }
}

/// The guard's structured judgment
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Verdict {
    pub answerable: bool,
    pub reason: VerdictReason,
    pub exhausted: bool,
    /// In `[0, 1]`
    pub confidence: f64,
}

impl Verdict {
    pub fn no_context() -> Self {
        Self {
            answerable: false,
            reason: VerdictReason::NoContextRetrieved,
            exhausted: false,
            confidence: 1.0,
        }
    }

    pub fn processing_error() -> Self {
        Self {
            answerable: false,
            reason: VerdictReason::GuardProcessingError,
            exhausted: false,
            confidence: 0.0,
        }
    }
}

/// Guard tuning
#[derive(Debug, Clone)]
pub struct GuardConfig {
    /// Trailing turns scanned for previous assistant answers
    pub recent_window: usize,
    /// "Answerable" verdicts below this confidence are refused
    pub confidence_floor: f64,
}

impl Default for GuardConfig {
    fn default() -> Self {
        Self {
            recent_window: 10,
            confidence_floor: 0.4,
        }
    }
}

const CHUNK_SEPARATOR: &str = "\n\n--- CHUNK SEPARATOR ---\n\n";

static VERDICT_SCHEMA: LazyLock<Option<jsonschema::Validator>> = LazyLock::new(|| {
    judgment::compile_schema(&json!({
        "type": "object",
        "required": ["is_answerable", "reason"],
        "properties": {
            "is_answerable": { "type": "boolean" },
            "reason": { "type": "string" },
            "exhausted": { "type": "boolean" },
            "confidence": { "type": "number" }
        }
    }))
});

const GUARD_SYSTEM_PROMPT: &str = "\
You are the ANSWERABILITY GUARD, a purely logical decision step. You judge \
whether the retrieved context is sufficient AND new enough to answer the \
user's question.

Do NOT answer the question. Do NOT be polite. Output strict JSON only.

Criteria (all must hold for is_answerable = true):
1. FACT PRESENT: the specific fact requested is EXPLICITLY in the context. \
If they ask for a year, there is a year. If they ask who, there is a name. \
Vague or unrelated context means false.
2. NO OUTSIDE KNOWLEDGE: answering must not require inventing anything or \
knowledge beyond the context. Otherwise false.
3. EXHAUSTION: if the user asked for \"another\", \"more\" or \"something \
different\", and the requested topic is already covered in PREVIOUS ANSWERS \
with no new facts in the context, then is_answerable = false and \
exhausted = true.

Output:
{\"is_answerable\": boolean, \"confidence\": number between 0 and 1, \
\"reason\": snake_case string, \"exhausted\": boolean}

Reasons: sufficient_factual_coverage, missing_specific_fact, \
content_exhausted, ambiguous_intent, requires_external_knowledge.";

fn build_prompt(query: &str, context: &[Snippet], previous_answers: &[&str]) -> String {
    let context_text = context
        .iter()
        .map(Snippet::render)
        .collect::<Vec<_>>()
        .join(CHUNK_SEPARATOR);
    let previous = if previous_answers.is_empty() {
        "No previous answers.".to_string()
    } else {
        previous_answers.join("\n---\n")
    };
    format!(
        "### USER INTENT (rewritten):\n{query}\n\n\
         ### RETRIEVED CONTEXT:\n{context_text}\n\n\
         ### PREVIOUS ANSWERS:\n{previous}"
    )
}

fn interpret(value: &Value, config: &GuardConfig) -> Verdict {
    let exhausted = value["exhausted"].as_bool().unwrap_or(false);
    let confidence = value["confidence"].as_f64().unwrap_or(0.0).clamp(0.0, 1.0);
    let mut reason = VerdictReason::parse(value["reason"].as_str().unwrap_or_default());
    let mut answerable = value["is_answerable"].as_bool().unwrap_or(false) && !exhausted;

    if answerable && confidence < config.confidence_floor {
        tracing::warn!(confidence, "guard unsure, refusing");
        answerable = false;
        reason = VerdictReason::LowConfidence;
    }
    if exhausted && reason == VerdictReason::SufficientFactualCoverage {
        reason = VerdictReason::ContentExhausted;
    }

    Verdict {
        answerable,
        reason,
        exhausted,
        confidence,
    }
}

/// Judge answerability. An empty context never reaches the model.
pub async fn evaluate(
    query: &str,
    context: &[Snippet],
    previous_answers: &[&str],
    config: &GuardConfig,
    judgment: &dyn JudgmentClient,
) -> Result<Verdict> {
    if context.is_empty() {
        tracing::warn!("guard received empty context");
        return Ok(Verdict::no_context());
    }

    let request = JudgmentRequest::new(
        ModelTier::Medium,
        GUARD_SYSTEM_PROMPT,
        build_prompt(query, context, previous_answers),
    );
    let value = judgment.complete_json(request).await?;
    judgment::validate(VERDICT_SCHEMA.as_ref(), &value)?;
    Ok(interpret(&value, config))
}

/// Guard node
pub async fn guard(
    state: &ConversationState,
    config: &GuardConfig,
    judgment: &dyn JudgmentClient,
) -> Result<StateUpdate> {
    let query = state
        .rewritten_query
        .as_deref()
        .or_else(|| state.latest_user_message())
        .unwrap_or_default();
    // The current user turn is last, so it never counts as a previous answer
    let previous = recent_assistant_turns(&state.turns, config.recent_window);

    let verdict = evaluate(query, &state.retrieved_context, &previous, config, judgment).await?;
    tracing::info!(
        answerable = verdict.answerable,
        reason = verdict.reason.as_str(),
        exhausted = verdict.exhausted,
        confidence = verdict.confidence,
        "guard verdict"
    );
    Ok(with_verdict(verdict))
}

fn with_verdict(verdict: Verdict) -> StateUpdate {
    StateUpdate::none().replace(Fields {
        verdict: Some(verdict),
        ..Default::default()
    })
}

/// Update applied when the guard fails
pub fn fail_closed() -> StateUpdate {
    with_verdict(Verdict::processing_error())
}
