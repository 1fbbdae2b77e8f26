//! Gateway: intent classification and follow-up rewriting in one pass.
//!
//! Short social messages are caught by a deterministic pre-filter and never
//! reach the model. Everything else gets a single structured judgment that
//! both classifies and, when exactly one referent is clear, rewrites the
//! latest message into a stand-alone query.

use std::sync::LazyLock;

use muse_ai::ModelTier;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::{
    conversation::{ConversationState, Fields, StateUpdate},
    error::{Error, Result},
    judgment::{self, JudgmentClient, JudgmentRequest},
    turn::{Role, Turn, transcript},
};

/// Routing intent of the latest user turn
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Intent {
    Technical,
    Casual,
}

impl Intent {
    /// Anything other than an explicit "casual" is technical
    pub fn parse(s: &str) -> Self {
        match s.trim().to_lowercase().as_str() {
            "casual" => Intent::Casual,
            _ => Intent::Technical,
        }
    }
}

/// Gateway tuning
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Model labels below this confidence are overridden to technical
    pub confidence_floor: f64,
    /// Messages with at most this many words are eligible for the pre-filter
    pub short_message_words: usize,
    /// Prior turns shown to the model
    pub history_turns: usize,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            confidence_floor: 0.4,
            short_message_words: 10,
            history_turns: 8,
        }
    }
}

/// Pure greetings, thanks, acknowledgements and reactions
static CASUAL_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        r"^(oi|ol[áa]|eai|opa|alo|hello|hi)\W*$",
        r"^(valeu|obrigad[oa]|thanks|thx)\W*$",
        r"^(ok|blz|beleza|show|top|massa|brabo|legal)\W*$",
        r"^(tchau|flw|fui|até mais)\W*$",
        r"^(k){3,}.*",
        r"^(haha|hehe).*",
    ]
    .iter()
    .filter_map(|p| Regex::new(p).ok())
    .collect()
});

/// Deterministic casual check for short messages
pub fn is_social_noise(message: &str, max_words: usize) -> bool {
    let clean = message.trim().to_lowercase();
    if clean.split_whitespace().count() > max_words {
        return false;
    }
    CASUAL_PATTERNS.iter().any(|re| re.is_match(&clean))
}

/// The gateway's decision
#[derive(Debug, Clone, PartialEq)]
pub struct GatewayDecision {
    pub intent: Intent,
    pub rewritten_query: String,
    pub confidence: f64,
    pub reason: String,
}

impl GatewayDecision {
    /// Safe default: technical, original text
    pub fn fail_closed(original: &str) -> Self {
        Self {
            intent: Intent::Technical,
            rewritten_query: original.to_string(),
            confidence: 0.0,
            reason: "fail_closed".into(),
        }
    }

    fn into_update(self) -> StateUpdate {
        StateUpdate::none().replace(Fields {
            intent: Some(self.intent),
            rewritten_query: Some(self.rewritten_query),
            ..Default::default()
        })
    }
}

static DECISION_SCHEMA: LazyLock<Option<jsonschema::Validator>> = LazyLock::new(|| {
    judgment::compile_schema(&json!({
        "type": "object",
        "required": ["rewritten_query", "classification"],
        "properties": {
            "rewritten_query": { "type": "string" },
            "classification": { "type": "string" },
            "confidence": { "type": "number" },
            "reason": { "type": "string" }
        }
    }))
});

const GATEWAY_SYSTEM_PROMPT: &str = "\
You are the semantic gateway of {persona}'s portfolio assistant. Today is {date}.

You perform TWO tasks on the user's latest message:
1. CLASSIFY its intent (technical vs casual).
2. REWRITE it into a stand-alone question when, and only when, that is safe.

# INTENT
[technical] is the default. It covers questions about {persona}, their skills, \
projects, stack and career, their personal tastes (movies, games, music, \
hobbies), hybrid messages (\"hi, do you play chess?\") and anything that needs \
{persona}'s memory.
[casual] is ONLY pure social noise: empty greetings, simple thanks, short \
reactions, or questions about the chatbot itself.
If you are unsure, answer technical. \"Do you like X?\" is technical.

# REWRITE
Rewrite only if ALL of these hold:
- Exactly ONE possible referent exists in the last 2 turns.
- That referent was named explicitly (a name or noun, not only a pronoun).
- The latest message connects to it with no other reading.
Then replace the pronoun or reference with the explicit name.
If the message is already clear and self-contained, return it UNCHANGED.
Never rewrite just to improve wording. Never answer the question. Never \
introduce people, projects or facts absent from the history. If in doubt, \
return the original message.

# OUTPUT
Reply with ONLY a JSON object:
{\"rewritten_query\": string, \"classification\": \"technical\" | \"casual\", \
\"confidence\": number between 0 and 1, \"reason\": short string}";

fn build_prompt(turns: &[Turn], config: &GatewayConfig) -> String {
    let history: Vec<Turn> = turns
        .iter()
        .filter(|t| !t.is_summary() && t.role != Role::System)
        .cloned()
        .collect();
    let start = history.len().saturating_sub(config.history_turns + 1);
    let window = &history[start..];
    let previous = window
        .len()
        .checked_sub(2)
        .map(|i| window[i].role.label())
        .unwrap_or("none");
    format!(
        "History:\n{}\n\nExtra context: the previous message was from: {previous}",
        transcript(window)
    )
}

/// Classify and rewrite the latest user message.
///
/// Errors are returned to the caller, whose fail-closed path is
/// [`GatewayDecision::fail_closed`].
pub async fn decide(
    state: &ConversationState,
    persona: &str,
    config: &GatewayConfig,
    judgment: &dyn JudgmentClient,
) -> Result<GatewayDecision> {
    let original = state
        .latest_user_message()
        .ok_or_else(|| Error::Invariant("gateway ran without a user turn".into()))?;

    if is_social_noise(original, config.short_message_words) {
        tracing::info!(method = "pattern", intent = "casual", "gateway decision");
        return Ok(GatewayDecision {
            intent: Intent::Casual,
            rewritten_query: original.to_string(),
            confidence: 1.0,
            reason: "social pattern".into(),
        });
    }

    let system = GATEWAY_SYSTEM_PROMPT
        .replace("{persona}", persona)
        .replace("{date}", &chrono::Local::now().format("%Y-%m-%d").to_string());
    let request = JudgmentRequest::new(ModelTier::Fast, system, build_prompt(&state.turns, config));
    let value = judgment.complete_json(request).await?;
    judgment::validate(DECISION_SCHEMA.as_ref(), &value)?;

    let decision = interpret(&value, original, config);
    tracing::info!(
        method = "model",
        intent = ?decision.intent,
        confidence = decision.confidence,
        rewritten = decision.rewritten_query != original,
        reason = %decision.reason,
        "gateway decision"
    );
    Ok(decision)
}

fn interpret(value: &Value, original: &str, config: &GatewayConfig) -> GatewayDecision {
    let rewritten = value["rewritten_query"]
        .as_str()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .unwrap_or(original);
    let confidence = value["confidence"].as_f64().unwrap_or(0.0).clamp(0.0, 1.0);
    let mut intent = Intent::parse(value["classification"].as_str().unwrap_or_default());
    if confidence < config.confidence_floor && intent != Intent::Technical {
        tracing::warn!(confidence, "low gateway confidence, forcing technical");
        intent = Intent::Technical;
    }
    GatewayDecision {
        intent,
        rewritten_query: rewritten.to_string(),
        confidence,
        reason: value["reason"].as_str().unwrap_or_default().to_string(),
    }
}

/// Gateway node
pub async fn gateway(
    state: &ConversationState,
    persona: &str,
    config: &GatewayConfig,
    judgment: &dyn JudgmentClient,
) -> Result<StateUpdate> {
    Ok(decide(state, persona, config, judgment).await?.into_update())
}

/// Update applied when the gateway fails
pub fn fail_closed(state: &ConversationState) -> StateUpdate {
    GatewayDecision::fail_closed(state.latest_user_message().unwrap_or_default()).into_update()
}
