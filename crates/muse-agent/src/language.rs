//! Reply language detection and translation

use muse_ai::ModelTier;

use crate::{
    conversation::{ConversationState, Fields, StateUpdate},
    error::{Error, Result},
    judgment::{JudgmentClient, JudgmentRequest},
};

/// Canonical code, display name, accepted spellings
const LANGUAGES: &[(&str, &str, &[&str])] = &[
    (
        "pt-br",
        "Brazilian Portuguese",
        &["pt-br", "pt", "pt-pt", "portuguese", "português", "portugues", "brazilian portuguese"],
    ),
    ("en", "English", &["en", "en-us", "en-gb", "english", "inglês", "ingles"]),
    ("es", "Spanish", &["es", "es-es", "es-mx", "spanish", "español", "espanol", "espanhol"]),
    ("fr", "French", &["fr", "fr-fr", "french", "français", "francais", "francês"]),
    ("de", "German", &["de", "de-de", "german", "deutsch", "alemão"]),
    ("it", "Italian", &["it", "it-it", "italian", "italiano"]),
];

/// Map any recognized spelling of a locale to its canonical code. Unknown
/// values fall back to their primary subtag family when it is known, and are
/// otherwise returned lowercased.
pub fn normalize_language(raw: &str) -> String {
    let clean = raw.trim().to_lowercase().replace('_', "-");
    let lookup = |candidate: &str| {
        LANGUAGES
            .iter()
            .find(|(_, _, aliases)| aliases.contains(&candidate))
            .map(|(code, _, _)| code.to_string())
    };
    if let Some(code) = lookup(&clean) {
        return code;
    }
    if let Some((primary, _)) = clean.split_once('-') {
        if let Some(code) = lookup(primary) {
            return code;
        }
    }
    clean
}

/// Whether two language spellings name the same locale
pub fn same_language(a: &str, b: &str) -> bool {
    normalize_language(a) == normalize_language(b)
}

/// Human-readable name for prompts
pub fn display_name(language: &str) -> String {
    let code = normalize_language(language);
    LANGUAGES
        .iter()
        .find(|(c, _, _)| *c == code)
        .map(|(_, name, _)| name.to_string())
        .unwrap_or(code)
}

/// Language detection node: the caller's hint, or the native language
pub fn detect_language(state: &ConversationState, native: &str) -> Result<StateUpdate> {
    let language = match state.language_hint.as_deref().map(str::trim) {
        Some(hint) if !hint.is_empty() => normalize_language(hint),
        _ => normalize_language(native),
    };
    tracing::debug!(%language, "reply language");
    Ok(StateUpdate::none().replace(Fields {
        reply_language: Some(language),
        ..Default::default()
    }))
}

const TRANSLATOR_SYSTEM_PROMPT: &str = "\
You are an expert translator and content localizer ({source} -> {target}). \
Translate the assistant's reply while KEEPING ITS PERSONA.

Rules:
1. Persona and tone: the speaker is young, a developer, informal and direct. \
Keep that tone. Do not translate slang literally; use the cultural \
equivalent in {target}.
2. Movies, series and games: use the official title in {target} when one \
exists and is common. Keep universal names unchanged.
3. Technical terms stay in English (deploy, frontend, code).
4. Do not explain. Output only the final translation, with no preamble.";

/// Translate `text` into `target`. Returns the input untouched, with no
/// model call, when `target` is the native language.
pub async fn translate(
    text: &str,
    target: &str,
    native: &str,
    judgment: &dyn JudgmentClient,
) -> Result<String> {
    if same_language(target, native) {
        return Ok(text.to_string());
    }

    let system = TRANSLATOR_SYSTEM_PROMPT
        .replace("{source}", &display_name(native))
        .replace("{target}", &display_name(target));
    let request = JudgmentRequest::new(ModelTier::Strong, system, text).with_temperature(0.5);
    let translated = judgment.complete(request).await?;
    let translated = translated.trim();
    if translated.is_empty() {
        return Err(Error::Judgment("translation returned empty text".into()));
    }
    tracing::info!(target = %normalize_language(target), "translated reply");
    Ok(translated.to_string())
}

/// Translation node
pub async fn translate_reply(
    state: &ConversationState,
    native: &str,
    judgment: &dyn JudgmentClient,
) -> Result<StateUpdate> {
    let reply = state
        .last_assistant_message()
        .ok_or_else(|| Error::Invariant("translate ran before any reply".into()))?;
    let target = state.reply_language.as_deref().unwrap_or(native);
    let translated = translate(reply, target, native, judgment).await?;
    Ok(StateUpdate::none().replace(Fields {
        translated_reply: Some(translated),
        ..Default::default()
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{judgment::mock::ScriptedJudgment, turn::Turn};

    #[test]
    fn test_portuguese_aliases_normalize() {
        for alias in ["pt-br", "PT_BR", "pt", "portuguese", "Português", "pt-PT"] {
            assert_eq!(normalize_language(alias), "pt-br", "{alias}");
        }
    }

    #[test]
    fn test_regional_variants_fall_back_to_family() {
        assert_eq!(normalize_language("en-AU"), "en");
        assert_eq!(normalize_language("klingon"), "klingon");
        assert_eq!(display_name("english"), "English");
        assert_eq!(display_name("xx"), "xx");
    }

    #[test]
    fn test_detect_prefers_hint() {
        let mut state = ConversationState::new(vec![], "hello", Some("English".into()));
        state.apply(detect_language(&state, "pt-br").unwrap()).unwrap();
        assert_eq!(state.reply_language.as_deref(), Some("en"));

        let mut state = ConversationState::new(vec![], "oi", Some("  ".into()));
        state.apply(detect_language(&state, "pt-br").unwrap()).unwrap();
        assert_eq!(state.reply_language.as_deref(), Some("pt-br"));
    }

    #[tokio::test]
    async fn test_native_target_is_noop() {
        let judgment = ScriptedJudgment::new();
        for target in ["pt-br", "pt", "portuguese", "português"] {
            let out = translate("Putz, massa demais!", target, "pt-br", &judgment).await.unwrap();
            assert_eq!(out, "Putz, massa demais!");
        }
        assert_eq!(judgment.call_count(), 0);
    }

    #[tokio::test]
    async fn test_foreign_target_calls_strong_tier() {
        let judgment = ScriptedJudgment::new().reply("  Damn, that's awesome!  ");
        let out = translate("Putz, massa demais!", "en", "pt-br", &judgment).await.unwrap();
        assert_eq!(out, "Damn, that's awesome!");

        let calls = judgment.calls.lock();
        assert_eq!(calls[0].tier, ModelTier::Strong);
        assert!(calls[0].system.contains("Brazilian Portuguese -> English"));
        assert_eq!(calls[0].user, "Putz, massa demais!");
    }

    #[tokio::test]
    async fn test_translate_node_sets_translated_reply() {
        let judgment = ScriptedJudgment::new().reply("Hey, all good?");
        let mut state = ConversationState::new(vec![], "hi", Some("en".into()));
        state.reply_language = Some("en".into());
        state
            .apply(StateUpdate::none().append(Turn::assistant("Opa, tudo bem?")))
            .unwrap();
        let turns_before = state.turns.len();

        let update = translate_reply(&state, "pt-br", &judgment).await.unwrap();
        state.apply(update).unwrap();
        assert_eq!(state.final_reply(), Some("Hey, all good?"));
        assert_eq!(state.turns.len(), turns_before);
    }

    #[tokio::test]
    async fn test_translate_node_requires_reply() {
        let judgment = ScriptedJudgment::new();
        let state = ConversationState::new(vec![], "hi", None);
        let result = translate_reply(&state, "pt-br", &judgment).await;
        assert!(matches!(result, Err(Error::Invariant(_))));
    }
}
