//! Model registry: maps (provider, tier) to a concrete model id.
//!
//! Changing the model behind a tier for the whole application is a one-line
//! edit here, or a per-tier override in the server configuration.

use crate::{Model, ModelTier, Provider};
use std::collections::HashMap;

/// Registry entries. Providers without entries (Ollama, Custom) must be
/// configured with explicit overrides.
const MODEL_ENTRIES: &[(Provider, ModelTier, &str)] = &[
    (Provider::OpenAI, ModelTier::Fast, "gpt-4.1-nano"),
    (Provider::OpenAI, ModelTier::Medium, "gpt-4.1-mini"),
    (Provider::OpenAI, ModelTier::Strong, "gpt-5-nano"),
    (Provider::Groq, ModelTier::Fast, "llama-3.1-8b-instant"),
    (Provider::Groq, ModelTier::Medium, "llama-3.1-70b-versatile"),
    (Provider::Groq, ModelTier::Strong, "llama-3.3-70b-versatile"),
    (Provider::Google, ModelTier::Fast, "gemini-1.5-flash"),
    (Provider::Google, ModelTier::Medium, "gemini-1.5-pro"),
    (Provider::Google, ModelTier::Strong, "gemini-1.5-pro"),
];

/// Default output budget for every tier
const DEFAULT_MAX_TOKENS: u32 = 4096;

/// Look up the registry model id for a provider and tier.
pub fn model_id(provider: Provider, tier: ModelTier) -> Option<&'static str> {
    MODEL_ENTRIES
        .iter()
        .find(|(p, t, _)| *p == provider && *t == tier)
        .map(|(_, _, id)| *id)
}

/// Resolves tiers to fully specified models for one provider.
#[derive(Debug, Clone)]
pub struct ModelRegistry {
    provider: Provider,
    base_url: String,
    overrides: HashMap<ModelTier, String>,
}

impl ModelRegistry {
    /// Create a registry for a provider using its default base URL
    pub fn new(provider: Provider) -> Self {
        Self {
            provider,
            base_url: provider.default_base_url().to_string(),
            overrides: HashMap::new(),
        }
    }

    /// Point the registry at a different OpenAI-compatible endpoint
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    /// Force a specific model id for a tier
    pub fn with_override(mut self, tier: ModelTier, model_id: impl Into<String>) -> Self {
        self.overrides.insert(tier, model_id.into());
        self
    }

    pub fn provider(&self) -> Provider {
        self.provider
    }

    /// Resolve a tier. Overrides win over the built-in table.
    pub fn resolve(&self, tier: ModelTier) -> Option<Model> {
        let id = match self.overrides.get(&tier) {
            Some(id) => id.clone(),
            None => model_id(self.provider, tier)?.to_string(),
        };
        Some(Model {
            id,
            provider: self.provider,
            base_url: self.base_url.clone(),
            max_tokens: DEFAULT_MAX_TOKENS,
            headers: Default::default(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_every_hosted_provider_has_all_tiers() {
        for provider in [Provider::OpenAI, Provider::Groq, Provider::Google] {
            for tier in [ModelTier::Fast, ModelTier::Medium, ModelTier::Strong] {
                assert!(model_id(provider, tier).is_some(), "{provider:?} {tier:?}");
            }
        }
    }

    #[test]
    fn test_override_wins() {
        let registry =
            ModelRegistry::new(Provider::OpenAI).with_override(ModelTier::Fast, "gpt-4o-mini");
        assert_eq!(registry.resolve(ModelTier::Fast).unwrap().id, "gpt-4o-mini");
        assert_eq!(registry.resolve(ModelTier::Medium).unwrap().id, "gpt-4.1-mini");
    }

    #[test]
    fn test_ollama_requires_override() {
        let registry = ModelRegistry::new(Provider::Ollama);
        assert!(registry.resolve(ModelTier::Fast).is_none());
        let registry = registry.with_override(ModelTier::Fast, "llama3.2");
        let model = registry.resolve(ModelTier::Fast).unwrap();
        assert_eq!(model.base_url, "http://localhost:11434/v1");
    }
}
