//! Configuration file support

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use muse_agent::{
    CompactionConfig, EngineConfig, GatewayConfig, GenerationConfig, GuardConfig, Persona,
    RetrievalConfig, RetryConfig, corpus::ChunkConfig,
};
use muse_ai::{ModelTier, Provider, models::ModelRegistry};

/// Configuration for muse
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Language replies are generated in
    pub native_language: String,
    pub llm: LlmConfig,
    pub persona: PersonaConfig,
    pub retrieval: RetrievalSection,
    pub memory: MemoryConfig,
    pub gateway: GatewaySection,
    pub guard: GuardSection,
    pub quota: QuotaConfig,
    pub server: ServerConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            native_language: "pt-br".into(),
            llm: LlmConfig::default(),
            persona: PersonaConfig::default(),
            retrieval: RetrievalSection::default(),
            memory: MemoryConfig::default(),
            gateway: GatewaySection::default(),
            guard: GuardSection::default(),
            quota: QuotaConfig::default(),
            server: ServerConfig::default(),
        }
    }
}

/// Language-model provider settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    /// openai, groq, google, ollama or custom
    pub provider: String,
    /// Overrides the provider's default endpoint
    pub base_url: Option<String>,
    /// API key (alternative to the provider's environment variable)
    pub api_key: Option<String>,
    pub fast_model: Option<String>,
    pub medium_model: Option<String>,
    pub strong_model: Option<String>,
    pub request_timeout_secs: u64,
    pub max_retries: u32,
    /// Bound on one engine node; derived from the retry budget when unset
    pub node_timeout_secs: Option<u64>,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: "openai".into(),
            base_url: None,
            api_key: None,
            fast_model: None,
            medium_model: None,
            strong_model: None,
            request_timeout_secs: 30,
            max_retries: 2,
            node_timeout_secs: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PersonaConfig {
    pub name: String,
    pub profile: String,
}

impl Default for PersonaConfig {
    fn default() -> Self {
        let persona = Persona::default();
        Self {
            name: persona.name,
            profile: persona.profile,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrievalSection {
    /// Directory of markdown documents
    pub corpus_dir: Option<PathBuf>,
    pub k: usize,
    pub timeout_secs: u64,
    pub chunk_size: usize,
    pub chunk_overlap: usize,
}

impl Default for RetrievalSection {
    fn default() -> Self {
        Self {
            corpus_dir: None,
            k: 4,
            timeout_secs: 10,
            chunk_size: 1000,
            chunk_overlap: 200,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryConfig {
    pub enabled: bool,
    /// Compact once a conversation holds more turns than this
    pub threshold: usize,
    /// Turns kept verbatim after compaction
    pub keep_recent: usize,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            threshold: 10,
            keep_recent: 4,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewaySection {
    pub confidence_floor: f64,
    pub short_message_words: usize,
}

impl Default for GatewaySection {
    fn default() -> Self {
        Self {
            confidence_floor: 0.4,
            short_message_words: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GuardSection {
    pub confidence_floor: f64,
    pub recent_window: usize,
}

impl Default for GuardSection {
    fn default() -> Self {
        Self {
            confidence_floor: 0.4,
            recent_window: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QuotaConfig {
    pub daily_limit: u32,
    /// Persist the counter here across restarts
    pub state_file: Option<PathBuf>,
}

impl Default for QuotaConfig {
    fn default() -> Self {
        Self {
            daily_limit: 100,
            state_file: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: String,
    /// Allowed CORS origins; empty allows any
    pub cors_origins: Vec<String>,
    /// Size of the padding comment that opens every stream
    pub padding_bytes: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0:8000".into(),
            cors_origins: Vec::new(),
            padding_bytes: 4096,
        }
    }
}

impl Config {
    /// Get the config directory
    pub fn config_dir() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("muse")
    }

    /// Get the config file path
    pub fn config_path() -> PathBuf {
        if let Ok(path) = std::env::var("MUSE_CONFIG_PATH") {
            return PathBuf::from(path);
        }
        Self::config_dir().join("config.toml")
    }

    /// Load config from `path`. A missing or unreadable file yields defaults.
    pub fn load_from(path: &Path) -> Self {
        if !path.exists() {
            tracing::info!(path = %path.display(), "no config file, using defaults");
            return Self::default();
        }

        match fs::read_to_string(path) {
            Ok(content) => match toml::from_str(&content) {
                Ok(config) => config,
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "failed to parse config file");
                    Self::default()
                }
            },
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "failed to read config file");
                Self::default()
            }
        }
    }

    /// Write the example config to `path` unless a file is already there
    pub fn init(path: &Path) -> std::io::Result<()> {
        if path.exists() {
            return Ok(());
        }
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)?;
        }
        fs::write(path, example_config())
    }

    pub fn provider(&self) -> anyhow::Result<Provider> {
        Provider::parse(&self.llm.provider)
            .ok_or_else(|| anyhow::anyhow!("unknown provider '{}'", self.llm.provider))
    }

    /// API key for the configured provider, checking config then env
    pub fn api_key(&self, provider: Provider) -> Option<String> {
        if let Some(key) = self.llm.api_key.as_ref().filter(|k| !k.is_empty()) {
            return Some(key.clone());
        }
        provider
            .api_key_env_var()
            .and_then(|var| std::env::var(var).ok())
    }

    /// Model registry with this config's endpoint and tier overrides
    pub fn registry(&self, provider: Provider) -> ModelRegistry {
        let mut registry = ModelRegistry::new(provider);
        if let Some(url) = &self.llm.base_url {
            registry = registry.with_base_url(url.clone());
        }
        for (tier, model) in [
            (ModelTier::Fast, &self.llm.fast_model),
            (ModelTier::Medium, &self.llm.medium_model),
            (ModelTier::Strong, &self.llm.strong_model),
        ] {
            if let Some(model) = model {
                registry = registry.with_override(tier, model.clone());
            }
        }
        registry
    }

    pub fn retry_config(&self) -> RetryConfig {
        RetryConfig {
            max_retries: self.llm.max_retries,
            ..Default::default()
        }
    }

    /// Node bound: the configured value, or every attempt of one judgment
    /// call plus its backoff delays and a small margin.
    pub fn node_timeout(&self) -> Duration {
        if let Some(secs) = self.llm.node_timeout_secs {
            return Duration::from_secs(secs);
        }
        let retry = self.retry_config();
        let attempts = retry.max_retries.saturating_add(1);
        let backoff: Duration = (0..retry.max_retries)
            .map(|attempt| retry.delay_for_attempt(attempt))
            .sum();
        let call = Duration::from_secs(self.llm.request_timeout_secs);
        call.saturating_mul(attempts) + backoff + Duration::from_secs(5)
    }

    pub fn chunk_config(&self) -> ChunkConfig {
        ChunkConfig {
            size: self.retrieval.chunk_size,
            overlap: self.retrieval.chunk_overlap,
        }
    }

    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            native_language: self.native_language.clone(),
            generation: GenerationConfig {
                persona: Persona {
                    name: self.persona.name.clone(),
                    profile: self.persona.profile.clone(),
                },
                ..Default::default()
            },
            compaction: CompactionConfig {
                enabled: self.memory.enabled,
                threshold: self.memory.threshold,
                keep_recent: self.memory.keep_recent,
            },
            gateway: GatewayConfig {
                confidence_floor: self.gateway.confidence_floor,
                short_message_words: self.gateway.short_message_words,
                ..Default::default()
            },
            guard: GuardConfig {
                confidence_floor: self.guard.confidence_floor,
                recent_window: self.guard.recent_window,
            },
            retrieval: RetrievalConfig {
                k: self.retrieval.k,
                timeout: Duration::from_secs(self.retrieval.timeout_secs),
            },
            node_timeout: self.node_timeout(),
        }
    }
}

/// Example configuration file content
pub fn example_config() -> &'static str {
    r#"# muse configuration file
# Place at ~/.config/muse/config.toml (Linux/Mac) or %APPDATA%\muse\config.toml (Windows)
# or point MUSE_CONFIG_PATH at it.

# Language replies are generated in; others are translated
native_language = "pt-br"

[llm]
# openai, groq, google, ollama or custom
provider = "openai"
# base_url = "http://localhost:11434/v1"
# api_key = "sk-..."  (prefer OPENAI_API_KEY / GROQ_API_KEY / GOOGLE_API_KEY)
# fast_model = "gpt-4.1-nano"
# medium_model = "gpt-4.1-mini"
# strong_model = "gpt-5-nano"
request_timeout_secs = 30
max_retries = 2
# node_timeout_secs = 120  (default: every retry of one call plus backoff)

[persona]
name = "Marcos"

[retrieval]
# corpus_dir = "./corpus"
k = 4
timeout_secs = 10

[memory]
threshold = 10
keep_recent = 4

[gateway]
confidence_floor = 0.4
short_message_words = 10

[guard]
confidence_floor = 0.4

[quota]
daily_limit = 100
# state_file = "./quota.json"

[server]
bind = "0.0.0.0:8000"
cors_origins = []
padding_bytes = 4096
"#
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_example_config_parses() {
        let config: Config = toml::from_str(example_config()).unwrap();
        assert_eq!(config.native_language, "pt-br");
        assert_eq!(config.quota.daily_limit, 100);
        assert_eq!(config.memory.threshold, 10);
        assert_eq!(config.server.padding_bytes, 4096);
    }

    #[test]
    fn test_partial_config_keeps_defaults() {
        let config: Config = toml::from_str("[quota]\ndaily_limit = 5\n").unwrap();
        assert_eq!(config.quota.daily_limit, 5);
        assert_eq!(config.llm.provider, "openai");
        assert_eq!(config.retrieval.k, 4);
    }

    #[test]
    fn test_missing_or_broken_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load_from(&dir.path().join("absent.toml"));
        assert_eq!(config.gateway.confidence_floor, 0.4);

        let broken = dir.path().join("broken.toml");
        fs::write(&broken, "native_language = [").unwrap();
        let config = Config::load_from(&broken);
        assert_eq!(config.native_language, "pt-br");
    }

    #[test]
    fn test_init_writes_example_once() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("muse/config.toml");
        Config::init(&path).unwrap();
        fs::write(&path, "native_language = \"en\"\n").unwrap();
        Config::init(&path).unwrap();
        assert_eq!(Config::load_from(&path).native_language, "en");
    }

    #[test]
    fn test_engine_config_mirrors_sections() {
        let mut config = Config::default();
        config.memory.threshold = 20;
        config.guard.confidence_floor = 0.6;
        config.native_language = "en".into();
        let engine = config.engine_config();
        assert_eq!(engine.compaction.threshold, 20);
        assert_eq!(engine.guard.confidence_floor, 0.6);
        assert_eq!(engine.native_language, "en");
        assert_eq!(engine.gateway.history_turns, GatewayConfig::default().history_turns);
    }

    #[test]
    fn test_node_timeout_covers_every_retry() {
        let config = Config::default();
        let retry = config.retry_config();
        let worst_call = Duration::from_secs(30) * 3
            + retry.delay_for_attempt(0)
            + retry.delay_for_attempt(1);
        assert!(config.node_timeout() > worst_call);
        assert_eq!(config.engine_config().node_timeout, config.node_timeout());

        let mut config = Config::default();
        config.llm.node_timeout_secs = Some(45);
        assert_eq!(config.engine_config().node_timeout, Duration::from_secs(45));
    }

    #[test]
    fn test_registry_applies_overrides() {
        let mut config = Config::default();
        config.llm.fast_model = Some("gpt-4o-mini".into());
        config.llm.base_url = Some("http://proxy.local/v1".into());
        let registry = config.registry(Provider::OpenAI);
        let model = registry.resolve(ModelTier::Fast).unwrap();
        assert_eq!(model.id, "gpt-4o-mini");
        assert_eq!(model.base_url, "http://proxy.local/v1");
    }

    #[test]
    fn test_configured_key_wins() {
        let mut config = Config::default();
        config.llm.api_key = Some("sk-config".into());
        assert_eq!(config.api_key(Provider::OpenAI).as_deref(), Some("sk-config"));
    }
}
