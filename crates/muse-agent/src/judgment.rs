//! Judgment client: the single seam through which every node reaches a
//! language model.
//!
//! Nodes build a [`JudgmentRequest`] (system prompt, user prompt, tier,
//! temperature) and get text or parsed JSON back. [`ProviderJudgment`] is the
//! production implementation over `muse-ai`; tests substitute scripted mocks.

use std::{sync::Arc, sync::LazyLock, time::Duration};

use async_trait::async_trait;
use muse_ai::{
    Context, Message, ModelTier, StreamOptions, models::ModelRegistry, providers::LlmProvider,
    stream::collect_completion,
};
use regex::Regex;
use serde_json::Value;

use crate::error::{Error, Result};

/// Retry configuration
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of retry attempts
    pub max_retries: u32,
    /// Initial delay between retries
    pub initial_delay: Duration,
    /// Maximum delay between retries
    pub max_delay: Duration,
    /// Multiplier for exponential backoff
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 2,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(8),
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    /// Calculate delay for a given attempt (0-indexed)
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let delay_secs =
            self.initial_delay.as_secs_f64() * self.backoff_multiplier.powi(attempt as i32);
        Duration::from_secs_f64(delay_secs.min(self.max_delay.as_secs_f64()))
    }
}

/// One prompt for the model
#[derive(Debug, Clone, PartialEq)]
pub struct JudgmentRequest {
    pub system: String,
    pub user: String,
    pub tier: ModelTier,
    pub temperature: f32,
    /// Ask the provider for a JSON object response
    pub json: bool,
}

impl JudgmentRequest {
    pub fn new(tier: ModelTier, system: impl Into<String>, user: impl Into<String>) -> Self {
        Self {
            system: system.into(),
            user: user.into(),
            tier,
            temperature: 0.0,
            json: false,
        }
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn json(mut self) -> Self {
        self.json = true;
        self
    }
}

/// Prompt in, text or structured JSON out.
#[async_trait]
pub trait JudgmentClient: Send + Sync {
    /// Run a prompt and return the model's text
    async fn complete(&self, request: JudgmentRequest) -> Result<String>;

    /// Run a prompt that must answer with a JSON object
    async fn complete_json(&self, request: JudgmentRequest) -> Result<Value> {
        let text = self.complete(request.json()).await?;
        parse_json_block(&text)
    }
}

static JSON_OBJECT: LazyLock<Option<Regex>> = LazyLock::new(|| Regex::new(r"(?s)\{.*\}").ok());

/// Extract and parse the outermost `{...}` block of a model response,
/// tolerating markdown fences and surrounding prose.
pub fn parse_json_block(text: &str) -> Result<Value> {
    let cleaned = text.replace("```json", "").replace("```", "");
    let block = JSON_OBJECT
        .as_ref()
        .and_then(|re| re.find(&cleaned))
        .map(|m| m.as_str())
        .ok_or_else(|| Error::MalformedJudgment(format!("no JSON object in {:?}", truncate(text))))?;
    serde_json::from_str(block).map_err(|e| Error::MalformedJudgment(e.to_string()))
}

/// Compile a JSON Schema. `None` makes every validation fail.
pub fn compile_schema(schema: &Value) -> Option<jsonschema::Validator> {
    match jsonschema::validator_for(schema) {
        Ok(validator) => Some(validator),
        Err(e) => {
            tracing::error!(error = %e, "invalid judgment schema");
            None
        }
    }
}

/// Check a structured judgment against its schema
pub fn validate(schema: Option<&jsonschema::Validator>, value: &Value) -> Result<()> {
    let Some(validator) = schema else {
        return Err(Error::MalformedJudgment("schema unavailable".into()));
    };
    let problems: Vec<String> = validator.iter_errors(value).map(|e| e.to_string()).collect();
    if problems.is_empty() {
        Ok(())
    } else {
        Err(Error::MalformedJudgment(problems.join("; ")))
    }
}

fn truncate(text: &str) -> String {
    text.chars().take(120).collect()
}

/// Client errors other than 429 will not improve on retry
static CLIENT_ERROR: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"HTTP 4(0\d|1\d|2[0-8])\b").ok());

fn is_retryable(error: &muse_ai::Error) -> bool {
    if !error.is_retryable() {
        return false;
    }
    let message = error.to_string();
    !CLIENT_ERROR
        .as_ref()
        .is_some_and(|re| re.is_match(&message))
}

/// Judgment client backed by a `muse-ai` provider
pub struct ProviderJudgment {
    provider: Arc<dyn LlmProvider>,
    registry: ModelRegistry,
    timeout: Duration,
    retry_config: RetryConfig,
}

impl ProviderJudgment {
    pub fn new(provider: Arc<dyn LlmProvider>, registry: ModelRegistry) -> Self {
        Self {
            provider,
            registry,
            timeout: Duration::from_secs(30),
            retry_config: RetryConfig::default(),
        }
    }

    /// Bound each model call
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Set retry configuration
    pub fn with_retry_config(mut self, config: RetryConfig) -> Self {
        self.retry_config = config;
        self
    }

    async fn attempt(
        &self,
        model: &muse_ai::Model,
        context: &Context,
        options: &StreamOptions,
    ) -> muse_ai::Result<String> {
        let call = async {
            let stream = self.provider.stream(model, context, options).await?;
            collect_completion(stream).await
        };
        let completion = match tokio::time::timeout(self.timeout, call).await {
            Ok(result) => result?,
            Err(_) => return Err(muse_ai::Error::Timeout(self.timeout)),
        };
        tracing::debug!(
            model = %model.id,
            input_tokens = completion.usage.input,
            output_tokens = completion.usage.output,
            "judgment call finished"
        );
        Ok(completion.text)
    }
}

#[async_trait]
impl JudgmentClient for ProviderJudgment {
    async fn complete(&self, request: JudgmentRequest) -> Result<String> {
        let model = self.registry.resolve(request.tier).ok_or_else(|| {
            Error::Judgment(format!(
                "no model configured for tier {:?} on {}",
                request.tier,
                self.registry.provider().name()
            ))
        })?;

        let mut context = Context::with_system(request.system);
        context.push(Message::user(request.user));
        let options = StreamOptions {
            max_tokens: None,
            temperature: Some(request.temperature),
            json_mode: request.json,
        };

        let mut attempt = 0u32;
        loop {
            match self.attempt(&model, &context, &options).await {
                Ok(text) => return Ok(text),
                Err(e) if attempt < self.retry_config.max_retries && is_retryable(&e) => {
                    let delay = self.retry_config.delay_for_attempt(attempt);
                    tracing::warn!(
                        model = %model.id,
                        attempt = attempt + 1,
                        error = %e,
                        ?delay,
                        "judgment call failed, retrying"
                    );
                    attempt += 1;
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod mock {
    use std::collections::VecDeque;

    use parking_lot::Mutex;

    use super::*;

    /// Answers judgment calls from a queue, in order, and records every request.
    #[derive(Default)]
    pub struct ScriptedJudgment {
        pub responses: Mutex<VecDeque<std::result::Result<String, String>>>,
        pub calls: Mutex<Vec<JudgmentRequest>>,
    }

    impl ScriptedJudgment {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn reply(self, text: impl Into<String>) -> Self {
            self.responses.lock().push_back(Ok(text.into()));
            self
        }

        pub fn fail(self, message: impl Into<String>) -> Self {
            self.responses.lock().push_back(Err(message.into()));
            self
        }

        pub fn call_count(&self) -> usize {
            self.calls.lock().len()
        }
    }

    #[async_trait]
    impl JudgmentClient for ScriptedJudgment {
        async fn complete(&self, request: JudgmentRequest) -> Result<String> {
            self.calls.lock().push(request);
            match self.responses.lock().pop_front() {
                Some(Ok(text)) => Ok(text),
                Some(Err(message)) => Err(Error::Judgment(message)),
                None => Err(Error::Judgment("no scripted response left".into())),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use muse_ai::{
        MessageEventStream, Provider, StopReason, Usage, stream::MessageEvent,
    };
    use parking_lot::Mutex;
    use serde_json::json;

    #[test]
    fn test_retry_delay_backoff_is_capped() {
        let config = RetryConfig {
            max_retries: 5,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(3),
            backoff_multiplier: 2.0,
        };
        assert_eq!(config.delay_for_attempt(0), Duration::from_secs(1));
        assert_eq!(config.delay_for_attempt(1), Duration::from_secs(2));
        assert_eq!(config.delay_for_attempt(4), Duration::from_secs(3));
    }

    #[test]
    fn test_parse_json_block_strips_fences_and_prose() {
        let text = "Sure:\n```json\n{\"classification\": \"casual\", \"confidence\": 0.9}\n```";
        let value = parse_json_block(text).unwrap();
        assert_eq!(value["classification"], "casual");
    }

    #[test]
    fn test_parse_json_block_rejects_plain_text() {
        assert!(matches!(
            parse_json_block("I think it's technical"),
            Err(Error::MalformedJudgment(_))
        ));
        assert!(matches!(
            parse_json_block("{not json}"),
            Err(Error::MalformedJudgment(_))
        ));
    }

    #[test]
    fn test_schema_validation() {
        let schema = compile_schema(&json!({
            "type": "object",
            "required": ["answerable"],
            "properties": { "answerable": { "type": "boolean" } }
        }));
        assert!(validate(schema.as_ref(), &json!({"answerable": true})).is_ok());
        assert!(validate(schema.as_ref(), &json!({"answerable": "yes"})).is_err());
        assert!(validate(None, &json!({"answerable": true})).is_err());
    }

    #[test]
    fn test_client_errors_are_not_retried() {
        assert!(!is_retryable(&muse_ai::Error::Sse("HTTP 401 Unauthorized".into())));
        assert!(is_retryable(&muse_ai::Error::Sse("rate limit: HTTP 429 Too Many Requests".into())));
        assert!(is_retryable(&muse_ai::Error::Sse("HTTP 503 Service Unavailable".into())));
        assert!(!is_retryable(&muse_ai::Error::InvalidApiKey));
    }

    /// Fails the first `failures` calls, then answers with `text`.
    struct FlakyProvider {
        failures: Mutex<u32>,
        text: String,
        calls: Mutex<Vec<muse_ai::StreamOptions>>,
        hang: bool,
    }

    impl FlakyProvider {
        fn new(failures: u32, text: &str) -> Self {
            Self {
                failures: Mutex::new(failures),
                text: text.into(),
                calls: Mutex::new(Vec::new()),
                hang: false,
            }
        }
    }

    #[async_trait]
    impl LlmProvider for FlakyProvider {
        async fn stream(
            &self,
            _model: &muse_ai::Model,
            _context: &Context,
            options: &StreamOptions,
        ) -> muse_ai::Result<MessageEventStream> {
            self.calls.lock().push(options.clone());
            if self.hang {
                tokio::time::sleep(Duration::from_secs(3600)).await;
            }
            {
                let mut failures = self.failures.lock();
                if *failures > 0 {
                    *failures -= 1;
                    return Err(muse_ai::Error::RateLimited { retry_after: None });
                }
            }
            let events = vec![
                MessageEvent::TextDelta {
                    delta: self.text.clone(),
                },
                MessageEvent::Done {
                    text: String::new(),
                    stop_reason: StopReason::Stop,
                    usage: Usage::default(),
                },
            ];
            Ok(Box::pin(tokio_stream::iter(events)))
        }
    }

    fn fast_retries(max_retries: u32) -> RetryConfig {
        RetryConfig {
            max_retries,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(1),
            backoff_multiplier: 1.0,
        }
    }

    #[tokio::test]
    async fn test_provider_judgment_retries_rate_limits() {
        let provider = Arc::new(FlakyProvider::new(2, "ok"));
        let judgment = ProviderJudgment::new(provider.clone(), ModelRegistry::new(Provider::OpenAI))
            .with_retry_config(fast_retries(3));
        let text = judgment
            .complete(JudgmentRequest::new(ModelTier::Fast, "sys", "hi").with_temperature(0.2))
            .await
            .unwrap();
        assert_eq!(text, "ok");
        let calls = provider.calls.lock();
        assert_eq!(calls.len(), 3);
        assert_eq!(calls[0].temperature, Some(0.2));
    }

    #[tokio::test]
    async fn test_provider_judgment_gives_up_after_max_retries() {
        let provider = Arc::new(FlakyProvider::new(5, "ok"));
        let judgment = ProviderJudgment::new(provider.clone(), ModelRegistry::new(Provider::OpenAI))
            .with_retry_config(fast_retries(1));
        let result = judgment
            .complete(JudgmentRequest::new(ModelTier::Fast, "sys", "hi"))
            .await;
        assert!(matches!(result, Err(Error::Ai(_))));
        assert_eq!(provider.calls.lock().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_provider_judgment_times_out() {
        let mut flaky = FlakyProvider::new(0, "never");
        flaky.hang = true;
        let judgment = ProviderJudgment::new(Arc::new(flaky), ModelRegistry::new(Provider::OpenAI))
            .with_timeout(Duration::from_secs(5))
            .with_retry_config(fast_retries(0));
        let result = judgment
            .complete(JudgmentRequest::new(ModelTier::Medium, "sys", "hi"))
            .await;
        assert!(matches!(result, Err(Error::Ai(muse_ai::Error::Timeout(_)))));
    }

    #[tokio::test]
    async fn test_unresolvable_tier_is_judgment_error() {
        let judgment = ProviderJudgment::new(
            Arc::new(FlakyProvider::new(0, "x")),
            ModelRegistry::new(Provider::Ollama),
        );
        let result = judgment
            .complete(JudgmentRequest::new(ModelTier::Fast, "sys", "hi"))
            .await;
        assert!(matches!(result, Err(Error::Judgment(_))));
    }

    #[tokio::test]
    async fn test_complete_json_requests_json_mode() {
        let provider = Arc::new(FlakyProvider::new(0, r#"{"ok": true}"#));
        let judgment = ProviderJudgment::new(provider.clone(), ModelRegistry::new(Provider::Groq));
        let value = judgment
            .complete_json(JudgmentRequest::new(ModelTier::Fast, "sys", "hi"))
            .await
            .unwrap();
        assert_eq!(value["ok"], true);
        assert!(provider.calls.lock()[0].json_mode);
    }
}
