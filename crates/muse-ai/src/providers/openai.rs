//! OpenAI-compatible Chat Completions provider
//!
//! Serves OpenAI itself plus every provider exposing the same wire format
//! (Groq, Google's compatibility endpoint, Ollama).

use async_stream::stream;
use async_trait::async_trait;
use futures::StreamExt;
use reqwest_eventsource::{Event, EventSource};
use serde::{Deserialize, Serialize};

use super::LlmProvider;
use crate::{
    error::{Error, Result},
    stream::{MessageEvent, MessageEventStream},
    types::{Context, Message, Model, StopReason, StreamOptions, Usage},
};

/// OpenAI-compatible API client
pub struct OpenAIProvider {
    client: reqwest::Client,
    api_key: Option<String>,
}

impl OpenAIProvider {
    /// Create a new provider with an API key
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key: Some(api_key.into()),
        }
    }

    /// Create a provider for endpoints that take no key (local Ollama)
    pub fn anonymous() -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key: None,
        }
    }

    /// Create from environment variable
    pub fn from_env(env_var: &str) -> Result<Self> {
        let api_key = std::env::var(env_var).map_err(|_| Error::InvalidApiKey)?;
        Ok(Self::new(api_key))
    }

    fn build_request(&self, model: &Model, context: &Context, options: &StreamOptions) -> ChatRequest {
        let mut messages = Vec::new();

        if let Some(ref system_prompt) = context.system_prompt {
            messages.push(ChatMessage::from(&Message::system(system_prompt.clone())));
        }
        messages.extend(context.messages.iter().map(ChatMessage::from));

        ChatRequest {
            model: model.id.clone(),
            messages,
            stream: true,
            max_tokens: Some(options.max_tokens.unwrap_or(model.max_tokens)),
            temperature: options.temperature,
            response_format: options
                .json_mode
                .then(|| serde_json::json!({ "type": "json_object" })),
            stream_options: Some(StreamOptionsWire {
                include_usage: true,
            }),
        }
    }
}

#[async_trait]
impl LlmProvider for OpenAIProvider {
    async fn stream(
        &self,
        model: &Model,
        context: &Context,
        options: &StreamOptions,
    ) -> Result<MessageEventStream> {
        if model.base_url.is_empty() {
            return Err(Error::InvalidConfig(format!(
                "no base url configured for model {}",
                model.id
            )));
        }

        let request = self.build_request(model, context, options);
        let url = format!("{}/chat/completions", model.base_url.trim_end_matches('/'));

        let mut headers = reqwest::header::HeaderMap::new();
        if let Some(ref key) = self.api_key {
            let value = format!("Bearer {}", key)
                .parse()
                .map_err(|_| Error::InvalidApiKey)?;
            headers.insert(reqwest::header::AUTHORIZATION, value);
        }
        headers.insert(
            reqwest::header::CONTENT_TYPE,
            reqwest::header::HeaderValue::from_static("application/json"),
        );

        // Add model-specific headers
        for (key, value) in &model.headers {
            if let (Ok(name), Ok(val)) = (
                key.parse::<reqwest::header::HeaderName>(),
                value.parse::<reqwest::header::HeaderValue>(),
            ) {
                headers.insert(name, val);
            }
        }

        let request_builder = self.client.post(&url).headers(headers).json(&request);

        let event_source = EventSource::new(request_builder)
            .map_err(|e| Error::Sse(format!("Failed to create event source: {}", e)))?;

        Ok(Box::pin(create_stream(event_source, model.id.clone())))
    }
}

impl From<&Message> for ChatMessage {
    fn from(msg: &Message) -> Self {
        ChatMessage {
            role: msg.role.as_str().to_string(),
            content: msg.content.clone(),
        }
    }
}

/// Map a transport failure to an error message, keeping the HTTP status
/// visible so retry classification can see it.
fn describe_source_error(error: &reqwest_eventsource::Error) -> String {
    match error {
        reqwest_eventsource::Error::InvalidStatusCode(status, _) => {
            if status.as_u16() == 429 {
                format!("rate limit: HTTP {}", status)
            } else {
                format!("HTTP {}", status)
            }
        }
        other => format!("SSE error: {}", other),
    }
}

fn create_stream(
    mut event_source: EventSource,
    model_id: String,
) -> impl futures::Stream<Item = MessageEvent> {
    stream! {
        let mut accumulated_text = String::new();
        let mut finish_reason: Option<String> = None;
        let mut usage = Usage::default();

        yield MessageEvent::Start { model: model_id.clone() };

        while let Some(event) = event_source.next().await {
            match event {
                Ok(Event::Open) => {}
                Ok(Event::Message(msg)) => {
                    if msg.data == "[DONE]" {
                        break;
                    }

                    let chunk: std::result::Result<StreamChunk, _> = serde_json::from_str(&msg.data);
                    match chunk {
                        Ok(chunk) => {
                            for choice in &chunk.choices {
                                if let Some(ref content) = choice.delta.content {
                                    accumulated_text.push_str(content);
                                    yield MessageEvent::TextDelta {
                                        delta: content.clone(),
                                    };
                                }
                                if let Some(ref reason) = choice.finish_reason {
                                    finish_reason = Some(reason.clone());
                                }
                            }

                            // Usage arrives in the final chunk
                            if let Some(ref stream_usage) = chunk.usage {
                                usage.input = stream_usage.prompt_tokens;
                                usage.output = stream_usage.completion_tokens;
                            }
                        }
                        Err(e) => {
                            event_source.close();
                            yield MessageEvent::Error {
                                message: format!("Failed to parse chunk: {}", e),
                            };
                            return;
                        }
                    }
                }
                Err(reqwest_eventsource::Error::StreamEnded) => break,
                Err(e) => {
                    event_source.close();
                    yield MessageEvent::Error {
                        message: describe_source_error(&e),
                    };
                    return;
                }
            }
        }
        event_source.close();

        let stop_reason = match finish_reason.as_deref() {
            Some("length") => StopReason::Length,
            _ => StopReason::Stop,
        };

        yield MessageEvent::Done {
            text: accumulated_text,
            stop_reason,
            usage,
        };
    }
}

// Request/Response types

#[derive(Debug, Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<ChatMessage>,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stream_options: Option<StreamOptionsWire>,
}

#[derive(Debug, Serialize)]
struct StreamOptionsWire {
    include_usage: bool,
}

#[derive(Debug, Serialize)]
struct ChatMessage {
    role: String,
    content: String,
}

// Streaming response types

#[derive(Debug, Deserialize)]
struct StreamChunk {
    #[serde(default)]
    choices: Vec<StreamChoice>,
    #[serde(default)]
    usage: Option<StreamUsage>,
}

#[derive(Debug, Deserialize)]
struct StreamChoice {
    delta: StreamDelta,
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct StreamDelta {
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct StreamUsage {
    prompt_tokens: u32,
    completion_tokens: u32,
}
