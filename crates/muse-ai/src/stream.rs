//! Streaming event types and utilities

use crate::error::{Error, Result};
use crate::types::{StopReason, Usage};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::pin::Pin;
use tokio_stream::Stream;

/// Events emitted during message streaming
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MessageEvent {
    /// Response started
    Start { model: String },
    /// Text content delta
    TextDelta { delta: String },
    /// Message completed successfully
    Done {
        text: String,
        stop_reason: StopReason,
        usage: Usage,
    },
    /// Error occurred
    Error { message: String },
}

impl MessageEvent {
    /// Check if this is a terminal event (Done or Error)
    pub fn is_terminal(&self) -> bool {
        matches!(self, MessageEvent::Done { .. } | MessageEvent::Error { .. })
    }
}

/// A stream of message events
pub type MessageEventStream = Pin<Box<dyn Stream<Item = MessageEvent> + Send>>;

/// Accumulates text deltas into the final response
#[derive(Debug, Default)]
pub struct MessageBuilder {
    text: String,
    usage: Usage,
    stop_reason: Option<StopReason>,
}

impl MessageBuilder {
    /// Create a new message builder
    pub fn new() -> Self {
        Self::default()
    }

    /// Process a streaming event and update the message state
    pub fn process_event(&mut self, event: &MessageEvent) {
        match event {
            MessageEvent::TextDelta { delta } => self.text.push_str(delta),
            MessageEvent::Done {
                text,
                stop_reason,
                usage,
            } => {
                // The provider's final text is authoritative when present
                if !text.is_empty() {
                    self.text = text.clone();
                }
                self.stop_reason = Some(*stop_reason);
                self.usage = usage.clone();
            }
            _ => {}
        }
    }

    /// Text accumulated so far
    pub fn current_text(&self) -> &str {
        &self.text
    }

    pub fn usage(&self) -> &Usage {
        &self.usage
    }

    pub fn is_done(&self) -> bool {
        self.stop_reason.is_some()
    }

    /// Build the final completion
    pub fn build(self) -> Completion {
        Completion {
            text: self.text,
            usage: self.usage,
        }
    }
}

/// A finished response with its token usage
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Completion {
    pub text: String,
    pub usage: Usage,
}

/// Drain a stream into its final completion.
///
/// Returns an error if the stream reports one or ends without a `Done` event.
pub async fn collect_completion(mut stream: MessageEventStream) -> Result<Completion> {
    let mut builder = MessageBuilder::new();
    while let Some(event) = stream.next().await {
        if let MessageEvent::Error { message } = &event {
            return Err(Error::Sse(message.clone()));
        }
        builder.process_event(&event);
    }
    if !builder.is_done() {
        return Err(Error::UnexpectedResponse(
            "stream ended before completion".to_string(),
        ));
    }
    Ok(builder.build())
}
