//! Progress streamer: turns one engine run into an ordered stream of
//! status events followed by exactly one terminal event.

use std::sync::Arc;

use futures::Stream;
use tokio::sync::mpsc;

use crate::{
    conversation::ConversationState,
    engine::{Engine, NodeId},
    error::Error,
    events::{EngineEvent, StreamEvent},
    gateway::Intent,
    handle::RunHandle,
    language::normalize_language,
    quota::QuotaGate,
};

/// Detail sent when a run ends without a reply
pub const NO_RESPONSE: &str = "No response generated.";

/// Label shown before the first node
pub fn starting_label(english: bool) -> &'static str {
    if english { "Starting..." } else { "Iniciando..." }
}

/// User-facing label for a finished node
pub fn status_label(node: NodeId, intent: Option<Intent>, english: bool) -> &'static str {
    let (pt, en) = match node {
        NodeId::DetectLanguage => ("Lendo histórico...", "Reading history..."),
        NodeId::CompactMemory => ("Entendendo contexto...", "Understanding context..."),
        NodeId::Gateway => match intent {
            Some(Intent::Casual) => ("Pensando...", "Thinking..."),
            _ => ("Pesquisando nas memórias...", "Searching memories..."),
        },
        NodeId::Retrieve => ("Estudando informações...", "Reading data..."),
        NodeId::Guard => ("Validando resposta...", "Validating answer..."),
        NodeId::Fallback => ("Formulando explicação...", "Formulating explanation..."),
        NodeId::GenerateGrounded | NodeId::GenerateCasual => ("Finalizando...", "Finalizing..."),
        NodeId::Translate => ("Traduzindo resposta...", "Translating response..."),
    };
    if english { en } else { pt }
}

/// Streams engine runs to callers
#[derive(Clone)]
pub struct ProgressStreamer {
    engine: Arc<Engine>,
    quota: Arc<QuotaGate>,
}

impl ProgressStreamer {
    pub fn new(engine: Arc<Engine>, quota: Arc<QuotaGate>) -> Self {
        Self { engine, quota }
    }

    pub fn engine(&self) -> &Arc<Engine> {
        &self.engine
    }

    /// Start a run for `state`.
    ///
    /// Dropping the returned stream cancels the run; no further nodes start
    /// and nothing else is emitted.
    pub fn stream(
        &self,
        state: ConversationState,
    ) -> (RunHandle, impl Stream<Item = StreamEvent> + Send + 'static) {
        let english = {
            let language = state
                .language_hint
                .as_deref()
                .filter(|hint| !hint.trim().is_empty())
                .unwrap_or(self.engine.native_language());
            normalize_language(language) == "en"
        };

        let handle = RunHandle::new();
        handle.started();
        let (tx, mut rx) = mpsc::unbounded_channel();

        let task = {
            let engine = self.engine.clone();
            let cancel = handle.cancel_token();
            let handle = handle.clone();
            tokio::spawn(async move {
                let result = engine.run(state, &cancel, Some(&tx)).await;
                handle.finished();
                result
            })
        };

        let quota = self.quota.clone();
        let guard = handle.cancel_token().drop_guard();
        let stream = async_stream::stream! {
            let _guard = guard;
            yield StreamEvent::status(starting_label(english));

            while let Some(event) = rx.recv().await {
                if let EngineEvent::NodeCompleted { node, intent, .. } = event {
                    yield StreamEvent::status(status_label(node, intent, english));
                }
            }

            match task.await {
                Ok(Ok(outcome)) => match outcome.reply() {
                    Some(reply) if !reply.trim().is_empty() => {
                        yield StreamEvent::Result {
                            response: reply.to_string(),
                            usage: quota.status(),
                            memory: outcome.state.summary_turn().map(|t| t.content.clone()),
                        };
                    }
                    _ => {
                        tracing::error!("run finished without a reply");
                        yield StreamEvent::error(NO_RESPONSE);
                    }
                },
                Ok(Err(Error::Cancelled)) => {
                    tracing::info!("run cancelled, closing stream");
                }
                Ok(Err(e)) => {
                    tracing::error!(error = %e, "run failed");
                    yield StreamEvent::error(e.to_string());
                }
                Err(e) => {
                    tracing::error!(error = %e, "run task panicked");
                    yield StreamEvent::error("internal error");
                }
            }
        };

        (handle, stream)
    }
}
