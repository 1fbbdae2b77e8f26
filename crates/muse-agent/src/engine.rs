//! The orchestration engine.
//!
//! A fixed graph of named nodes, encoded as a transition table of
//! `(node, predicate, next)` rows and driven by a small interpreter loop.
//! Every edge predicate is a pure function of the conversation state.

use std::{fmt, sync::Arc, time::Duration};

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::{
    compaction::{self, CompactionConfig},
    conversation::{ConversationState, Fields, StateUpdate},
    error::{Error, Result},
    events::EngineEvent,
    gateway::{self, GatewayConfig, Intent},
    generation::{self, GenerationConfig},
    guard::{self, GuardConfig},
    judgment::JudgmentClient,
    language::{self, normalize_language, same_language},
    retrieval::{self, RetrievalConfig, Retriever},
};

/// Pipeline nodes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeId {
    DetectLanguage,
    CompactMemory,
    Gateway,
    Retrieve,
    Guard,
    GenerateGrounded,
    GenerateCasual,
    Fallback,
    Translate,
}

impl NodeId {
    /// Where every run starts
    pub const ENTRY: NodeId = NodeId::DetectLanguage;

    pub fn as_str(&self) -> &'static str {
        match self {
            NodeId::DetectLanguage => "detect_language",
            NodeId::CompactMemory => "compact_memory",
            NodeId::Gateway => "gateway",
            NodeId::Retrieve => "retrieve",
            NodeId::Guard => "guard",
            NodeId::GenerateGrounded => "generate_grounded",
            NodeId::GenerateCasual => "generate_casual",
            NodeId::Fallback => "fallback",
            NodeId::Translate => "translate",
        }
    }

    /// Nodes that append the reply turn
    pub fn is_generation(&self) -> bool {
        matches!(
            self,
            NodeId::GenerateGrounded | NodeId::GenerateCasual | NodeId::Fallback
        )
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where a transition leads
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    Node(NodeId),
    End,
}

/// Edge conditions, evaluated against the state after the source node ran
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Predicate {
    Always,
    IntentCasual,
    /// Technical, or no intent at all
    IntentTechnical,
    Answerable,
    /// Not answerable, or no verdict at all
    NotAnswerable,
    NeedsTranslation,
    NativeLanguage,
}

impl Predicate {
    fn holds(self, state: &ConversationState, native: &str) -> bool {
        let needs_translation = state
            .reply_language
            .as_deref()
            .is_some_and(|lang| !same_language(lang, native));
        match self {
            Predicate::Always => true,
            Predicate::IntentCasual => state.intent == Some(Intent::Casual),
            Predicate::IntentTechnical => state.intent != Some(Intent::Casual),
            Predicate::Answerable => state.verdict.as_ref().is_some_and(|v| v.answerable),
            Predicate::NotAnswerable => !state.verdict.as_ref().is_some_and(|v| v.answerable),
            Predicate::NeedsTranslation => needs_translation,
            Predicate::NativeLanguage => !needs_translation,
        }
    }
}

use NodeId::*;

/// The graph. The first matching row for a node wins.
const TRANSITIONS: &[(NodeId, Predicate, Step)] = &[
    (DetectLanguage, Predicate::Always, Step::Node(CompactMemory)),
    (CompactMemory, Predicate::Always, Step::Node(Gateway)),
    (Gateway, Predicate::IntentCasual, Step::Node(GenerateCasual)),
    (Gateway, Predicate::IntentTechnical, Step::Node(Retrieve)),
    (Retrieve, Predicate::Always, Step::Node(Guard)),
    (Guard, Predicate::Answerable, Step::Node(GenerateGrounded)),
    (Guard, Predicate::NotAnswerable, Step::Node(Fallback)),
    (GenerateGrounded, Predicate::NeedsTranslation, Step::Node(Translate)),
    (GenerateGrounded, Predicate::NativeLanguage, Step::End),
    (GenerateCasual, Predicate::NeedsTranslation, Step::Node(Translate)),
    (GenerateCasual, Predicate::NativeLanguage, Step::End),
    (Fallback, Predicate::NeedsTranslation, Step::Node(Translate)),
    (Fallback, Predicate::NativeLanguage, Step::End),
    (Translate, Predicate::Always, Step::End),
];

/// Upper bound on nodes per run; the graph is acyclic and shorter than this
const MAX_STEPS: usize = 16;

/// Resolve the edge leaving `node`
pub fn next_step(node: NodeId, state: &ConversationState, native: &str) -> Result<Step> {
    TRANSITIONS
        .iter()
        .find(|(from, predicate, _)| *from == node && predicate.holds(state, native))
        .map(|(_, _, step)| *step)
        .ok_or_else(|| Error::Invariant(format!("no transition out of {node}")))
}

/// Engine configuration
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Language replies are generated in
    pub native_language: String,
    pub generation: GenerationConfig,
    pub compaction: CompactionConfig,
    pub gateway: GatewayConfig,
    pub guard: GuardConfig,
    pub retrieval: RetrievalConfig,
    /// Bound on any single node, external calls included
    pub node_timeout: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            native_language: "pt-br".into(),
            generation: GenerationConfig::default(),
            compaction: CompactionConfig::default(),
            gateway: GatewayConfig::default(),
            guard: GuardConfig::default(),
            retrieval: RetrievalConfig::default(),
            node_timeout: Duration::from_secs(120),
        }
    }
}

/// A finished run
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub state: ConversationState,
    /// Nodes in execution order
    pub path: Vec<NodeId>,
}

impl RunOutcome {
    pub fn reply(&self) -> Option<&str> {
        self.state.final_reply()
    }
}

/// Runs conversations through the node graph. Shared across requests; holds
/// no per-run state.
pub struct Engine {
    judgment: Arc<dyn JudgmentClient>,
    retriever: Arc<dyn Retriever>,
    config: EngineConfig,
}

impl Engine {
    pub fn new(
        judgment: Arc<dyn JudgmentClient>,
        retriever: Arc<dyn Retriever>,
        config: EngineConfig,
    ) -> Self {
        Self {
            judgment,
            retriever,
            config,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn native_language(&self) -> &str {
        &self.config.native_language
    }

    /// Run `state` from the entry node to the end.
    ///
    /// Node failures take that node's fail-closed path. Only cancellation and
    /// invariant violations are returned as errors.
    pub async fn run(
        &self,
        mut state: ConversationState,
        cancel: &CancellationToken,
        events: Option<&mpsc::UnboundedSender<EngineEvent>>,
    ) -> Result<RunOutcome> {
        let emit = |event: EngineEvent| {
            if let Some(tx) = events {
                let _ = tx.send(event);
            }
        };

        let mut node = NodeId::ENTRY;
        let mut path = Vec::new();

        for _ in 0..MAX_STEPS {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
            emit(EngineEvent::NodeStarted { node });
            path.push(node);
            tracing::debug!(%node, "node started");

            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    tracing::info!(%node, "run cancelled");
                    return Err(Error::Cancelled);
                }
                result = tokio::time::timeout(self.config.node_timeout, self.execute(node, &state)) => {
                    result.unwrap_or(Err(Error::Timeout {
                        operation: "node",
                        after: self.config.node_timeout,
                    }))
                }
            };

            let failed = match result {
                Ok(update) => match state.apply(update) {
                    Ok(()) => false,
                    Err(e) => {
                        tracing::warn!(%node, error = %e, "update rejected, failing closed");
                        true
                    }
                },
                Err(e) if e.is_fatal() => {
                    tracing::error!(%node, error = %e, "run aborted");
                    return Err(e);
                }
                Err(e) => {
                    tracing::warn!(%node, error = %e, "node failed, failing closed");
                    true
                }
            };
            if failed {
                state.apply(self.fail_closed(node, &state))?;
            }

            emit(EngineEvent::NodeCompleted {
                node,
                intent: state.intent,
                failed,
            });

            match next_step(node, &state, &self.config.native_language)? {
                Step::Node(next) => node = next,
                Step::End => {
                    tracing::info!(
                        path = ?path.iter().map(NodeId::as_str).collect::<Vec<_>>(),
                        turns = state.turns.len(),
                        "run finished"
                    );
                    return Ok(RunOutcome { state, path });
                }
            }
        }
        Err(Error::Invariant(format!("run exceeded {MAX_STEPS} steps")))
    }

    async fn execute(&self, node: NodeId, state: &ConversationState) -> Result<StateUpdate> {
        let config = &self.config;
        let judgment = self.judgment.as_ref();
        let native = config.native_language.as_str();
        match node {
            DetectLanguage => language::detect_language(state, native),
            CompactMemory => compaction::compact_memory(state, &config.compaction, judgment).await,
            Gateway => {
                gateway::gateway(state, &config.generation.persona.name, &config.gateway, judgment)
                    .await
            }
            Retrieve => {
                retrieval::retrieve(state, &config.retrieval, self.retriever.as_ref()).await
            }
            Guard => guard::guard(state, &config.guard, judgment).await,
            GenerateGrounded => {
                generation::generate_grounded(state, &config.generation, native, judgment).await
            }
            GenerateCasual => {
                generation::generate_casual(state, &config.generation, native, judgment).await
            }
            Fallback => {
                generation::generate_fallback(state, &config.generation, native, judgment).await
            }
            Translate => language::translate_reply(state, native, judgment).await,
        }
    }

    /// The update a node contributes when it fails
    fn fail_closed(&self, node: NodeId, state: &ConversationState) -> StateUpdate {
        let native = self.config.native_language.as_str();
        match node {
            DetectLanguage => StateUpdate::none().replace(Fields {
                reply_language: Some(normalize_language(native)),
                ..Default::default()
            }),
            CompactMemory | Translate => StateUpdate::none(),
            Gateway => gateway::fail_closed(state),
            Retrieve => retrieval::fail_closed(),
            Guard => guard::fail_closed(),
            GenerateGrounded | GenerateCasual | Fallback => generation::fail_closed(state, native),
        }
    }
}
