//! muse-agent: Conversational orchestration engine
//!
//! This crate provides the node graph that answers one chat turn: language
//! detection, memory compaction, the gateway, retrieval, the answerability
//! guard, generation and translation. It also carries the progress streamer
//! and the daily quota gate shared by every request.

pub mod compaction;
pub mod conversation;
pub mod corpus;
pub mod engine;
pub mod error;
pub mod events;
pub mod gateway;
pub mod generation;
pub mod guard;
pub mod handle;
pub mod judgment;
pub mod language;
pub mod progress;
pub mod quota;
pub mod request;
pub mod retrieval;
pub mod turn;

pub use compaction::CompactionConfig;
pub use conversation::{ConversationState, StateUpdate};
pub use corpus::{ChunkConfig, CorpusRetriever};
pub use engine::{Engine, EngineConfig, NodeId, RunOutcome};
pub use error::{Error, Result};
pub use events::{EngineEvent, StreamEvent};
pub use gateway::{GatewayConfig, Intent};
pub use generation::{GenerationConfig, Persona};
pub use guard::{GuardConfig, Verdict, VerdictReason};
pub use handle::RunHandle;
pub use judgment::{JudgmentClient, JudgmentRequest, ProviderJudgment, RetryConfig};
pub use progress::ProgressStreamer;
pub use quota::{
    Clock, JsonFileQuotaStore, ManualClock, QuotaGate, QuotaStatus, QuotaStore, SystemClock,
};
pub use request::{ChatRequest, HistoryEntry};
pub use retrieval::{RetrievalConfig, Retriever, Snippet};
pub use turn::{Role, Turn};
