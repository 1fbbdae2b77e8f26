//! muse-ai: language-model provider layer
//!
//! This crate provides the wire types and the streaming chat provider used by
//! the muse engine to reach OpenAI-compatible completion endpoints (OpenAI,
//! Groq, Google's compatibility endpoint, local Ollama).

pub mod error;
pub mod models;
pub mod providers;
pub mod stream;
pub mod types;

pub use error::{Error, Result};
pub use stream::MessageEventStream;
pub use types::*;
