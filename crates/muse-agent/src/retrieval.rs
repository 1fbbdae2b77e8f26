//! Retrieval interface and the retrieve node

use std::{path::Path, time::Duration};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::{
    conversation::{ConversationState, Fields, StateUpdate},
    error::{Error, Result},
};

/// A retrieved passage with its provenance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snippet {
    pub text: String,
    /// Source identifier (file name only)
    pub source: String,
}

impl Snippet {
    pub fn new(text: impl Into<String>, source: impl Into<String>) -> Self {
        let source: String = source.into();
        Self {
            text: text.into(),
            source: source_name(&source),
        }
    }

    /// Rendered for prompts with its source header
    pub fn render(&self) -> String {
        format!("--- SOURCE: {} ---\n{}", self.source, self.text)
    }
}

/// Reduce a path-like source to its file name
pub fn source_name(source: &str) -> String {
    Path::new(source)
        .file_name()
        .and_then(|name| name.to_str())
        .unwrap_or(source)
        .to_string()
}

/// Query in, ranked snippets out. An empty list is a normal answer.
#[async_trait]
pub trait Retriever: Send + Sync {
    async fn retrieve(&self, query: &str, k: usize) -> Result<Vec<Snippet>>;
}

/// Retrieve node tuning
#[derive(Debug, Clone)]
pub struct RetrievalConfig {
    /// Snippets requested per query
    pub k: usize,
    /// Bound on one retrieval call
    pub timeout: Duration,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            k: 4,
            timeout: Duration::from_secs(10),
        }
    }
}

/// Retrieve node: fetch context for the rewritten query
pub async fn retrieve(
    state: &ConversationState,
    config: &RetrievalConfig,
    retriever: &dyn Retriever,
) -> Result<StateUpdate> {
    let query = state
        .rewritten_query
        .as_deref()
        .or_else(|| state.latest_user_message())
        .ok_or_else(|| Error::Invariant("retrieve ran without a query".into()))?;

    let snippets = tokio::time::timeout(config.timeout, retriever.retrieve(query, config.k))
        .await
        .map_err(|_| Error::Timeout {
            operation: "retrieval",
            after: config.timeout,
        })??;

    let sources: Vec<&str> = snippets.iter().map(|s| s.source.as_str()).collect();
    tracing::info!(count = snippets.len(), ?sources, "retrieved context");

    Ok(StateUpdate::none().replace(Fields {
        retrieved_context: Some(snippets),
        ..Default::default()
    }))
}

/// Update applied when retrieval fails: no context
pub fn fail_closed() -> StateUpdate {
    StateUpdate::none().replace(Fields {
        retrieved_context: Some(Vec::new()),
        ..Default::default()
    })
}

#[cfg(test)]
pub(crate) mod mock {
    use parking_lot::Mutex;

    use super::*;

    /// Returns fixed snippets and records every query
    #[derive(Default)]
    pub struct StaticRetriever {
        pub snippets: Vec<Snippet>,
        pub queries: Mutex<Vec<(String, usize)>>,
        pub fail: bool,
    }

    impl StaticRetriever {
        pub fn with(snippets: Vec<Snippet>) -> Self {
            Self {
                snippets,
                ..Default::default()
            }
        }

        pub fn failing() -> Self {
            Self {
                fail: true,
                ..Default::default()
            }
        }

        pub fn queries(&self) -> Vec<String> {
            self.queries.lock().iter().map(|(q, _)| q.clone()).collect()
        }
    }

    #[async_trait]
    impl Retriever for StaticRetriever {
        async fn retrieve(&self, query: &str, k: usize) -> Result<Vec<Snippet>> {
            self.queries.lock().push((query.to_string(), k));
            if self.fail {
                return Err(Error::Retrieval("index unavailable".into()));
            }
            Ok(self.snippets.iter().take(k).cloned().collect())
        }
    }
}
