//! Error types for muse-agent

use thiserror::Error;

/// Result type alias using muse-agent Error
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while running the pipeline
#[derive(Error, Debug)]
pub enum Error {
    /// An error from the AI provider layer
    #[error(transparent)]
    Ai(#[from] muse_ai::Error),

    /// A judgment call failed for a reason other than the provider
    #[error("Judgment error: {0}")]
    Judgment(String),

    /// A structured judgment came back unparsable or off-schema
    #[error("Malformed judgment: {0}")]
    MalformedJudgment(String),

    /// The retrieval backend failed
    #[error("Retrieval error: {0}")]
    Retrieval(String),

    /// An external call exceeded its bound
    #[error("{operation} timed out after {after:?}")]
    Timeout {
        operation: &'static str,
        after: std::time::Duration,
    },

    /// The caller went away
    #[error("Run cancelled")]
    Cancelled,

    /// The engine reached a state its topology should make impossible
    #[error("Pipeline invariant violated: {0}")]
    Invariant(String),

    /// Quota persistence failed
    #[error("Quota store error: {0}")]
    QuotaStore(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Errors that must surface to the caller instead of taking a node's
    /// fail-closed path.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::Cancelled | Error::Invariant(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_cancel_and_invariant_are_fatal() {
        assert!(Error::Cancelled.is_fatal());
        assert!(Error::Invariant("no verdict".into()).is_fatal());
        assert!(!Error::Retrieval("down".into()).is_fatal());
        assert!(!Error::MalformedJudgment("not json".into()).is_fatal());
        assert!(
            !Error::Timeout {
                operation: "judgment",
                after: std::time::Duration::from_secs(1)
            }
            .is_fatal()
        );
    }
}
