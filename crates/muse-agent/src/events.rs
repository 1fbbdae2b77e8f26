//! Engine and stream event types

use serde::{Deserialize, Serialize};

use crate::{engine::NodeId, gateway::Intent, quota::QuotaStatus};

/// Events emitted by the engine while a run progresses
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EngineEvent {
    /// A node is about to run
    NodeStarted { node: NodeId },

    /// A node finished and its update was merged
    NodeCompleted {
        node: NodeId,
        /// Intent after the node ran, when known
        intent: Option<Intent>,
        /// The node failed and its fail-closed update was applied instead
        failed: bool,
    },
}

/// Events delivered to the caller over the progress stream
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    /// User-facing progress label
    Status { message: String },

    /// The final reply
    Result {
        response: String,
        usage: QuotaStatus,
        /// Long-term memory summary, echoed so the caller can send it back
        #[serde(default, skip_serializing_if = "Option::is_none")]
        memory: Option<String>,
    },

    /// The run could not produce a reply
    Error { detail: String },
}

impl StreamEvent {
    pub fn status(message: impl Into<String>) -> Self {
        StreamEvent::Status {
            message: message.into(),
        }
    }

    pub fn error(detail: impl Into<String>) -> Self {
        StreamEvent::Error {
            detail: detail.into(),
        }
    }

    /// Wire event name
    pub fn name(&self) -> &'static str {
        match self {
            StreamEvent::Status { .. } => "status",
            StreamEvent::Result { .. } => "result",
            StreamEvent::Error { .. } => "error",
        }
    }

    /// Wire payload, without the `type` tag
    pub fn payload(&self) -> serde_json::Value {
        match self {
            StreamEvent::Status { message } => serde_json::json!({ "message": message }),
            StreamEvent::Result {
                response,
                usage,
                memory,
            } => {
                let mut value = serde_json::json!({ "response": response, "usage": usage });
                if let Some(memory) = memory {
                    value["memory"] = serde_json::Value::String(memory.clone());
                }
                value
            }
            StreamEvent::Error { detail } => serde_json::json!({ "detail": detail }),
        }
    }

    /// Check if this is a terminal event
    pub fn is_terminal(&self) -> bool {
        matches!(self, StreamEvent::Result { .. } | StreamEvent::Error { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_result_payload_shape() {
        let event = StreamEvent::Result {
            response: "Opa!".into(),
            usage: QuotaStatus {
                current: 3,
                limit: 100,
                remaining: 97,
            },
            memory: None,
        };
        assert_eq!(event.name(), "result");
        assert!(event.is_terminal());
        assert_eq!(
            event.payload(),
            serde_json::json!({
                "response": "Opa!",
                "usage": {"current": 3, "limit": 100, "remaining": 97}
            })
        );
    }

    #[test]
    fn test_status_is_not_terminal() {
        let event = StreamEvent::status("Pensando...");
        assert_eq!(event.name(), "status");
        assert!(!event.is_terminal());
        assert_eq!(event.payload(), serde_json::json!({"message": "Pensando..."}));
    }

    #[test]
    fn test_engine_event_serializes_tagged() {
        let event = EngineEvent::NodeStarted {
            node: NodeId::Retrieve,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json, serde_json::json!({"type": "node_started", "node": "retrieve"}));
    }
}
