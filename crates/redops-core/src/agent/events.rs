//! Stream event protocol for a single agent turn.
//!
//! The kind alphabet is closed; transports (SSE, persistence replay) map
//! these events without interpreting them.

use serde::Serialize;
use serde_json::Value;
use tokio::sync::mpsc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Conversation,
    Progress,
    Iteration,
    Thinking,
    ToolCall,
    ToolResult,
    Response,
    Cancelled,
    Error,
    Done,
}

impl EventKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Conversation => "conversation",
            Self::Progress => "progress",
            Self::Iteration => "iteration",
            Self::Thinking => "thinking",
            Self::ToolCall => "tool_call",
            Self::ToolResult => "tool_result",
            Self::Response => "response",
            Self::Cancelled => "cancelled",
            Self::Error => "error",
            Self::Done => "done",
        }
    }

    /// Terminal kinds close the stream; exactly one of response/cancelled/
    /// error precedes the final done.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Response | Self::Cancelled | Self::Error | Self::Done)
    }
}

/// One event on the turn's stream.
#[derive(Debug, Clone, Serialize)]
pub struct AgentEvent {
    #[serde(rename = "type")]
    pub kind: EventKind,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl AgentEvent {
    pub fn new(kind: EventKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            data: None,
        }
    }

    pub fn with_data(kind: EventKind, message: impl Into<String>, data: Value) -> Self {
        Self {
            kind,
            message: message.into(),
            data: Some(data),
        }
    }
}

/// Progress sink the engine writes into. Send failures mean the consumer is
/// gone; the engine keeps working regardless.
pub type EventSender = mpsc::UnboundedSender<AgentEvent>;
