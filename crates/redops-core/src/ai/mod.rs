//! Model-facing layer: wire types, schema translation, and the retrying
//! chat-completion client.

pub mod client;
pub mod schema;
pub mod types;

pub use client::{LlmClient, LlmConfig};
pub use types::{ChatMessage, ChatResponse, Role, ToolArguments, ToolCall, ToolSpec};
