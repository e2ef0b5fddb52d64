//! Persistence layer
//!
//! - File-backed result store for oversized tool output
//! - SQLite storage for conversations, messages, and process details

mod conversations;
mod database;
mod results;

pub use conversations::{Conversation, ConversationStore, Message, ProcessDetail};
pub use database::Database;
pub use results::{FileResultStore, ResultMetadata, ResultPage};
