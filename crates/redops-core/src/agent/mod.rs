//! Agent execution engine: the tool-calling loop and its event protocol.

mod engine;
mod events;

pub use engine::{AgentEngine, EngineSettings, TurnOutcome};
pub use events::{AgentEvent, EventKind, EventSender};

/// Terminal failure modes of one agent turn.
///
/// The caller maps these onto distinct stream events and task statuses;
/// timeouts are enforced around the turn future and are not represented here.
#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error("agent task cancelled by user")]
    Cancelled,
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl AgentError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}
