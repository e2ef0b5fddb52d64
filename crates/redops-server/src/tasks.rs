//! Per-conversation task registry.
//!
//! At most one live task per conversation. Each descriptor pairs a snapshot
//! of the task with the cancellation token for its execution context; cancel
//! propagation is exactly-once and listing never leaks the token.

use std::collections::HashMap;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio_util::sync::CancellationToken;

const MESSAGE_SNIPPET_CHARS: usize = 120;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Running,
    Cancelling,
    Completed,
    Cancelled,
    Timeout,
    Failed,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Cancelled | Self::Timeout | Self::Failed
        )
    }

    fn rank(self) -> u8 {
        match self {
            Self::Running => 0,
            Self::Cancelling => 1,
            _ => 2,
        }
    }
}

/// Read-only view of a task for listings.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskSnapshot {
    pub conversation_id: String,
    pub message: String,
    pub started_at: DateTime<Utc>,
    pub status: TaskStatus,
}

struct TaskEntry {
    snapshot: TaskSnapshot,
    cancel: CancellationToken,
}

#[derive(Debug, PartialEq, Eq)]
pub enum CancelOutcome {
    /// Cancel propagated to the task's token.
    Cancelled,
    /// Already cancelling; the token was not touched again.
    AlreadyCancelling,
    NotFound,
}

#[derive(Debug, thiserror::Error)]
pub enum TaskError {
    #[error("agent task already running for conversation")]
    AlreadyRunning,
}

/// Registry of running agent tasks, keyed by conversation ID.
#[derive(Default)]
pub struct TaskManager {
    tasks: Mutex<HashMap<String, TaskEntry>>,
}

impl TaskManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new running task. Fails when the conversation already has
    /// a live descriptor.
    pub fn start(
        &self,
        conversation_id: &str,
        message: &str,
        cancel: CancellationToken,
    ) -> Result<(), TaskError> {
        let mut tasks = self.tasks.lock().expect("task manager poisoned");
        if tasks.contains_key(conversation_id) {
            return Err(TaskError::AlreadyRunning);
        }

        tasks.insert(
            conversation_id.to_string(),
            TaskEntry {
                snapshot: TaskSnapshot {
                    conversation_id: conversation_id.to_string(),
                    message: snippet(message),
                    started_at: Utc::now(),
                    status: TaskStatus::Running,
                },
                cancel,
            },
        );
        Ok(())
    }

    /// Cancel a conversation's task. Exactly-once: a second cancel on a
    /// cancelling task is a no-op that leaves the token untouched.
    pub fn cancel(&self, conversation_id: &str) -> CancelOutcome {
        let cancel = {
            let mut tasks = self.tasks.lock().expect("task manager poisoned");
            let Some(entry) = tasks.get_mut(conversation_id) else {
                return CancelOutcome::NotFound;
            };
            if entry.snapshot.status == TaskStatus::Cancelling {
                return CancelOutcome::AlreadyCancelling;
            }
            entry.snapshot.status = TaskStatus::Cancelling;
            entry.cancel.clone()
        };

        cancel.cancel();
        CancelOutcome::Cancelled
    }

    /// Record a status change. Only forward transitions apply; regressions
    /// are dropped.
    pub fn update_status(&self, conversation_id: &str, status: TaskStatus) {
        let mut tasks = self.tasks.lock().expect("task manager poisoned");
        if let Some(entry) = tasks.get_mut(conversation_id) {
            if status.rank() >= entry.snapshot.status.rank() {
                entry.snapshot.status = status;
            }
        }
    }

    /// Remove the descriptor, recording its terminal status on the way out.
    pub fn finish(&self, conversation_id: &str, status: TaskStatus) {
        let mut tasks = self.tasks.lock().expect("task manager poisoned");
        if let Some(mut entry) = tasks.remove(conversation_id) {
            entry.snapshot.status = status;
        }
    }

    pub fn list_active(&self) -> Vec<TaskSnapshot> {
        let tasks = self.tasks.lock().expect("task manager poisoned");
        let mut snapshots: Vec<TaskSnapshot> =
            tasks.values().map(|e| e.snapshot.clone()).collect();
        snapshots.sort_by(|a, b| a.started_at.cmp(&b.started_at));
        snapshots
    }
}

fn snippet(message: &str) -> String {
    if message.len() <= MESSAGE_SNIPPET_CHARS {
        return message.to_string();
    }
    let mut end = MESSAGE_SNIPPET_CHARS;
    while end > 0 && !message.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &message[..end])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_flight_per_conversation() {
        let manager = TaskManager::new();
        manager
            .start("conv-1", "scan the target", CancellationToken::new())
            .unwrap();

        let err = manager
            .start("conv-1", "second attempt", CancellationToken::new())
            .unwrap_err();
        assert!(matches!(err, TaskError::AlreadyRunning));

        // A different conversation is unaffected.
        manager
            .start("conv-2", "other work", CancellationToken::new())
            .unwrap();
        assert_eq!(manager.list_active().len(), 2);
    }

    #[test]
    fn cancel_propagates_exactly_once() {
        let manager = TaskManager::new();
        let token = CancellationToken::new();
        manager.start("conv-1", "scan", token.clone()).unwrap();

        assert_eq!(manager.cancel("conv-1"), CancelOutcome::Cancelled);
        assert!(token.is_cancelled());

        // Second cancel is a no-op on an already-cancelling task.
        assert_eq!(manager.cancel("conv-1"), CancelOutcome::AlreadyCancelling);
        assert_eq!(manager.cancel("missing"), CancelOutcome::NotFound);
    }

    #[test]
    fn status_transitions_are_forward_only() {
        let manager = TaskManager::new();
        manager
            .start("conv-1", "scan", CancellationToken::new())
            .unwrap();

        manager.update_status("conv-1", TaskStatus::Cancelling);
        assert_eq!(manager.list_active()[0].status, TaskStatus::Cancelling);

        // Regression back to running is dropped.
        manager.update_status("conv-1", TaskStatus::Running);
        assert_eq!(manager.list_active()[0].status, TaskStatus::Cancelling);
    }

    #[test]
    fn finish_removes_the_descriptor() {
        let manager = TaskManager::new();
        manager
            .start("conv-1", "scan", CancellationToken::new())
            .unwrap();
        manager.finish("conv-1", TaskStatus::Completed);

        assert!(manager.list_active().is_empty());
        // The slot is free again.
        manager
            .start("conv-1", "new turn", CancellationToken::new())
            .unwrap();
    }

    #[test]
    fn snapshots_truncate_long_messages() {
        let manager = TaskManager::new();
        let long = "x".repeat(500);
        manager
            .start("conv-1", &long, CancellationToken::new())
            .unwrap();

        let snapshot = &manager.list_active()[0];
        assert!(snapshot.message.len() < 500);
        assert!(snapshot.message.ends_with("..."));
    }
}
