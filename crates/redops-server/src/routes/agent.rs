//! Agent turn endpoint (SSE), cancellation, and task listing.
//!
//! The turn runs in a spawned task under its own cancellation context with a
//! hard deadline; the inbound request only reads the body and carries the
//! event stream. A dropped client makes stream writes fail silently while
//! the task runs to completion and persistence; only an explicit cancel (or
//! the deadline) stops work.

use std::convert::Infallible;
use std::time::Duration;

use axum::{
    extract::State,
    response::sse::{Event, KeepAlive, Sse},
    routing::{get, post},
    Json, Router,
};
use futures::stream::Stream;
use serde_json::json;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;

use redops_core::agent::{AgentError, AgentEvent, EventKind};
use redops_core::ai::types::{ChatMessage, Role};
use redops_core::storage::Message;

use crate::error::AppError;
use crate::tasks::{CancelOutcome, TaskStatus};
use crate::types::{CancelRequest, CancelResponse, ChatRequest};
use crate::AppState;

/// Hard deadline for one turn, independent of the HTTP connection.
const TASK_TIMEOUT: Duration = Duration::from_secs(30 * 60);
const SSE_CHANNEL_BUFFER: usize = 256;
const TITLE_MAX_CHARS: usize = 50;

type SseSender = mpsc::Sender<Result<Event, Infallible>>;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/stream", post(stream))
        .route("/cancel", post(cancel))
        .route("/tasks", get(tasks))
}

/// POST /api/agent/stream: run one agent turn, streaming progress as SSE.
async fn stream(
    State(state): State<AppState>,
    Json(req): Json<ChatRequest>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let (sse_tx, sse_rx) = mpsc::channel::<Result<Event, Infallible>>(SSE_CHANNEL_BUFFER);

    tokio::spawn(run_turn(state, req, sse_tx));

    Sse::new(ReceiverStream::new(sse_rx)).keep_alive(KeepAlive::default())
}

/// POST /api/agent/cancel: request cancellation of a conversation's task.
async fn cancel(
    State(state): State<AppState>,
    Json(req): Json<CancelRequest>,
) -> Result<Json<CancelResponse>, AppError> {
    match state.tasks.cancel(&req.conversation_id) {
        CancelOutcome::Cancelled | CancelOutcome::AlreadyCancelling => Ok(Json(CancelResponse {
            status: "cancelling",
            conversation_id: req.conversation_id,
            message: "Cancellation requested; the task stops after the current step.",
        })),
        CancelOutcome::NotFound => Err(AppError::NotFound(
            "no running task for this conversation".to_string(),
        )),
    }
}

/// GET /api/agent/tasks: snapshots of the running tasks.
async fn tasks(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(json!({ "tasks": state.tasks.list_active() }))
}

async fn run_turn(state: AppState, req: ChatRequest, sse_tx: SseSender) {
    // Resolve or create the conversation.
    let conversation_id = match req.conversation_id.filter(|id| !id.is_empty()) {
        Some(id) => id,
        None => match state.conversations.create_conversation(&title_of(&req.message)) {
            Ok(conv) => conv.id,
            Err(e) => {
                tracing::error!("failed to create conversation: {e:#}");
                emit(
                    &sse_tx,
                    &AgentEvent::new(
                        EventKind::Error,
                        format!("failed to create conversation: {e}"),
                    ),
                )
                .await;
                emit(&sse_tx, &AgentEvent::new(EventKind::Done, "")).await;
                return;
            }
        },
    };

    emit(
        &sse_tx,
        &AgentEvent::with_data(
            EventKind::Conversation,
            "conversation ready",
            json!({"conversationId": conversation_id}),
        ),
    )
    .await;

    // Prior turns feed the model; the inbound user message is persisted
    // before execution starts.
    let history: Vec<ChatMessage> = state
        .conversations
        .get_messages(&conversation_id)
        .unwrap_or_else(|e| {
            tracing::warn!("failed to load history: {e:#}");
            Vec::new()
        })
        .iter()
        .filter_map(row_to_chat)
        .collect();

    if let Err(e) = state
        .conversations
        .add_message(&conversation_id, "user", &req.message, &[])
    {
        tracing::error!("failed to save user message: {e:#}");
    }

    // Placeholder assistant message: progress rows attach to a stable ID
    // before the final content exists.
    let message_id = state
        .conversations
        .add_message(&conversation_id, "assistant", "Processing...", &[])
        .map(|m| m.id)
        .unwrap_or_else(|e| {
            tracing::error!("failed to create placeholder message: {e:#}");
            String::new()
        });

    let cancel_token = CancellationToken::new();
    if state
        .tasks
        .start(&conversation_id, &req.message, cancel_token.clone())
        .is_err()
    {
        emit(
            &sse_tx,
            &AgentEvent::with_data(
                EventKind::Error,
                "a task is already running for this conversation; stop it first",
                json!({"conversationId": conversation_id}),
            ),
        )
        .await;
        emit(
            &sse_tx,
            &AgentEvent::with_data(
                EventKind::Done,
                "",
                json!({"conversationId": conversation_id}),
            ),
        )
        .await;
        return;
    }

    // Forward engine events to the stream and persist them as process
    // details. Runs as its own task and is drained before any terminal
    // event, keeping the stream strictly ordered.
    let (event_tx, mut event_rx) = mpsc::unbounded_channel::<AgentEvent>();
    let forwarder = {
        let sse_tx = sse_tx.clone();
        let conversations = state.conversations.clone();
        let conversation_id = conversation_id.clone();
        let message_id = message_id.clone();
        tokio::spawn(async move {
            while let Some(event) = event_rx.recv().await {
                emit(&sse_tx, &event).await;
                if !event.kind.is_terminal() && !message_id.is_empty() {
                    if let Err(e) = conversations.add_process_detail(
                        &message_id,
                        &conversation_id,
                        event.kind.as_str(),
                        &event.message,
                        event.data.as_ref(),
                    ) {
                        tracing::warn!(kind = event.kind.as_str(), "failed to save process detail: {e:#}");
                    }
                }
            }
        })
    };

    let _ = event_tx.send(AgentEvent::new(
        EventKind::Progress,
        "analyzing your request...",
    ));

    let result = tokio::time::timeout(
        TASK_TIMEOUT,
        state
            .engine
            .run(&req.message, &history, &event_tx, &cancel_token),
    )
    .await;

    // Close the engine's event channel and drain the forwarder so terminal
    // events always come last.
    drop(event_tx);
    let _ = forwarder.await;

    let status = match result {
        Err(_elapsed) => {
            // Deadline exceeded. The engine future is gone; make sure any
            // stragglers observe cancellation too.
            cancel_token.cancel();
            let banner = "Task execution timed out and was terminated.";
            state.tasks.update_status(&conversation_id, TaskStatus::Timeout);
            finalize_message(&state, &message_id, &conversation_id, "timeout", banner);
            emit(
                &sse_tx,
                &AgentEvent::with_data(
                    EventKind::Error,
                    banner,
                    json!({"conversationId": conversation_id, "messageId": message_id}),
                ),
            )
            .await;
            TaskStatus::Timeout
        }
        Ok(Err(AgentError::Cancelled)) => {
            let banner = "The task was cancelled by the user; remaining work was stopped.";
            state
                .tasks
                .update_status(&conversation_id, TaskStatus::Cancelled);
            finalize_message(&state, &message_id, &conversation_id, "cancelled", banner);
            emit(
                &sse_tx,
                &AgentEvent::with_data(
                    EventKind::Cancelled,
                    banner,
                    json!({"conversationId": conversation_id, "messageId": message_id}),
                ),
            )
            .await;
            TaskStatus::Cancelled
        }
        Ok(Err(e)) => {
            tracing::error!("agent turn failed: {e:#}");
            let banner = format!("Execution failed: {e:#}");
            state.tasks.update_status(&conversation_id, TaskStatus::Failed);
            finalize_message(&state, &message_id, &conversation_id, "error", &banner);
            emit(
                &sse_tx,
                &AgentEvent::with_data(
                    EventKind::Error,
                    banner,
                    json!({"conversationId": conversation_id, "messageId": message_id}),
                ),
            )
            .await;
            TaskStatus::Failed
        }
        Ok(Ok(outcome)) => {
            if !message_id.is_empty() {
                if let Err(e) = state.conversations.update_message(
                    &message_id,
                    &outcome.response,
                    Some(&outcome.execution_ids),
                ) {
                    tracing::error!("failed to update assistant message: {e:#}");
                }
            }
            emit(
                &sse_tx,
                &AgentEvent::with_data(
                    EventKind::Response,
                    outcome.response.clone(),
                    json!({
                        "executedToolIds": outcome.execution_ids,
                        "conversationId": conversation_id,
                        "messageId": message_id,
                    }),
                ),
            )
            .await;
            TaskStatus::Completed
        }
    };

    emit(
        &sse_tx,
        &AgentEvent::with_data(
            EventKind::Done,
            "",
            json!({"conversationId": conversation_id}),
        ),
    )
    .await;

    state.tasks.finish(&conversation_id, status);
}

/// Write the terminal banner into the placeholder message and record the
/// matching process-detail row.
fn finalize_message(
    state: &AppState,
    message_id: &str,
    conversation_id: &str,
    event_type: &str,
    banner: &str,
) {
    if message_id.is_empty() {
        return;
    }
    if let Err(e) = state.conversations.update_message(message_id, banner, None) {
        tracing::warn!("failed to update assistant message: {e:#}");
    }
    if let Err(e) =
        state
            .conversations
            .add_process_detail(message_id, conversation_id, event_type, banner, None)
    {
        tracing::warn!("failed to save process detail: {e:#}");
    }
}

/// Send one event onto the SSE channel. A failed send means the client is
/// gone; the turn keeps going regardless.
async fn emit(tx: &SseSender, event: &AgentEvent) {
    let Ok(payload) = serde_json::to_string(event) else {
        return;
    };
    if tx.send(Ok(Event::default().data(payload))).await.is_err() {
        tracing::debug!("client disconnected, dropping stream event");
    }
}

fn row_to_chat(message: &Message) -> Option<ChatMessage> {
    if message.content.is_empty() {
        return None;
    }
    let role = match message.role.as_str() {
        "user" => Role::User,
        "assistant" => Role::Assistant,
        _ => return None,
    };
    Some(ChatMessage {
        role,
        content: message.content.clone(),
        tool_calls: Vec::new(),
        tool_call_id: String::new(),
    })
}

fn title_of(message: &str) -> String {
    if message.len() <= TITLE_MAX_CHARS {
        return message.to_string();
    }
    let mut end = TITLE_MAX_CHARS;
    while end > 0 && !message.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &message[..end])
}
