//! Conversation CRUD.

use axum::{
    extract::{Path, State},
    routing::{get, post},
    Json, Router,
};
use serde_json::json;

use crate::error::AppError;
use crate::types::CreateConversationRequest;
use crate::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", post(create).get(list))
        .route("/:id", get(get_one).delete(remove))
}

async fn create(
    State(state): State<AppState>,
    Json(req): Json<CreateConversationRequest>,
) -> Result<Json<serde_json::Value>, AppError> {
    if req.title.is_empty() {
        return Err(AppError::BadRequest("title must not be empty".to_string()));
    }
    let conversation = state.conversations.create_conversation(&req.title)?;
    Ok(Json(json!({ "conversation": conversation })))
}

async fn list(State(state): State<AppState>) -> Result<Json<serde_json::Value>, AppError> {
    let conversations = state.conversations.list_conversations()?;
    Ok(Json(json!({ "conversations": conversations })))
}

async fn get_one(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, AppError> {
    let conversation = state
        .conversations
        .get_conversation(&id)?
        .ok_or_else(|| AppError::NotFound(format!("conversation {id} not found")))?;
    let messages = state.conversations.get_messages(&id)?;
    Ok(Json(json!({
        "conversation": conversation,
        "messages": messages,
    })))
}

async fn remove(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, AppError> {
    if !state.conversations.delete_conversation(&id)? {
        return Err(AppError::NotFound(format!("conversation {id} not found")));
    }
    Ok(Json(json!({ "deleted": id })))
}
