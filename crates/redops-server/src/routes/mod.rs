//! API route assembly.

use axum::Router;

use crate::AppState;

pub mod agent;
pub mod conversations;
pub mod monitor;

pub fn api_router() -> Router<AppState> {
    Router::new()
        .nest("/agent", agent::router())
        .nest("/conversations", conversations::router())
        .nest("/monitor", monitor::router())
}
