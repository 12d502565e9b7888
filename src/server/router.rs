use std::sync::Arc;

use axum::routing::{get, post};
use axum::Router;
use tower_http::trace::TraceLayer;

use crate::server::handlers::{chat, health, history};
use crate::state::ChatbotServices;

/// Creates the application router.
///
/// - `GET /health`: liveness plus index and cache sizes
/// - `POST /chat`: one pipeline run per request
/// - `GET /history/:conversation_id`: stored turns, oldest first
pub fn router(state: Arc<ChatbotServices>) -> Router {
    Router::new()
        .route("/health", get(health::health))
        .route("/chat", post(chat::chat))
        .route("/history/:conversation_id", get(history::get_history))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
