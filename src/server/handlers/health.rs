use std::sync::Arc;

use axum::extract::State;
use axum::response::IntoResponse;
use axum::Json;
use serde_json::json;

use crate::state::ChatbotServices;

pub async fn health(State(state): State<Arc<ChatbotServices>>) -> impl IntoResponse {
    let generator_reachable = state.generator.health_check().await;
    Json(json!({
        "status": if generator_reachable { "ok" } else { "degraded" },
        "documents": state.index.len(),
        "categories": state.index.categories(),
        "cached_answers": state.cache.len(),
        "embedder": state.embedder.name(),
        "generator": state.generator.name(),
        "generator_reachable": generator_reachable,
    }))
}
