use std::sync::Arc;

use axum::extract::{Path, State};
use axum::response::IntoResponse;
use axum::Json;
use serde_json::json;

use crate::core::errors::ApiError;
use crate::state::ChatbotServices;

pub async fn get_history(
    State(state): State<Arc<ChatbotServices>>,
    Path(conversation_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let turns = state.history.all(&conversation_id).await?;
    if turns.is_empty() {
        return Err(ApiError::NotFound(format!(
            "conversation '{}' has no turns",
            conversation_id
        )));
    }
    Ok(Json(json!({
        "conversation_id": conversation_id,
        "turns": turns,
    })))
}
