use std::sync::Arc;

use axum::extract::State;
use axum::response::IntoResponse;
use axum::Json;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::core::errors::ApiError;
use crate::pipeline::PipelineWarning;
use crate::state::ChatbotServices;

#[derive(Debug, Deserialize)]
pub struct ChatRequest {
    pub conversation_id: Option<String>,
    pub query: String,
}

#[derive(Debug, Serialize)]
pub struct ChatResponse {
    pub conversation_id: String,
    pub answer: String,
    pub cache_hit: bool,
    pub warnings: Vec<PipelineWarning>,
}

pub async fn chat(
    State(state): State<Arc<ChatbotServices>>,
    Json(payload): Json<ChatRequest>,
) -> Result<impl IntoResponse, ApiError> {
    if payload.query.trim().is_empty() {
        return Err(ApiError::BadRequest("query must not be empty".to_string()));
    }

    let conversation_id = payload
        .conversation_id
        .filter(|id| !id.trim().is_empty())
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    let outcome = state.pipeline.run(&conversation_id, &payload.query).await?;

    Ok(Json(ChatResponse {
        conversation_id: outcome.conversation_id.clone(),
        cache_hit: outcome.cache_hit(),
        answer: outcome.answer,
        warnings: outcome.warnings,
    }))
}
