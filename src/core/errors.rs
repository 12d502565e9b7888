use axum::{http::StatusCode, response::IntoResponse, Json};
use serde_json::json;
use thiserror::Error;

use crate::pipeline::{EmbeddingError, PipelineError};

/// Error returned by the HTTP front end.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("bad request: {0}")]
    BadRequest(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error(transparent)]
    Pipeline(#[from] PipelineError),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Pipeline(err) => pipeline_status(err),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            ApiError::BadRequest(_) => "invalid_argument",
            ApiError::NotFound(_) => "not_found",
            ApiError::Pipeline(err) => err.kind(),
        }
    }

    pub fn retryable(&self) -> bool {
        match self {
            ApiError::Pipeline(err) => err.is_retryable(),
            _ => false,
        }
    }
}

fn pipeline_status(err: &PipelineError) -> StatusCode {
    match err {
        PipelineError::InvalidArgument(_) => StatusCode::BAD_REQUEST,
        PipelineError::Embedding(EmbeddingError::Provider(_)) => StatusCode::BAD_GATEWAY,
        PipelineError::Embedding(_) => StatusCode::BAD_REQUEST,
        PipelineError::Retrieval { cause } => match cause.as_ref() {
            PipelineError::Embedding(EmbeddingError::Provider(_)) => StatusCode::BAD_GATEWAY,
            PipelineError::Embedding(_) => StatusCode::BAD_REQUEST,
            other => pipeline_status(other),
        },
        PipelineError::CorruptHistory { .. } => StatusCode::UNPROCESSABLE_ENTITY,
        PipelineError::Generation(gen) if gen.is_transient() => StatusCode::SERVICE_UNAVAILABLE,
        PipelineError::Generation(_) => StatusCode::BAD_GATEWAY,
        PipelineError::Storage(_) => StatusCode::SERVICE_UNAVAILABLE,
        PipelineError::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
        PipelineError::Cache(_) | PipelineError::Config(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(kind = self.kind(), error = %self, "Request failed");
        }

        let body = Json(json!({
            "error": self.to_string(),
            "kind": self.kind(),
            "retryable": self.retryable(),
        }));
        (status, body).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::GenerationError;

    #[test]
    fn statuses_follow_the_error_kind() {
        let cases = [
            (PipelineError::InvalidArgument("k".into()), StatusCode::BAD_REQUEST),
            (
                PipelineError::retrieval(EmbeddingError::EmptyInput.into()),
                StatusCode::BAD_REQUEST,
            ),
            (
                PipelineError::corrupt_history("c1", "bad role"),
                StatusCode::UNPROCESSABLE_ENTITY,
            ),
            (
                GenerationError::transient("429").into(),
                StatusCode::SERVICE_UNAVAILABLE,
            ),
            (GenerationError::permanent("400").into(), StatusCode::BAD_GATEWAY),
            (PipelineError::Timeout { limit_ms: 5 }, StatusCode::GATEWAY_TIMEOUT),
        ];

        for (err, status) in cases {
            assert_eq!(ApiError::from(err).status(), status);
        }
    }

    #[test]
    fn retryable_flag_comes_from_the_pipeline_error() {
        assert!(ApiError::from(PipelineError::Timeout { limit_ms: 5 }).retryable());
        assert!(!ApiError::BadRequest("x".into()).retryable());
    }
}
