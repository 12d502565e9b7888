use std::fmt;

use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum GenerationErrorKind {
    /// Rate limits, timeouts, upstream 5xx. Worth retrying.
    Transient,
    /// Invalid request, content policy. Retrying cannot help.
    Permanent,
}

impl fmt::Display for GenerationErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GenerationErrorKind::Transient => f.write_str("transient"),
            GenerationErrorKind::Permanent => f.write_str("permanent"),
        }
    }
}

#[derive(Debug, Clone, Error)]
#[error("{kind} generation failure: {message}")]
pub struct GenerationError {
    pub kind: GenerationErrorKind,
    pub message: String,
}

impl GenerationError {
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            kind: GenerationErrorKind::Transient,
            message: message.into(),
        }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            kind: GenerationErrorKind::Permanent,
            message: message.into(),
        }
    }

    pub fn is_transient(&self) -> bool {
        self.kind == GenerationErrorKind::Transient
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum EmbeddingError {
    #[error("input is empty after normalization")]
    EmptyInput,

    #[error("input has {length} characters, exceeding the limit of {limit}")]
    InputTooLong { length: usize, limit: usize },

    #[error("embedding dimension mismatch: expected {expected}, got {got}")]
    DimensionMismatch { expected: usize, got: usize },

    #[error("embedding provider failed: {0}")]
    Provider(String),
}

/// Response cache failure. Logged and degraded around, never shown to callers.
#[derive(Debug, Clone, Error)]
#[error("cache operation failed: {0}")]
pub struct CacheError(pub String);

impl CacheError {
    pub fn backend<E: fmt::Display>(err: E) -> Self {
        CacheError(err.to_string())
    }
}

#[derive(Debug, Clone, Error)]
pub enum PipelineError {
    #[error("embedding failed: {0}")]
    Embedding(#[from] EmbeddingError),

    #[error("retrieval failed: {cause}")]
    Retrieval {
        #[source]
        cause: Box<PipelineError>,
    },

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error(transparent)]
    Generation(#[from] GenerationError),

    #[error("conversation history for '{conversation_id}' is corrupt: {reason}")]
    CorruptHistory {
        conversation_id: String,
        reason: String,
    },

    #[error("request exceeded the {limit_ms} ms latency budget")]
    Timeout { limit_ms: u64 },

    #[error(transparent)]
    Cache(#[from] CacheError),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("configuration error: {0}")]
    Config(String),
}

impl PipelineError {
    pub fn retrieval(cause: PipelineError) -> Self {
        PipelineError::Retrieval {
            cause: Box::new(cause),
        }
    }

    pub fn storage<E: fmt::Display>(err: E) -> Self {
        PipelineError::Storage(err.to_string())
    }

    pub fn corrupt_history(conversation_id: &str, reason: impl Into<String>) -> Self {
        PipelineError::CorruptHistory {
            conversation_id: conversation_id.to_string(),
            reason: reason.into(),
        }
    }

    /// Stable label reported to callers alongside the message.
    pub fn kind(&self) -> &'static str {
        match self {
            PipelineError::Embedding(_) => "embedding",
            PipelineError::Retrieval { .. } => "retrieval",
            PipelineError::InvalidArgument(_) => "invalid_argument",
            PipelineError::Generation(err) => match err.kind {
                GenerationErrorKind::Transient => "generation_transient",
                GenerationErrorKind::Permanent => "generation_permanent",
            },
            PipelineError::CorruptHistory { .. } => "corrupt_history",
            PipelineError::Timeout { .. } => "timeout",
            PipelineError::Cache(_) => "cache",
            PipelineError::Storage(_) => "storage",
            PipelineError::Config(_) => "config",
        }
    }

    /// Whether the caller may sensibly resend the same request.
    pub fn is_retryable(&self) -> bool {
        match self {
            PipelineError::Generation(err) => err.is_transient(),
            PipelineError::Timeout { .. } | PipelineError::Storage(_) => true,
            PipelineError::Retrieval { cause } => cause.is_retryable(),
            _ => false,
        }
    }
}
