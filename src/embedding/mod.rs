//! Text embedding providers.
//!
//! Every provider produces vectors of one fixed dimension for the lifetime of
//! the process. Inputs are whitespace-normalized first; inputs longer than the
//! model limit are either rejected or truncated with `Embedding::truncated`
//! set, never cut silently.

mod hashing;
mod http;

use async_trait::async_trait;

use crate::pipeline::EmbeddingError;

pub use hashing::HashingEmbedder;
pub use http::HttpEmbedder;

#[derive(Debug, Clone, PartialEq)]
pub struct Embedding {
    pub vector: Vec<f32>,
    /// Set when the input exceeded `max_input_chars` and was shortened.
    pub truncated: bool,
}

/// How over-long inputs are handled before they reach the model.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InputPolicy {
    pub max_input_chars: usize,
    pub truncate_long_inputs: bool,
}

impl Default for InputPolicy {
    fn default() -> Self {
        Self {
            max_input_chars: 2048,
            truncate_long_inputs: false,
        }
    }
}

#[async_trait]
pub trait Embedder: Send + Sync {
    /// Provider name for logging (e.g. "hashing", "http").
    fn name(&self) -> &str;

    /// Dimension of every vector this provider returns.
    fn dimension(&self) -> usize;

    /// Load the model or check the endpoint. Called once at startup.
    async fn init(&self) -> Result<(), EmbeddingError> {
        Ok(())
    }

    /// Release resources. Called once at shutdown.
    async fn shutdown(&self) {}

    async fn embed(&self, text: &str) -> Result<Embedding, EmbeddingError>;
}

/// Collapses whitespace runs and applies the length policy.
///
/// Returns the text to embed and whether it was truncated.
pub fn prepare_input(text: &str, policy: &InputPolicy) -> Result<(String, bool), EmbeddingError> {
    let normalized = text.split_whitespace().collect::<Vec<_>>().join(" ");
    if normalized.is_empty() {
        return Err(EmbeddingError::EmptyInput);
    }

    let length = normalized.chars().count();
    if length <= policy.max_input_chars {
        return Ok((normalized, false));
    }

    if !policy.truncate_long_inputs {
        return Err(EmbeddingError::InputTooLong {
            length,
            limit: policy.max_input_chars,
        });
    }

    let truncated: String = normalized.chars().take(policy.max_input_chars).collect();
    tracing::warn!(
        length,
        limit = policy.max_input_chars,
        "Embedding input truncated"
    );
    Ok((truncated, true))
}
