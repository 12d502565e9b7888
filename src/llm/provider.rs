use async_trait::async_trait;

use super::types::GenerationRequest;
use crate::pipeline::GenerationError;

#[async_trait]
pub trait Generator: Send + Sync {
    /// provider name for logging (e.g. "openai_compatible")
    fn name(&self) -> &str;

    /// load the model or check the endpoint, called once at startup
    async fn init(&self) -> Result<(), GenerationError> {
        Ok(())
    }

    /// release resources, called once at shutdown
    async fn shutdown(&self) {}

    /// whether the backend is currently reachable
    async fn health_check(&self) -> bool {
        true
    }

    /// one completion for the composed prompt
    async fn generate(&self, request: &GenerationRequest) -> Result<String, GenerationError>;
}
