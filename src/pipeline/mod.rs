mod error;
mod orchestrator;
mod retry;
mod state;

pub use error::{CacheError, EmbeddingError, GenerationError, GenerationErrorKind, PipelineError};
pub use orchestrator::{ChatPipeline, PipelineOptions, PipelineOutcome, PipelineWarning};
pub use retry::RetryPolicy;
pub use state::{PipelineState, StateTrace};
