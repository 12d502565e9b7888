use thiserror::Error;

#[derive(Debug, Error)]
pub enum InitializationError {
    #[error("Failed to load configuration: {0}")]
    Config(#[source] anyhow::Error),

    #[error("Failed to initialize conversation store: {0}")]
    History(#[source] anyhow::Error),

    #[error("Failed to initialize embedder: {0}")]
    Embedder(#[source] anyhow::Error),

    #[error("Failed to load clinic documents: {0}")]
    Documents(#[source] anyhow::Error),

    #[error("Failed to initialize generator: {0}")]
    Generator(#[source] anyhow::Error),
}
