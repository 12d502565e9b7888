//! Retrieval-augmented chat pipeline for a dental clinic assistant.
//!
//! A question flows through embedding, retrieval over the clinic documents,
//! prompt composition with recent conversation turns, a fingerprinted
//! response cache and finally the generator. Answers and turns are persisted
//! to SQLite.

pub mod cache;
pub mod context;
pub mod core;
pub mod embedding;
pub mod history;
pub mod llm;
pub mod pipeline;
pub mod rag;
pub mod server;
pub mod state;
pub mod vector_math;

pub use pipeline::{ChatPipeline, PipelineError, PipelineOutcome};
pub use state::ChatbotServices;
