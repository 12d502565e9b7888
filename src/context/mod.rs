//! Prompt composition for the clinic assistant.

mod composer;

pub use composer::{extract_answer, PromptComposer, DEFAULT_SYSTEM_PROMPT, RESPONSE_MARKER};
