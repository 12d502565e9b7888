use std::fmt;

use serde::Serialize;

/// Stages of one pipeline run. `Done` and `Failed` are terminal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineState {
    Received,
    Embedding,
    Retrieving,
    ComposingPrompt,
    CacheCheck,
    CacheHit,
    Generating,
    Persisting,
    Responding,
    Done,
    Failed(String),
}

impl PipelineState {
    pub fn name(&self) -> &'static str {
        match self {
            PipelineState::Received => "received",
            PipelineState::Embedding => "embedding",
            PipelineState::Retrieving => "retrieving",
            PipelineState::ComposingPrompt => "composing_prompt",
            PipelineState::CacheCheck => "cache_check",
            PipelineState::CacheHit => "cache_hit",
            PipelineState::Generating => "generating",
            PipelineState::Persisting => "persisting",
            PipelineState::Responding => "responding",
            PipelineState::Done => "done",
            PipelineState::Failed(_) => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, PipelineState::Done | PipelineState::Failed(_))
    }

    pub fn can_transition_to(&self, next: &PipelineState) -> bool {
        use PipelineState::*;

        if let Failed(_) = next {
            return !self.is_terminal();
        }
        matches!(
            (self, next),
            (Received, Embedding)
                | (Embedding, Retrieving)
                | (Retrieving, ComposingPrompt)
                | (ComposingPrompt, CacheCheck)
                | (CacheCheck, CacheHit)
                | (CacheCheck, Generating)
                | (CacheHit, Responding)
                | (Generating, Persisting)
                | (Persisting, Responding)
                | (Responding, Done)
        )
    }
}

impl fmt::Display for PipelineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PipelineState::Failed(reason) => write!(f, "failed({})", reason),
            other => f.write_str(other.name()),
        }
    }
}

/// Records the states one run passes through.
#[derive(Debug)]
pub struct StateTrace {
    conversation_id: String,
    states: Vec<PipelineState>,
}

impl StateTrace {
    pub fn new(conversation_id: &str) -> Self {
        tracing::debug!(conversation_id, state = "received", "Pipeline state");
        Self {
            conversation_id: conversation_id.to_string(),
            states: vec![PipelineState::Received],
        }
    }

    pub fn current(&self) -> &PipelineState {
        // `states` always starts with `Received`.
        self.states.last().unwrap_or(&PipelineState::Received)
    }

    pub fn advance(&mut self, next: PipelineState) {
        if !self.current().can_transition_to(&next) {
            tracing::error!(
                conversation_id = %self.conversation_id,
                from = %self.current(),
                to = %next,
                "Illegal pipeline transition"
            );
            debug_assert!(false, "illegal transition {} -> {}", self.current(), next);
        }
        tracing::debug!(
            conversation_id = %self.conversation_id,
            state = %next,
            "Pipeline state"
        );
        self.states.push(next);
    }

    pub fn fail(&mut self, reason: impl Into<String>) {
        if !self.current().is_terminal() {
            self.advance(PipelineState::Failed(reason.into()));
        }
    }

    pub fn into_states(self) -> Vec<PipelineState> {
        self.states
    }
}
