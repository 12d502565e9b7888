//! The chat request pipeline.
//!
//! One `run` call takes a query through embedding, retrieval, prompt
//! composition, the response cache and (on a miss) generation with retries,
//! then persists the exchange. Every state change is recorded in a
//! `StateTrace` and logged at debug level.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;

use super::error::{GenerationError, PipelineError};
use super::retry::RetryPolicy;
use super::state::{PipelineState, StateTrace};
use crate::cache::{CacheKey, CacheSource, ResponseCache};
use crate::context::{extract_answer, PromptComposer};
use crate::core::config::ChatbotConfig;
use crate::history::ConversationStore;
use crate::llm::{GenerationRequest, Generator};
use crate::rag::Retriever;

// ---------------------------------------------------------------------------
// Options and outcome
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct PipelineOptions {
    pub top_k: usize,
    pub max_total_latency: Duration,
    pub retry: RetryPolicy,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            top_k: 10,
            max_total_latency: Duration::from_secs(120),
            retry: RetryPolicy::default(),
        }
    }
}

impl PipelineOptions {
    pub fn from_config(config: &ChatbotConfig) -> Self {
        let generation = &config.generation;
        Self {
            top_k: config.retrieval.top_k,
            max_total_latency: Duration::from_millis(config.pipeline.max_total_latency_ms),
            retry: RetryPolicy {
                max_attempts: generation.max_attempts,
                base_delay: Duration::from_millis(generation.backoff_base_ms),
                max_delay: Duration::from_millis(generation.backoff_max_ms),
                attempt_timeout: Duration::from_millis(generation.timeout_ms),
            },
        }
    }
}

/// Recoverable problems that did not stop the answer from being returned.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PipelineWarning {
    /// The query was longer than the embedder accepts and was shortened.
    QueryTruncated,
    /// The response cache failed; the answer was generated directly.
    CacheDegraded { message: String },
    /// The answer is valid but the exchange was not saved to history.
    PersistenceFailed { message: String },
}

#[derive(Debug, Clone)]
pub struct PipelineOutcome {
    pub conversation_id: String,
    pub answer: String,
    pub source: CacheSource,
    /// Generator calls made by this run. Zero when served from cache.
    pub generation_attempts: u32,
    pub warnings: Vec<PipelineWarning>,
    pub states: Vec<PipelineState>,
}

impl PipelineOutcome {
    pub fn cache_hit(&self) -> bool {
        self.source != CacheSource::Generated
    }
}

// ---------------------------------------------------------------------------
// ChatPipeline
// ---------------------------------------------------------------------------

pub struct ChatPipeline {
    retriever: Retriever,
    history: Arc<ConversationStore>,
    cache: Arc<ResponseCache>,
    composer: PromptComposer,
    generator: Arc<dyn Generator>,
    options: PipelineOptions,
}

/// Result of the part of a run that is bounded by the latency budget.
struct Answered {
    answer: String,
    source: CacheSource,
    attempts: u32,
}

impl ChatPipeline {
    pub fn new(
        retriever: Retriever,
        history: Arc<ConversationStore>,
        cache: Arc<ResponseCache>,
        composer: PromptComposer,
        generator: Arc<dyn Generator>,
        options: PipelineOptions,
    ) -> Self {
        Self {
            retriever,
            history,
            cache,
            composer,
            generator,
            options,
        }
    }

    pub fn history(&self) -> &Arc<ConversationStore> {
        &self.history
    }

    pub fn cache(&self) -> &Arc<ResponseCache> {
        &self.cache
    }

    pub fn options(&self) -> &PipelineOptions {
        &self.options
    }

    pub async fn run(
        &self,
        conversation_id: &str,
        query: &str,
    ) -> Result<PipelineOutcome, PipelineError> {
        let mut trace = StateTrace::new(conversation_id);
        let mut warnings = Vec::new();

        if conversation_id.trim().is_empty() {
            let err = PipelineError::InvalidArgument("conversation_id must not be empty".to_string());
            trace.fail(err.kind());
            return Err(err);
        }
        let query = query.trim();
        if query.is_empty() {
            let err = PipelineError::InvalidArgument("query must not be empty".to_string());
            trace.fail(err.kind());
            return Err(err);
        }

        let limit_ms = u64::try_from(self.options.max_total_latency.as_millis()).unwrap_or(u64::MAX);
        let deadline = Instant::now() + self.options.max_total_latency;

        let answered = tokio::time::timeout_at(
            deadline,
            self.answer(conversation_id, query, deadline, &mut trace, &mut warnings),
        )
        .await;

        let answered = match answered {
            Ok(Ok(answered)) => answered,
            Ok(Err(err)) => {
                tracing::warn!(conversation_id, kind = err.kind(), error = %err, "Pipeline failed");
                trace.fail(err.kind());
                return Err(err);
            }
            Err(_) => {
                let err = PipelineError::Timeout { limit_ms };
                tracing::warn!(conversation_id, limit_ms, "Pipeline exceeded its latency budget");
                trace.fail(err.kind());
                return Err(err);
            }
        };

        if answered.source == CacheSource::Generated {
            trace.advance(PipelineState::Persisting);
            if let Err(message) = self.persist(conversation_id, query, &answered.answer).await {
                tracing::warn!(conversation_id, error = %message, "Failed to persist conversation turns");
                warnings.push(PipelineWarning::PersistenceFailed { message });
            }
        }

        trace.advance(PipelineState::Responding);
        trace.advance(PipelineState::Done);

        tracing::info!(
            conversation_id,
            source = ?answered.source,
            attempts = answered.attempts,
            warnings = warnings.len(),
            "Answered query"
        );

        Ok(PipelineOutcome {
            conversation_id: conversation_id.to_string(),
            answer: answered.answer,
            source: answered.source,
            generation_attempts: answered.attempts,
            warnings,
            states: trace.into_states(),
        })
    }

    async fn answer(
        &self,
        conversation_id: &str,
        query: &str,
        deadline: Instant,
        trace: &mut StateTrace,
        warnings: &mut Vec<PipelineWarning>,
    ) -> Result<Answered, PipelineError> {
        trace.advance(PipelineState::Embedding);
        let embedding = self.retriever.embed_query(query).await?;
        if embedding.truncated {
            tracing::warn!(conversation_id, "Query truncated before embedding");
            warnings.push(PipelineWarning::QueryTruncated);
        }

        trace.advance(PipelineState::Retrieving);
        let results = self.retriever.search(&embedding.vector, self.options.top_k)?;
        let retrieved = self.retriever.resolve(&results);
        tracing::debug!(conversation_id, hits = retrieved.len(), "Retrieved clinic documents");

        trace.advance(PipelineState::ComposingPrompt);
        let history = self
            .history
            .recent(conversation_id, self.composer.history_window())
            .await?;
        let request = self.composer.compose(query, &retrieved, &history);

        trace.advance(PipelineState::CacheCheck);
        let document_ids: Vec<String> = results.iter().map(|r| r.document_id.clone()).collect();
        let key = CacheKey::derive(query, &document_ids, conversation_id, self.composer.parameters());
        tracing::debug!(conversation_id, cache_key = %key, "Checking response cache");

        let mut attempts = 0;
        let outcome = {
            let attempts = &mut attempts;
            let trace = &mut *trace;
            self.cache
                .get_or_generate(&key, || async move {
                    trace.advance(PipelineState::Generating);
                    self.generate_with_retry(conversation_id, &request, deadline, attempts)
                        .await
                })
                .await?
        };

        if let Some(err) = outcome.cache_warning {
            warnings.push(PipelineWarning::CacheDegraded {
                message: err.to_string(),
            });
        }
        if outcome.source != CacheSource::Generated {
            trace.advance(PipelineState::CacheHit);
        }

        Ok(Answered {
            answer: outcome.answer,
            source: outcome.source,
            attempts,
        })
    }

    async fn generate_with_retry(
        &self,
        conversation_id: &str,
        request: &GenerationRequest,
        deadline: Instant,
        attempts: &mut u32,
    ) -> Result<String, PipelineError> {
        let policy = &self.options.retry;
        let limit_ms = u64::try_from(self.options.max_total_latency.as_millis()).unwrap_or(u64::MAX);

        loop {
            *attempts += 1;
            let attempt = *attempts;

            let result =
                match tokio::time::timeout(policy.attempt_timeout, self.generator.generate(request))
                    .await
                {
                    Ok(result) => result,
                    Err(_) => Err(GenerationError::transient(format!(
                        "generator did not answer within {} ms",
                        policy.attempt_timeout.as_millis()
                    ))),
                };

            let err = match result {
                Ok(raw) => {
                    let answer = extract_answer(&raw);
                    if answer.is_empty() {
                        return Err(GenerationError::permanent("generator returned an empty answer").into());
                    }
                    return Ok(answer);
                }
                Err(err) => err,
            };

            if !err.is_transient() || !policy.should_retry(attempt) {
                tracing::warn!(
                    conversation_id,
                    attempt,
                    generator = self.generator.name(),
                    error = %err,
                    "Generation failed"
                );
                return Err(err.into());
            }

            let delay = policy.delay_for(attempt);
            if Instant::now() + delay >= deadline {
                return Err(PipelineError::Timeout { limit_ms });
            }
            tracing::warn!(
                conversation_id,
                attempt,
                max_attempts = policy.max_attempts,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "Transient generation failure, retrying"
            );
            tokio::time::sleep(delay).await;
        }
    }

    /// Runs on its own task so a caller that goes away mid-write cannot
    /// leave half an exchange behind.
    async fn persist(&self, conversation_id: &str, query: &str, answer: &str) -> Result<(), String> {
        let history = self.history.clone();
        let conversation_id = conversation_id.to_string();
        let query = query.to_string();
        let answer = answer.to_string();

        let handle = tokio::spawn(async move {
            history
                .append_exchange(&conversation_id, &query, &answer)
                .await
        });

        match handle.await {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(err)) => Err(err.to_string()),
            Err(join) => Err(join.to_string()),
        }
    }
}
