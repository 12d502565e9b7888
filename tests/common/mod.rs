#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use dental_rag::core::config::{AppPaths, ChatbotConfig};
use dental_rag::embedding::{Embedder, HashingEmbedder, InputPolicy};
use dental_rag::llm::{GenerationRequest, Generator};
use dental_rag::pipeline::GenerationError;
use dental_rag::rag::Document;
use dental_rag::ChatbotServices;

pub const DIMENSION: usize = 128;

/// One scripted generator response.
#[derive(Debug, Clone)]
pub enum Step {
    Answer(String),
    Transient,
    Permanent,
    /// Sleeps before answering, to trip attempt timeouts.
    Hang(Duration),
}

/// Generator double that replays a script and records every call.
pub struct ScriptedGenerator {
    script: Mutex<VecDeque<Step>>,
    fallback: String,
    latency: Duration,
    calls: AtomicUsize,
    prompts: Mutex<Vec<String>>,
}

impl ScriptedGenerator {
    pub fn new(script: Vec<Step>) -> Self {
        Self {
            script: Mutex::new(script.into()),
            fallback: "Our branches are open 9am-6pm, Sunday to Thursday.".to_string(),
            latency: Duration::ZERO,
            calls: AtomicUsize::new(0),
            prompts: Mutex::new(Vec::new()),
        }
    }

    pub fn answering(answer: &str) -> Self {
        Self {
            fallback: answer.to_string(),
            ..Self::new(Vec::new())
        }
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn last_prompt(&self) -> Option<String> {
        self.prompts.lock().unwrap().last().cloned()
    }
}

#[async_trait]
impl Generator for ScriptedGenerator {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn generate(&self, request: &GenerationRequest) -> Result<String, GenerationError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.prompts.lock().unwrap().push(request.prompt_text.clone());

        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }

        let step = self.script.lock().unwrap().pop_front();
        match step {
            None => Ok(self.fallback.clone()),
            Some(Step::Answer(answer)) => Ok(answer),
            Some(Step::Transient) => Err(GenerationError::transient("429 Too Many Requests")),
            Some(Step::Permanent) => Err(GenerationError::permanent("400 content policy")),
            Some(Step::Hang(duration)) => {
                tokio::time::sleep(duration).await;
                Ok(self.fallback.clone())
            }
        }
    }
}

/// Fast retries and a single cache shard so eviction order is predictable.
pub fn test_config() -> ChatbotConfig {
    let mut config = ChatbotConfig::default();
    config.embedding.dimension = DIMENSION;
    config.generation.backoff_base_ms = 1;
    config.generation.backoff_max_ms = 5;
    config.generation.timeout_ms = 2_000;
    config.cache.shards = 1;
    config
}

pub async fn services_with(
    dir: &tempfile::TempDir,
    config: ChatbotConfig,
    generator: Arc<ScriptedGenerator>,
) -> Arc<ChatbotServices> {
    let paths = Arc::new(AppPaths::with_data_dir(dir.path()));
    let embedder = Arc::new(HashingEmbedder::new(DIMENSION, InputPolicy::default()));
    let services = ChatbotServices::with_providers(paths, config, embedder, generator)
        .await
        .unwrap();
    seed_documents(&services).await;
    services
}

pub async fn seed_documents(services: &ChatbotServices) {
    let documents = [
        ("Branches_English:1", "branches", "Branch opens 9am-6pm Sun-Thu"),
        ("Services_English:1", "services", "Teeth whitening and scaling"),
        ("SocialMedia_English:1", "social_media", "Instagram @clinic"),
    ];
    for (id, category, text) in documents {
        let vector = services.embedder.embed(text).await.unwrap().vector;
        services
            .index
            .add(
                Document::new(id, text)
                    .with_metadata("category", category)
                    .with_vector(vector),
            )
            .unwrap();
    }
}
