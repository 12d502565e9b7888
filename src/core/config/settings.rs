use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::context::DEFAULT_SYSTEM_PROMPT;
use crate::embedding::InputPolicy;
use crate::llm::GenerationParameters;

/// Every recognized option. Unknown keys are rejected before this is
/// deserialized.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ChatbotConfig {
    pub generation: GenerationSettings,
    pub retrieval: RetrievalSettings,
    pub cache: CacheSettings,
    pub history: HistorySettings,
    pub pipeline: PipelineSettings,
    pub embedding: EmbeddingSettings,
    pub llm: LlmSettings,
    pub prompt: PromptSettings,
    pub ingest: IngestSettings,
    pub server: ServerSettings,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct GenerationSettings {
    pub temperature: f32,
    pub top_p: f32,
    pub max_new_tokens: u32,
    pub repetition_penalty: f32,
    pub do_sample: bool,
    pub max_attempts: u32,
    pub timeout_ms: u64,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
}

impl Default for GenerationSettings {
    fn default() -> Self {
        let params = GenerationParameters::default();
        Self {
            temperature: params.temperature,
            top_p: params.top_p,
            max_new_tokens: params.max_new_tokens,
            repetition_penalty: params.repetition_penalty,
            do_sample: params.do_sample,
            max_attempts: 3,
            timeout_ms: 60_000,
            backoff_base_ms: 500,
            backoff_max_ms: 8_000,
        }
    }
}

impl GenerationSettings {
    pub fn parameters(&self) -> GenerationParameters {
        GenerationParameters {
            temperature: self.temperature,
            top_p: self.top_p,
            max_new_tokens: self.max_new_tokens,
            repetition_penalty: self.repetition_penalty,
            do_sample: self.do_sample,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RetrievalSettings {
    pub top_k: usize,
    pub per_category: bool,
}

impl Default for RetrievalSettings {
    fn default() -> Self {
        Self {
            top_k: 10,
            per_category: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CacheSettings {
    pub capacity: usize,
    pub shards: usize,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            capacity: 256,
            shards: 8,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct HistorySettings {
    /// Most recent turns included in the prompt.
    pub window: usize,
}

impl Default for HistorySettings {
    fn default() -> Self {
        Self { window: 6 }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PipelineSettings {
    pub max_total_latency_ms: u64,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            max_total_latency_ms: 120_000,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EmbeddingProvider {
    Hashing,
    Http,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EmbeddingSettings {
    pub provider: EmbeddingProvider,
    pub dimension: usize,
    pub max_input_chars: usize,
    pub truncate_long_inputs: bool,
    pub base_url: String,
    pub model: String,
}

impl Default for EmbeddingSettings {
    fn default() -> Self {
        let policy = InputPolicy::default();
        Self {
            provider: EmbeddingProvider::Hashing,
            dimension: 384,
            max_input_chars: policy.max_input_chars,
            truncate_long_inputs: policy.truncate_long_inputs,
            base_url: "http://localhost:1234".to_string(),
            model: "text-embedding-nomic-embed-text-v1.5".to_string(),
        }
    }
}

impl EmbeddingSettings {
    pub fn input_policy(&self) -> InputPolicy {
        InputPolicy {
            max_input_chars: self.max_input_chars,
            truncate_long_inputs: self.truncate_long_inputs,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LlmSettings {
    pub base_url: String,
    pub model: String,
    pub api_key: Option<String>,
}

impl Default for LlmSettings {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:1234".to_string(),
            model: "qwen2.5-7b-instruct".to_string(),
            api_key: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PromptSettings {
    pub system_prompt: String,
}

impl Default for PromptSettings {
    fn default() -> Self {
        Self {
            system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct IngestSettings {
    pub database_path: Option<PathBuf>,
    pub tables: Vec<IngestTable>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct IngestTable {
    pub table: String,
    pub category: String,
    pub id_column: String,
    pub columns: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServerSettings {
    pub host: String,
    pub port: u16,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8000,
        }
    }
}
