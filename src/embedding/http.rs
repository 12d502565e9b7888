use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde_json::{json, Value};

use super::{prepare_input, Embedder, Embedding, InputPolicy};
use crate::pipeline::EmbeddingError;
use crate::vector_math::l2_normalize;

/// Embedder backed by an OpenAI-compatible `/v1/embeddings` endpoint
/// (LM Studio, vLLM, llama.cpp server, hosted APIs).
#[derive(Clone)]
pub struct HttpEmbedder {
    base_url: String,
    model: String,
    api_key: Option<String>,
    dimension: usize,
    policy: InputPolicy,
    client: Client,
}

impl HttpEmbedder {
    pub fn new(
        base_url: String,
        model: String,
        api_key: Option<String>,
        dimension: usize,
        policy: InputPolicy,
        timeout: Duration,
    ) -> Result<Self, EmbeddingError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| EmbeddingError::Provider(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            model,
            api_key,
            dimension,
            policy,
            client,
        })
    }

    fn endpoint(&self) -> String {
        if self.base_url.ends_with("/v1") {
            format!("{}/embeddings", self.base_url)
        } else {
            format!("{}/v1/embeddings", self.base_url)
        }
    }

    async fn request(&self, input: &str) -> Result<Vec<f32>, EmbeddingError> {
        let body = json!({
            "model": self.model,
            "input": [input],
        });

        let mut req = self.client.post(self.endpoint()).json(&body);
        if let Some(key) = &self.api_key {
            req = req.bearer_auth(key);
        }

        let res = req
            .send()
            .await
            .map_err(|e| EmbeddingError::Provider(e.to_string()))?;

        if !res.status().is_success() {
            let status = res.status();
            let text = res.text().await.unwrap_or_default();
            return Err(EmbeddingError::Provider(format!(
                "embedding endpoint returned {}: {}",
                status, text
            )));
        }

        let payload: Value = res
            .json()
            .await
            .map_err(|e| EmbeddingError::Provider(e.to_string()))?;

        let values = payload["data"][0]["embedding"]
            .as_array()
            .ok_or_else(|| EmbeddingError::Provider("response has no embedding".to_string()))?;

        Ok(values
            .iter()
            .filter_map(|v| v.as_f64().map(|f| f as f32))
            .collect())
    }
}

#[async_trait]
impl Embedder for HttpEmbedder {
    fn name(&self) -> &str {
        "http"
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    async fn init(&self) -> Result<(), EmbeddingError> {
        // Probe once so a wrong model or dimension fails at startup.
        let probe = self.request("dimension probe").await?;
        if probe.len() != self.dimension {
            return Err(EmbeddingError::DimensionMismatch {
                expected: self.dimension,
                got: probe.len(),
            });
        }
        tracing::info!(model = %self.model, dimension = self.dimension, "HTTP embedder ready");
        Ok(())
    }

    async fn embed(&self, text: &str) -> Result<Embedding, EmbeddingError> {
        let (input, truncated) = prepare_input(text, &self.policy)?;
        let mut vector = self.request(&input).await?;

        if vector.len() != self.dimension {
            return Err(EmbeddingError::DimensionMismatch {
                expected: self.dimension,
                got: vector.len(),
            });
        }

        l2_normalize(&mut vector);
        Ok(Embedding { vector, truncated })
    }
}
