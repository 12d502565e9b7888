use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde_json::{json, Value};

use super::provider::Generator;
use super::types::GenerationRequest;
use crate::pipeline::GenerationError;

/// Generator for any `/v1/chat/completions` server (LM Studio, vLLM,
/// llama.cpp server, hosted APIs).
#[derive(Clone)]
pub struct OpenAiCompatibleGenerator {
    base_url: String,
    model: String,
    api_key: Option<String>,
    client: Client,
}

impl OpenAiCompatibleGenerator {
    /// `timeout` bounds one HTTP exchange; the pipeline applies its own
    /// per-attempt limit on top.
    pub fn new(
        base_url: String,
        model: String,
        api_key: Option<String>,
        timeout: Duration,
    ) -> Result<Self, GenerationError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| GenerationError::permanent(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            model,
            api_key,
            client,
        })
    }

    fn url(&self, path: &str) -> String {
        if self.base_url.ends_with("/v1") {
            format!("{}/{}", self.base_url, path)
        } else {
            format!("{}/v1/{}", self.base_url, path)
        }
    }

    fn body(&self, request: &GenerationRequest) -> Value {
        let params = &request.parameters;
        let mut body = json!({
            "model": self.model,
            "messages": request.messages(),
            "stream": false,
            "max_tokens": params.max_new_tokens,
            "repetition_penalty": params.repetition_penalty,
        });

        if let Some(obj) = body.as_object_mut() {
            if params.do_sample {
                obj.insert("temperature".to_string(), json!(params.temperature));
                obj.insert("top_p".to_string(), json!(params.top_p));
            } else {
                obj.insert("temperature".to_string(), json!(0.0));
            }
        }
        body
    }
}

/// 408, 429 and 5xx may succeed later; other client errors will not.
pub fn classify_status(status: StatusCode, detail: &str) -> GenerationError {
    let message = format!("generation endpoint returned {}: {}", status, detail);
    if status == StatusCode::REQUEST_TIMEOUT
        || status == StatusCode::TOO_MANY_REQUESTS
        || status.is_server_error()
    {
        GenerationError::transient(message)
    } else {
        GenerationError::permanent(message)
    }
}

fn classify_transport(err: reqwest::Error) -> GenerationError {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        GenerationError::transient(err.to_string())
    } else {
        GenerationError::permanent(err.to_string())
    }
}

#[async_trait]
impl Generator for OpenAiCompatibleGenerator {
    fn name(&self) -> &str {
        "openai_compatible"
    }

    async fn init(&self) -> Result<(), GenerationError> {
        if !self.health_check().await {
            // The server may come up later; requests will retry.
            tracing::warn!(url = %self.base_url, "Generation endpoint not reachable at startup");
        }
        Ok(())
    }

    async fn health_check(&self) -> bool {
        let mut req = self.client.get(self.url("models"));
        if let Some(key) = &self.api_key {
            req = req.bearer_auth(key);
        }
        match req.send().await {
            Ok(resp) => resp.status().is_success(),
            Err(_) => false,
        }
    }

    async fn generate(&self, request: &GenerationRequest) -> Result<String, GenerationError> {
        let mut req = self
            .client
            .post(self.url("chat/completions"))
            .json(&self.body(request));
        if let Some(key) = &self.api_key {
            req = req.bearer_auth(key);
        }

        let res = req.send().await.map_err(classify_transport)?;

        if !res.status().is_success() {
            let status = res.status();
            let text = res.text().await.unwrap_or_default();
            return Err(classify_status(status, &text));
        }

        let payload: Value = res
            .json()
            .await
            .map_err(|e| GenerationError::permanent(format!("malformed completion payload: {}", e)))?;

        let content = payload["choices"][0]["message"]["content"]
            .as_str()
            .map(str::trim)
            .unwrap_or_default();
        if content.is_empty() {
            return Err(GenerationError::permanent("completion contained no text"));
        }

        Ok(content.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::GenerationParameters;

    fn generator() -> OpenAiCompatibleGenerator {
        OpenAiCompatibleGenerator::new(
            "http://localhost:1234/".to_string(),
            "qwen2.5-7b-instruct".to_string(),
            None,
            Duration::from_secs(5),
        )
        .unwrap()
    }

    #[test]
    fn status_classification() {
        assert!(classify_status(StatusCode::TOO_MANY_REQUESTS, "").is_transient());
        assert!(classify_status(StatusCode::REQUEST_TIMEOUT, "").is_transient());
        assert!(classify_status(StatusCode::BAD_GATEWAY, "").is_transient());
        assert!(!classify_status(StatusCode::BAD_REQUEST, "").is_transient());
        assert!(!classify_status(StatusCode::UNAUTHORIZED, "").is_transient());
    }

    #[test]
    fn body_carries_sampling_parameters() {
        let request = GenerationRequest {
            prompt_text: "### Response:".to_string(),
            parameters: GenerationParameters::default(),
        };
        let body = generator().body(&request);

        assert_eq!(body["model"], "qwen2.5-7b-instruct");
        assert_eq!(body["max_tokens"], 256);
        assert_eq!(body["messages"][0]["role"], "user");
        assert!(body["temperature"].as_f64().is_some());
        assert_eq!(generator().url("chat/completions"), "http://localhost:1234/v1/chat/completions");
    }

    #[test]
    fn greedy_decoding_pins_temperature() {
        let request = GenerationRequest {
            prompt_text: "hi".to_string(),
            parameters: GenerationParameters {
                do_sample: false,
                ..GenerationParameters::default()
            },
        };
        let body = generator().body(&request);
        assert_eq!(body["temperature"], 0.0);
        assert!(body.get("top_p").is_none());
    }
}
