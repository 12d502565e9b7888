use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

/// Sampling settings sent with every generation. Part of the cache key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationParameters {
    pub temperature: f32,
    pub top_p: f32,
    pub max_new_tokens: u32,
    pub repetition_penalty: f32,
    pub do_sample: bool,
}

impl Default for GenerationParameters {
    fn default() -> Self {
        Self {
            temperature: 0.7,
            top_p: 0.9,
            max_new_tokens: 256,
            repetition_penalty: 1.2,
            do_sample: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GenerationRequest {
    pub prompt_text: String,
    pub parameters: GenerationParameters,
}

impl GenerationRequest {
    pub fn messages(&self) -> Vec<ChatMessage> {
        vec![ChatMessage {
            role: "user".to_string(),
            content: self.prompt_text.clone(),
        }]
    }
}
