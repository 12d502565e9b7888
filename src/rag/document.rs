use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

pub const CATEGORY_KEY: &str = "category";

/// A clinic record prepared for retrieval. Immutable once indexed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub id: String,
    pub text: String,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
    #[serde(default)]
    pub vector: Vec<f32>,
}

impl Document {
    pub fn new(id: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            text: text.into(),
            metadata: BTreeMap::new(),
            vector: Vec::new(),
        }
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn with_vector(mut self, vector: Vec<f32>) -> Self {
        self.vector = vector;
        self
    }

    /// "services", "branches", "social_media", ...
    pub fn category(&self) -> Option<&str> {
        self.metadata.get(CATEGORY_KEY).map(String::as_str)
    }
}

/// One ranked hit. `rank` starts at 1.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RetrievalResult {
    pub document_id: String,
    pub score: f32,
    pub rank: usize,
}

/// A hit resolved against the index, ready for prompt composition.
#[derive(Debug, Clone)]
pub struct RetrievedDocument {
    pub result: RetrievalResult,
    pub document: Arc<Document>,
}
