use std::sync::Arc;

use super::document::{RetrievalResult, RetrievedDocument};
use super::index::DocumentIndex;
use crate::embedding::{Embedder, Embedding};
use crate::pipeline::PipelineError;

/// Ranked results for one query. An empty `results` means nothing matched;
/// a failed embedding is always an `Err`.
#[derive(Debug, Clone)]
pub struct Retrieval {
    pub results: Vec<RetrievalResult>,
    pub query_truncated: bool,
}

#[derive(Clone)]
pub struct Retriever {
    embedder: Arc<dyn Embedder>,
    index: Arc<DocumentIndex>,
    per_category: bool,
}

impl Retriever {
    pub fn new(embedder: Arc<dyn Embedder>, index: Arc<DocumentIndex>, per_category: bool) -> Self {
        Self {
            embedder,
            index,
            per_category,
        }
    }

    pub fn index(&self) -> &Arc<DocumentIndex> {
        &self.index
    }

    pub async fn embed_query(&self, query: &str) -> Result<Embedding, PipelineError> {
        self.embedder
            .embed(query)
            .await
            .map_err(|e| PipelineError::retrieval(e.into()))
    }

    pub fn search(&self, vector: &[f32], k: usize) -> Result<Vec<RetrievalResult>, PipelineError> {
        if self.per_category {
            self.index.search_per_category(vector, k)
        } else {
            self.index.search(vector, k)
        }
    }

    pub async fn retrieve(&self, query: &str, k: usize) -> Result<Retrieval, PipelineError> {
        let embedding = self.embed_query(query).await?;
        let results = self.search(&embedding.vector, k)?;
        tracing::debug!(
            embedder = self.embedder.name(),
            k,
            hits = results.len(),
            "Retrieved documents"
        );
        Ok(Retrieval {
            results,
            query_truncated: embedding.truncated,
        })
    }

    pub fn resolve(&self, results: &[RetrievalResult]) -> Vec<RetrievedDocument> {
        self.index.resolve(results)
    }
}
