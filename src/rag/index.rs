use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, PoisonError, RwLock};

use super::document::{Document, RetrievalResult, RetrievedDocument};
use crate::pipeline::PipelineError;
use crate::vector_math::{dot, l2_normalize, sort_descending_stable};

#[derive(Default)]
struct IndexInner {
    documents: Vec<Arc<Document>>,
    /// Unit-length copies of `documents[i].vector`.
    normalized: Vec<Vec<f32>>,
    positions: HashMap<String, usize>,
}

/// In-memory cosine index over clinic documents.
///
/// Documents are added during ingestion only; queries take a shared read
/// lock, so any number of searches run concurrently.
pub struct DocumentIndex {
    dimension: usize,
    inner: RwLock<IndexInner>,
}

struct Candidate {
    position: usize,
    score: f32,
}

impl DocumentIndex {
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension,
            inner: RwLock::new(IndexInner::default()),
        }
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    pub fn len(&self) -> usize {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .documents
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn add(&self, document: Document) -> Result<(), PipelineError> {
        if document.id.trim().is_empty() {
            return Err(PipelineError::InvalidArgument(
                "document id must not be empty".to_string(),
            ));
        }
        if document.vector.len() != self.dimension {
            return Err(PipelineError::InvalidArgument(format!(
                "document '{}' has dimension {}, index expects {}",
                document.id,
                document.vector.len(),
                self.dimension
            )));
        }

        let mut normalized = document.vector.clone();
        if !l2_normalize(&mut normalized) {
            return Err(PipelineError::InvalidArgument(format!(
                "document '{}' has a zero vector",
                document.id
            )));
        }

        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        if inner.positions.contains_key(&document.id) {
            return Err(PipelineError::InvalidArgument(format!(
                "document '{}' is already indexed",
                document.id
            )));
        }

        let position = inner.documents.len();
        inner.positions.insert(document.id.clone(), position);
        inner.documents.push(Arc::new(document));
        inner.normalized.push(normalized);
        Ok(())
    }

    pub fn get(&self, document_id: &str) -> Option<Arc<Document>> {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        inner
            .positions
            .get(document_id)
            .map(|&position| inner.documents[position].clone())
    }

    /// Distinct `metadata.category` values, sorted.
    pub fn categories(&self) -> Vec<String> {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        inner
            .documents
            .iter()
            .filter_map(|d| d.category().map(str::to_string))
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    /// Top `k` documents by cosine similarity. `k` larger than the index
    /// returns every document ranked.
    pub fn search(&self, query: &[f32], k: usize) -> Result<Vec<RetrievalResult>, PipelineError> {
        let query = self.prepare_query(query, k)?;
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);

        let mut candidates = score_all(&inner, &query, |_| true);
        sort_descending_stable(&mut candidates, |c| c.score);
        candidates.truncate(k);
        Ok(to_results(&inner, candidates))
    }

    /// Picks up to `k` documents spread across categories: the best of every
    /// category first, then the second best, and so on. The selection is then
    /// ranked by score. Documents without a category form their own group.
    pub fn search_per_category(
        &self,
        query: &[f32],
        k: usize,
    ) -> Result<Vec<RetrievalResult>, PipelineError> {
        let query = self.prepare_query(query, k)?;
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);

        let mut groups: Vec<Option<String>> = Vec::new();
        for document in &inner.documents {
            let category = document.category().map(str::to_string);
            if !groups.contains(&category) {
                groups.push(category);
            }
        }

        // (rank within its category, candidate)
        let mut rounds: Vec<(usize, Candidate)> = Vec::new();
        for group in &groups {
            let mut candidates = score_all(&inner, &query, |d| {
                d.category().map(str::to_string) == *group
            });
            sort_descending_stable(&mut candidates, |c| c.score);
            candidates.truncate(k);
            rounds.extend(candidates.into_iter().enumerate());
        }

        rounds.sort_by_key(|(_, c)| c.position);
        sort_descending_stable(&mut rounds, |(_, c)| c.score);
        // Stable, so each round keeps the score order from above.
        rounds.sort_by_key(|(round, _)| *round);
        rounds.truncate(k);

        // Restore insertion order before the stable sort so ties resolve the
        // same way as in `search`.
        let mut selected: Vec<Candidate> = rounds.into_iter().map(|(_, c)| c).collect();
        selected.sort_by_key(|c| c.position);
        sort_descending_stable(&mut selected, |c| c.score);
        Ok(to_results(&inner, selected))
    }

    /// Pairs each result with its document, preserving order.
    pub fn resolve(&self, results: &[RetrievalResult]) -> Vec<RetrievedDocument> {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        results
            .iter()
            .filter_map(|result| {
                inner
                    .positions
                    .get(&result.document_id)
                    .map(|&position| RetrievedDocument {
                        result: result.clone(),
                        document: inner.documents[position].clone(),
                    })
            })
            .collect()
    }

    fn prepare_query(&self, query: &[f32], k: usize) -> Result<Vec<f32>, PipelineError> {
        if k == 0 {
            return Err(PipelineError::InvalidArgument(
                "k must be greater than zero".to_string(),
            ));
        }
        if query.len() != self.dimension {
            return Err(PipelineError::InvalidArgument(format!(
                "query has dimension {}, index expects {}",
                query.len(),
                self.dimension
            )));
        }

        let mut normalized = query.to_vec();
        l2_normalize(&mut normalized);
        Ok(normalized)
    }
}

fn score_all(
    inner: &IndexInner,
    query: &[f32],
    include: impl Fn(&Document) -> bool,
) -> Vec<Candidate> {
    inner
        .documents
        .iter()
        .enumerate()
        .filter(|(_, d)| include(d))
        .map(|(position, _)| Candidate {
            position,
            score: dot(query, &inner.normalized[position]),
        })
        .collect()
}

fn to_results(inner: &IndexInner, candidates: Vec<Candidate>) -> Vec<RetrievalResult> {
    candidates
        .into_iter()
        .enumerate()
        .map(|(i, c)| RetrievalResult {
            document_id: inner.documents[c.position].id.clone(),
            score: c.score,
            rank: i + 1,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn doc(id: &str, category: &str, vector: Vec<f32>) -> Document {
        Document::new(id, format!("text of {}", id))
            .with_metadata("category", category)
            .with_vector(vector)
    }

    fn sample_index() -> DocumentIndex {
        let index = DocumentIndex::new(2);
        index.add(doc("a", "services", vec![1.0, 0.0])).unwrap();
        index.add(doc("b", "services", vec![0.7, 0.7])).unwrap();
        index.add(doc("c", "branches", vec![0.0, 1.0])).unwrap();
        index.add(doc("d", "branches", vec![0.9, 0.1])).unwrap();
        index
    }

    #[test]
    fn search_orders_by_score_with_ranks() {
        let results = sample_index().search(&[1.0, 0.0], 3).unwrap();

        let ids: Vec<_> = results.iter().map(|r| r.document_id.as_str()).collect();
        assert_eq!(ids, vec!["a", "d", "b"]);
        assert_eq!(results.iter().map(|r| r.rank).collect::<Vec<_>>(), vec![1, 2, 3]);
        assert!(results.windows(2).all(|w| w[0].score >= w[1].score));
    }

    #[test]
    fn search_with_large_k_returns_everything() {
        let results = sample_index().search(&[1.0, 0.0], 100).unwrap();
        assert_eq!(results.len(), 4);
    }

    #[test]
    fn search_rejects_zero_k() {
        let err = sample_index().search(&[1.0, 0.0], 0).unwrap_err();
        assert_eq!(err.kind(), "invalid_argument");
    }

    #[test]
    fn search_rejects_wrong_dimension() {
        let err = sample_index().search(&[1.0, 0.0, 0.0], 2).unwrap_err();
        assert_eq!(err.kind(), "invalid_argument");
    }

    #[test]
    fn ties_keep_insertion_order() {
        let index = DocumentIndex::new(2);
        index.add(doc("first", "x", vec![2.0, 0.0])).unwrap();
        index.add(doc("second", "x", vec![1.0, 0.0])).unwrap();
        index.add(doc("third", "x", vec![5.0, 0.0])).unwrap();

        let results = index.search(&[1.0, 0.0], 3).unwrap();
        let ids: Vec<_> = results.iter().map(|r| r.document_id.as_str()).collect();
        assert_eq!(ids, vec!["first", "second", "third"]);
    }

    #[test]
    fn add_rejects_duplicates_and_bad_vectors() {
        let index = sample_index();
        assert!(index.add(doc("a", "services", vec![1.0, 0.0])).is_err());
        assert!(index.add(doc("z", "services", vec![1.0])).is_err());
        assert!(index.add(doc("y", "services", vec![0.0, 0.0])).is_err());
        assert_eq!(index.len(), 4);
    }

    #[test]
    fn per_category_search_never_exceeds_k() {
        let index = sample_index();
        for k in 1..=5 {
            let results = index.search_per_category(&[1.0, 0.0], k).unwrap();
            assert_eq!(results.len(), k.min(4));
            assert!(results.windows(2).all(|w| w[0].score >= w[1].score));
            let ranks: Vec<_> = results.iter().map(|r| r.rank).collect();
            assert_eq!(ranks, (1..=results.len()).collect::<Vec<_>>());
        }
    }

    #[test]
    fn per_category_search_spreads_across_categories() {
        let index = sample_index();
        index.add(doc("e", "services", vec![0.99, 0.05])).unwrap();

        let plain = index.search(&[1.0, 0.0], 2).unwrap();
        let plain_ids: Vec<_> = plain.iter().map(|r| r.document_id.as_str()).collect();
        assert_eq!(plain_ids, vec!["a", "e"]);

        let spread = index.search_per_category(&[1.0, 0.0], 2).unwrap();
        let spread_ids: Vec<_> = spread.iter().map(|r| r.document_id.as_str()).collect();
        assert_eq!(spread_ids, vec!["a", "d"]);
    }

    #[test]
    fn resolve_pairs_results_with_documents() {
        let index = sample_index();
        let results = index.search(&[0.0, 1.0], 2).unwrap();
        let resolved = index.resolve(&results);

        assert_eq!(resolved.len(), 2);
        assert_eq!(resolved[0].document.id, "c");
        assert_eq!(resolved[0].document.category(), Some("branches"));
    }

    #[test]
    fn categories_are_sorted_and_distinct() {
        assert_eq!(sample_index().categories(), vec!["branches", "services"]);
    }
}
