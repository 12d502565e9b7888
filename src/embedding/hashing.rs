use async_trait::async_trait;
use sha2::{Digest, Sha256};

use super::{prepare_input, Embedder, Embedding, InputPolicy};
use crate::pipeline::EmbeddingError;
use crate::vector_math::l2_normalize;

const WORD_WEIGHT: f32 = 1.0;
const TRIGRAM_WEIGHT: f32 = 0.5;

/// Deterministic local embedder based on signed feature hashing of words and
/// character trigrams. Needs no model download, so it is the offline default
/// and the embedder used by tests.
#[derive(Debug, Clone)]
pub struct HashingEmbedder {
    dimension: usize,
    policy: InputPolicy,
}

impl HashingEmbedder {
    pub fn new(dimension: usize, policy: InputPolicy) -> Self {
        Self {
            dimension: dimension.max(1),
            policy,
        }
    }

    fn accumulate(&self, vector: &mut [f32], feature: &str, weight: f32) {
        let digest = Sha256::digest(feature.as_bytes());
        let mut bucket_bytes = [0u8; 8];
        bucket_bytes.copy_from_slice(&digest[..8]);
        let bucket = (u64::from_le_bytes(bucket_bytes) % self.dimension as u64) as usize;
        let sign = if digest[8] & 1 == 0 { 1.0 } else { -1.0 };
        vector[bucket] += sign * weight;
    }
}

#[async_trait]
impl Embedder for HashingEmbedder {
    fn name(&self) -> &str {
        "hashing"
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    async fn embed(&self, text: &str) -> Result<Embedding, EmbeddingError> {
        let (input, truncated) = prepare_input(text, &self.policy)?;
        let lowered = input.to_lowercase();

        let mut vector = vec![0.0f32; self.dimension];
        for word in lowered
            .split(|c: char| !c.is_alphanumeric())
            .filter(|w| !w.is_empty())
        {
            self.accumulate(&mut vector, word, WORD_WEIGHT);

            let padded: Vec<char> = format!("^{}$", word).chars().collect();
            for window in padded.windows(3) {
                let trigram: String = window.iter().collect();
                self.accumulate(&mut vector, &trigram, TRIGRAM_WEIGHT);
            }
        }

        // Punctuation-only input has no features; the vector stays zero.
        l2_normalize(&mut vector);
        Ok(Embedding { vector, truncated })
    }
}
