use std::fmt;

use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::llm::GenerationParameters;

const KEY_VERSION: &str = "v1";

/// Fingerprint of the inputs that determine an answer. Hex-encoded SHA-256.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct CacheKey(String);

impl CacheKey {
    pub fn derive(
        query: &str,
        document_ids: &[String],
        conversation_id: &str,
        parameters: &GenerationParameters,
    ) -> Self {
        let mut ids: Vec<&str> = document_ids.iter().map(String::as_str).collect();
        ids.sort_unstable();
        ids.dedup();

        let mut hasher = Sha256::new();
        write_field(&mut hasher, KEY_VERSION.as_bytes());
        write_field(&mut hasher, normalize_query(query).as_bytes());
        write_field(&mut hasher, &(ids.len() as u64).to_le_bytes());
        for id in ids {
            write_field(&mut hasher, id.as_bytes());
        }
        write_field(&mut hasher, conversation_id.as_bytes());
        write_field(&mut hasher, &parameters.temperature.to_bits().to_le_bytes());
        write_field(&mut hasher, &parameters.top_p.to_bits().to_le_bytes());
        write_field(&mut hasher, &parameters.max_new_tokens.to_le_bytes());
        write_field(&mut hasher, &parameters.repetition_penalty.to_bits().to_le_bytes());
        write_field(&mut hasher, &[u8::from(parameters.do_sample)]);

        CacheKey(hex::encode(hasher.finalize()))
    }

    /// Rebuilds a key read back from durable storage.
    pub fn from_hex(value: impl Into<String>) -> Self {
        CacheKey(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Stable shard selector; the key is already uniformly distributed.
    pub(crate) fn shard(&self, shards: usize) -> usize {
        let prefix = self.0.get(..8).unwrap_or("0");
        let bucket = u64::from_str_radix(prefix, 16).unwrap_or(0);
        (bucket % shards.max(1) as u64) as usize
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Case-folds, collapses whitespace and strips trailing `?`, `!` and `.`.
///
/// "What are your opening hours?" and "what are  your opening hours"
/// produce the same key.
pub fn normalize_query(query: &str) -> String {
    let collapsed = query
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase();
    collapsed
        .trim_end_matches(|c: char| c == '?' || c == '!' || c == '.' || c.is_whitespace())
        .to_string()
}

fn write_field(hasher: &mut Sha256, bytes: &[u8]) {
    hasher.update((bytes.len() as u64).to_le_bytes());
    hasher.update(bytes);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(values: &[&str]) -> Vec<String> {
        values.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn normalization_folds_case_whitespace_and_trailing_punctuation() {
        assert_eq!(
            normalize_query("  What are   your Opening\thours?? "),
            "what are your opening hours"
        );
        assert_eq!(normalize_query("Hours!"), "hours");
        assert_eq!(normalize_query("Is it 9.30"), "is it 9.30");
    }

    #[test]
    fn logically_identical_requests_share_a_key() {
        let params = GenerationParameters::default();
        let a = CacheKey::derive("What are your opening hours?", &ids(&["b", "a"]), "c1", &params);
        let b = CacheKey::derive("what are your opening hours", &ids(&["a", "b", "a"]), "c1", &params);
        assert_eq!(a, b);
        assert_eq!(a.as_str().len(), 64);
    }

    #[test]
    fn each_input_changes_the_key() {
        let params = GenerationParameters::default();
        let base = CacheKey::derive("hours", &ids(&["a"]), "c1", &params);

        assert_ne!(base, CacheKey::derive("prices", &ids(&["a"]), "c1", &params));
        assert_ne!(base, CacheKey::derive("hours", &ids(&["b"]), "c1", &params));
        assert_ne!(base, CacheKey::derive("hours", &ids(&["a"]), "c2", &params));

        let warmer = GenerationParameters {
            temperature: 0.9,
            ..params.clone()
        };
        assert_ne!(base, CacheKey::derive("hours", &ids(&["a"]), "c1", &warmer));
    }

    #[test]
    fn field_boundaries_are_unambiguous() {
        let params = GenerationParameters::default();
        let a = CacheKey::derive("ab", &ids(&["c"]), "d", &params);
        let b = CacheKey::derive("a", &ids(&["bc"]), "d", &params);
        assert_ne!(a, b);
    }
}
