use std::cmp::Ordering;

use crate::pipeline::PipelineError;

pub fn dot(left: &[f32], right: &[f32]) -> f32 {
    left.iter().zip(right.iter()).map(|(x, y)| x * y).sum()
}

pub fn l2_norm(vector: &[f32]) -> f32 {
    vector.iter().map(|x| x * x).sum::<f32>().sqrt()
}

/// Scales `vector` to unit length in place. Returns `false` for a zero vector,
/// which is left untouched.
pub fn l2_normalize(vector: &mut [f32]) -> bool {
    let norm = l2_norm(vector);
    if norm <= f32::EPSILON || !norm.is_finite() {
        return false;
    }
    for value in vector.iter_mut() {
        *value /= norm;
    }
    true
}

pub fn cosine_similarity(query: &[f32], candidate: &[f32]) -> Result<f32, PipelineError> {
    if query.is_empty() || candidate.is_empty() {
        return Err(PipelineError::InvalidArgument(
            "Vectors must not be empty".to_string(),
        ));
    }
    if query.len() != candidate.len() {
        return Err(PipelineError::InvalidArgument(format!(
            "Vector length mismatch: {} != {}",
            query.len(),
            candidate.len()
        )));
    }

    let denom = l2_norm(query) * l2_norm(candidate);
    if denom <= f32::EPSILON {
        return Ok(0.0);
    }

    Ok((dot(query, candidate) / denom).clamp(-1.0, 1.0))
}

/// Orders by score, highest first. Equal scores keep their input order
/// because `sort_by` is stable.
pub fn sort_descending_stable<T>(items: &mut [T], score: impl Fn(&T) -> f32) {
    items.sort_by(|left, right| {
        score(right)
            .partial_cmp(&score(left))
            .unwrap_or(Ordering::Equal)
    });
}
