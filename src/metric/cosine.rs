//! Cosine distance.

use super::Metric;

/// Guard against division by zero for zero-norm vectors.
const NORM_EPSILON: f32 = 1e-12;

/// Cosine distance.
///
/// Calculates `1 - dot(a, b) / (|a| * |b|)`. A zero result means the vectors
/// point in the same direction; 2.0 means opposite directions. Zero-norm
/// inputs are guarded by a small epsilon rather than producing NaN.
#[derive(Debug, Clone, Copy, Default)]
pub struct Cosine;

impl Metric for Cosine {
    #[inline]
    fn distance(a: &[f32], b: &[f32]) -> f32 {
        assert_eq!(
            a.len(),
            b.len(),
            "dimension mismatch: {} != {}",
            a.len(),
            b.len()
        );

        let mut dot = 0.0;
        let mut norm_a = 0.0;
        let mut norm_b = 0.0;
        for (x, y) in a.iter().zip(b.iter()) {
            dot += x * y;
            norm_a += x * x;
            norm_b += y * y;
        }

        let denom = (norm_a.sqrt() * norm_b.sqrt()).max(NORM_EPSILON);
        1.0 - dot / denom
    }
}
