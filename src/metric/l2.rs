//! Squared L2 distance.

use super::Metric;

/// Squared Euclidean distance.
///
/// Calculates `sum((a_i - b_i)^2)`. The square root is omitted: squared
/// distances preserve ordering and are cheaper to compute.
#[derive(Debug, Clone, Copy, Default)]
pub struct L2;

impl Metric for L2 {
    #[inline]
    fn distance(a: &[f32], b: &[f32]) -> f32 {
        assert_eq!(
            a.len(),
            b.len(),
            "dimension mismatch: {} != {}",
            a.len(),
            b.len()
        );

        let mut sum = 0.0;
        for (x, y) in a.iter().zip(b.iter()) {
            let diff = x - y;
            sum += diff * diff;
        }
        sum
    }
}
