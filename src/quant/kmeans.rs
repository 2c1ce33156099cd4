//! Lloyd's k-means, shared by product quantization and IVF coarse training.

use super::QuantizationError;
use crate::cancel::CancelToken;
use crate::metric::{Metric, L2};
use rand::Rng;
use rand_chacha::ChaCha8Rng;

#[cfg(feature = "parallel")]
use rayon::prelude::*;

/// Convergence threshold: stop once no centroid moves farther than this.
const SHIFT_TOLERANCE: f32 = 1e-6;

/// Iteration cap.
const MAX_ITERATIONS: usize = 100;

/// Runs k-means over `data`, returning `k` centroids.
///
/// Centroids are initialised from random training points. Lloyd iterations
/// run until the maximum centroid shift drops below `1e-6` or 100 iterations
/// elapse; clusters that go empty are reseeded from a random training vector.
/// Cancellation is observed between iterations.
pub fn kmeans(
    data: &[&[f32]],
    k: usize,
    rng: &mut ChaCha8Rng,
    cancel: &CancelToken,
) -> Result<Vec<Vec<f32>>, QuantizationError> {
    if k == 0 {
        return Err(QuantizationError::InvalidConfig("k must be > 0".into()));
    }
    if data.len() < k {
        return Err(QuantizationError::InsufficientTrainingData {
            needed: k,
            got: data.len(),
        });
    }
    let dim = data[0].len();

    // Random init from the training set.
    let mut centroids: Vec<Vec<f32>> = (0..k)
        .map(|_| data[rng.gen_range(0..data.len())].to_vec())
        .collect();

    let mut assignments = vec![0usize; data.len()];

    for _iter in 0..MAX_ITERATIONS {
        if cancel.is_cancelled() {
            return Err(QuantizationError::Cancelled);
        }

        assign(data, &centroids, &mut assignments);

        // Recompute means.
        let mut sums = vec![vec![0.0f32; dim]; k];
        let mut counts = vec![0usize; k];
        for (point, &cluster) in data.iter().zip(assignments.iter()) {
            counts[cluster] += 1;
            for (acc, &x) in sums[cluster].iter_mut().zip(point.iter()) {
                *acc += x;
            }
        }

        let mut max_shift = 0.0f32;
        for (c, (sum, &count)) in centroids
            .iter_mut()
            .zip(sums.iter().zip(counts.iter()))
        {
            if count == 0 {
                // Reseed empty cluster from a random training vector.
                *c = data[rng.gen_range(0..data.len())].to_vec();
                max_shift = f32::MAX;
                continue;
            }
            #[allow(clippy::cast_precision_loss)]
            let inv = 1.0 / count as f32;
            let mut shift = 0.0f32;
            for (ci, &s) in c.iter_mut().zip(sum.iter()) {
                let next = s * inv;
                let d = next - *ci;
                shift += d * d;
                *ci = next;
            }
            max_shift = max_shift.max(shift.sqrt());
        }

        if max_shift < SHIFT_TOLERANCE {
            break;
        }
    }

    Ok(centroids)
}

/// Assigns each point to its nearest centroid.
#[cfg(feature = "parallel")]
fn assign(data: &[&[f32]], centroids: &[Vec<f32>], assignments: &mut [usize]) {
    assignments
        .par_iter_mut()
        .zip(data.par_iter())
        .for_each(|(slot, point)| *slot = nearest(point, centroids).0);
}

/// Assigns each point to its nearest centroid.
#[cfg(not(feature = "parallel"))]
fn assign(data: &[&[f32]], centroids: &[Vec<f32>], assignments: &mut [usize]) {
    for (slot, point) in assignments.iter_mut().zip(data.iter()) {
        *slot = nearest(point, centroids).0;
    }
}

/// Index and distance of the nearest centroid.
#[must_use]
pub fn nearest(point: &[f32], centroids: &[Vec<f32>]) -> (usize, f32) {
    let mut best = 0usize;
    let mut best_dist = f32::MAX;
    for (i, c) in centroids.iter().enumerate() {
        let d = L2::distance(point, c);
        if d < best_dist {
            best_dist = d;
            best = i;
        }
    }
    (best, best_dist)
}
