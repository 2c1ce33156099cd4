//! Distance kernels.
//!
//! Three metrics over equal-length `f32` slices: squared L2, negated inner
//! product, and cosine distance. All kernels are pure functions; smaller is
//! always closer. Mismatched lengths are a programmer error and panic.

mod cosine;
mod ip;
mod l2;

pub use cosine::Cosine;
pub use ip::InnerProduct;
pub use l2::L2;

use serde::{Deserialize, Serialize};

/// A distance function over `f32` slices.
///
/// Implementations must be pure and must treat a smaller return value as
/// "closer".
pub trait Metric {
    /// Computes the distance between two equal-length vectors.
    ///
    /// # Panics
    ///
    /// Panics if `a` and `b` have different lengths.
    fn distance(a: &[f32], b: &[f32]) -> f32;
}

/// Runtime-selectable distance metric.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DistanceMetric {
    /// Squared Euclidean distance.
    L2,
    /// Negated inner product, so that larger dot products rank closer.
    InnerProduct,
    /// `1 - cos(a, b)`, with an epsilon guard against zero-norm vectors.
    Cosine,
}

impl Default for DistanceMetric {
    fn default() -> Self {
        DistanceMetric::L2
    }
}

impl DistanceMetric {
    /// Dispatches to the kernel for this metric.
    ///
    /// # Panics
    ///
    /// Panics if `a` and `b` have different lengths.
    #[inline]
    #[must_use]
    pub fn distance(self, a: &[f32], b: &[f32]) -> f32 {
        match self {
            DistanceMetric::L2 => L2::distance(a, b),
            DistanceMetric::InnerProduct => InnerProduct::distance(a, b),
            DistanceMetric::Cosine => Cosine::distance(a, b),
        }
    }

    /// Short lowercase name, used in config files and log lines.
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            DistanceMetric::L2 => "l2",
            DistanceMetric::InnerProduct => "inner_product",
            DistanceMetric::Cosine => "cosine",
        }
    }
}

impl std::fmt::Display for DistanceMetric {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}
