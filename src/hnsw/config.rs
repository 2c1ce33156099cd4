//! HNSW parameters.

use crate::metric::DistanceMetric;
use serde::{Deserialize, Serialize};

/// Hard cap on layer height. Levels above this are clamped; with the default
/// multiplier the probability of drawing 32 is below 2^-32.
pub const MAX_LEVEL: u8 = 32;

/// HNSW algorithm parameters.
///
/// # Parameter guidelines (from the paper)
///
/// - `m`: 12–48 for high recall, 4–8 for speed.
/// - `ef_construction`: higher = better graph quality, slower build.
/// - `ef_search`: higher = better recall, slower query. The only parameter
///   that may change after the first insert.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct HnswConfig {
    /// Vector dimensionality.
    pub dimension: usize,

    /// Distance metric.
    pub metric: DistanceMetric,

    /// Max links per node on layers above 0.
    pub m: usize,

    /// Max links per node on layer 0. Conventionally `2 * m`.
    pub m0: usize,

    /// Beam width while building the graph.
    pub ef_construction: usize,

    /// Default beam width at query time. Effective width is
    /// `max(ef_search, k)`.
    pub ef_search: usize,

    /// Level multiplier `m_L` for the geometric layer draw
    /// `floor(-ln(U) * m_L)`.
    pub level_mult: f64,

    /// RNG seed, fixed so rebuilds are reproducible.
    pub seed: u64,
}

impl HnswConfig {
    /// Defaults for a given dimension: `m = 16`, `m0 = 32`,
    /// `ef_construction = 200`, `ef_search = 50`, `m_L = 1/ln 2`.
    #[must_use]
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension,
            metric: DistanceMetric::L2,
            m: 16,
            m0: 32,
            ef_construction: 200,
            ef_search: 50,
            level_mult: 1.0 / std::f64::consts::LN_2,
            seed: 0x9E37_79B9,
        }
    }

    /// Sets the metric.
    #[must_use]
    pub fn with_metric(mut self, metric: DistanceMetric) -> Self {
        self.metric = metric;
        self
    }

    /// Sets `m` and derives `m0 = 2 * m`.
    #[must_use]
    pub fn with_m(mut self, m: usize) -> Self {
        self.m = m;
        self.m0 = m * 2;
        self
    }

    /// Sets the construction beam width.
    #[must_use]
    pub fn with_ef_construction(mut self, ef: usize) -> Self {
        self.ef_construction = ef;
        self
    }

    /// Sets the default query beam width.
    #[must_use]
    pub fn with_ef_search(mut self, ef: usize) -> Self {
        self.ef_search = ef;
        self
    }

    /// Link cap for a layer: `m0` at the base, `m` above.
    #[must_use]
    pub fn max_links(&self, level: u8) -> usize {
        if level == 0 {
            self.m0
        } else {
            self.m
        }
    }

    /// Structural validation.
    pub fn validate(&self) -> Result<(), String> {
        if self.dimension == 0 {
            return Err("dimension must be > 0".into());
        }
        if self.m <= 1 {
            return Err(format!("m must be > 1, got {}", self.m));
        }
        if self.m0 < self.m {
            return Err(format!("m0 must be >= m, got {} < {}", self.m0, self.m));
        }
        if self.ef_construction == 0 {
            return Err("ef_construction must be > 0".into());
        }
        if self.level_mult <= 0.0 {
            return Err("level_mult must be positive".into());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_valid() {
        assert!(HnswConfig::new(128).validate().is_ok());
    }

    #[test]
    fn test_with_m_derives_m0() {
        let config = HnswConfig::new(16).with_m(8);
        assert_eq!(config.m0, 16);
        assert_eq!(config.max_links(0), 16);
        assert_eq!(config.max_links(1), 8);
        assert_eq!(config.max_links(5), 8);
    }

    #[test]
    fn test_invalid_params_rejected() {
        assert!(HnswConfig::new(0).validate().is_err());
        let mut config = HnswConfig::new(8);
        config.m = 1;
        assert!(config.validate().is_err());
        let mut config = HnswConfig::new(8);
        config.m0 = config.m - 1;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_default_level_mult_is_inverse_ln2() {
        let config = HnswConfig::new(8);
        assert!((config.level_mult - 1.442_695).abs() < 1e-3);
    }
}
