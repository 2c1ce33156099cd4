//! Memory accounting and control.
//!
//! The manager budgets RAM across four buckets — heap-resident index bytes,
//! cache bytes, quantized bytes, and memory-mapped bytes — and reacts to
//! pressure: firing callbacks, evicting caches, offloading large structures
//! to mmap, and escalating through a staged recovery when things get
//! critical. Only heap-resident bytes count toward the limit; mmap pages are
//! the OS's problem.

pub mod cache;
pub mod manager;
pub mod mmap;
pub mod recovery;

pub use cache::{CacheStats, LruCache};
pub use manager::{
    EvictableCache, Mappable, MemoryManager, MemoryManagerConfig, MemoryUsage,
};
pub use mmap::{MmapFile, MmapManager};
pub use recovery::{RecoveryConfig, RecoveryManager, RecoveryReport, RecoveryStage};

use thiserror::Error;

/// Memory subsystem errors.
#[derive(Debug, Error)]
pub enum MemoryError {
    /// I/O failure on a memory-mapped file.
    #[error("mmap io error: {0}")]
    Io(#[from] std::io::Error),

    /// Heap usage exceeds the configured limit and eviction could not bring
    /// it back under.
    #[error("memory limit exceeded: {usage} bytes used, limit {limit}")]
    LimitExceeded {
        /// Current heap usage.
        usage: usize,
        /// The configured limit.
        limit: usize,
    },

    /// Usage crossed the critical pressure threshold.
    #[error("memory pressure critical: {usage} of {limit} bytes")]
    PressureCritical {
        /// Current heap usage.
        usage: usize,
        /// The configured limit.
        limit: usize,
    },

    /// Staged recovery ran out of stages without relieving pressure.
    #[error("memory recovery failed: {0}")]
    RecoveryFailed(String),

    /// Operation on a closed mmap file.
    #[error("mmap file is closed")]
    MmapClosed,

    /// Recovery was cancelled mid-backoff.
    #[error("memory recovery cancelled")]
    Cancelled,
}

/// Pressure bands over `heap_usage / limit`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum PressureLevel {
    /// Below every threshold.
    None,
    /// Usage at or above 70% of the limit.
    Low,
    /// Usage at or above 80%.
    Moderate,
    /// Usage at or above 90%.
    High,
    /// Usage at or above 95%.
    Critical,
}

impl PressureLevel {
    /// Threshold ratios, aligned with the level order.
    pub const THRESHOLDS: [(PressureLevel, f64); 4] = [
        (PressureLevel::Critical, 0.95),
        (PressureLevel::High, 0.90),
        (PressureLevel::Moderate, 0.80),
        (PressureLevel::Low, 0.70),
    ];

    /// Classifies a usage ratio.
    #[must_use]
    pub fn from_ratio(ratio: f64) -> Self {
        for (level, threshold) in Self::THRESHOLDS {
            if ratio >= threshold {
                return level;
            }
        }
        PressureLevel::None
    }
}

impl std::fmt::Display for PressureLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            PressureLevel::None => "none",
            PressureLevel::Low => "low",
            PressureLevel::Moderate => "moderate",
            PressureLevel::High => "high",
            PressureLevel::Critical => "critical",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pressure_bands() {
        assert_eq!(PressureLevel::from_ratio(0.0), PressureLevel::None);
        assert_eq!(PressureLevel::from_ratio(0.69), PressureLevel::None);
        assert_eq!(PressureLevel::from_ratio(0.70), PressureLevel::Low);
        assert_eq!(PressureLevel::from_ratio(0.85), PressureLevel::Moderate);
        assert_eq!(PressureLevel::from_ratio(0.90), PressureLevel::High);
        assert_eq!(PressureLevel::from_ratio(0.95), PressureLevel::Critical);
        assert_eq!(PressureLevel::from_ratio(2.0), PressureLevel::Critical);
    }

    #[test]
    fn test_levels_are_ordered() {
        assert!(PressureLevel::None < PressureLevel::Low);
        assert!(PressureLevel::Low < PressureLevel::Moderate);
        assert!(PressureLevel::Moderate < PressureLevel::High);
        assert!(PressureLevel::High < PressureLevel::Critical);
    }
}
