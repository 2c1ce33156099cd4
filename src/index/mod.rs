//! The index contract and its implementations.
//!
//! Three index types share one trait: [`HnswIndex`](crate::hnsw::HnswIndex)
//! for the general case, [`FlatIndex`] brute force for small collections,
//! and [`IvfPqIndex`] for very large ones. [`IndexKind::auto_select`] picks
//! between them from the expected collection size.

pub(crate) mod container;
mod flat;
mod ivf;

pub use flat::FlatIndex;
pub use ivf::{IvfPqConfig, IvfPqIndex};

use crate::quant::QuantizationError;
use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

/// Errors from index operations.
#[derive(Debug, Error)]
pub enum IndexError {
    /// Vector length does not match the index dimension.
    #[error("dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch {
        /// Configured dimension.
        expected: usize,
        /// Length of the offending vector.
        actual: usize,
    },

    /// No vector with this id.
    #[error("id not found in index: {id}")]
    NotFound {
        /// The missing id.
        id: String,
    },

    /// The id is already present.
    #[error("duplicate id: {id}")]
    DuplicateId {
        /// The conflicting id.
        id: String,
    },

    /// Invalid parameter.
    #[error("invalid index config: {0}")]
    InvalidConfig(String),

    /// On-disk state failed validation (bad magic, bad CRC, truncation).
    /// Never auto-repaired; the file on disk is left untouched.
    #[error("index corruption: {0}")]
    Corruption(String),

    /// I/O failure during save or load.
    #[error("index io error: {0}")]
    Io(#[from] std::io::Error),

    /// Quantizer failure inside the index.
    #[error(transparent)]
    Quantization(#[from] QuantizationError),

    /// The index was loaded from a legacy snapshot and rejects writes.
    #[error("index is read-only (legacy snapshot)")]
    ReadOnly,

    /// The index has been closed.
    #[error("index is closed")]
    Closed,
}

impl IndexError {
    /// True for magic/CRC/truncation failures.
    #[must_use]
    pub fn is_corruption(&self) -> bool {
        matches!(self, IndexError::Corruption(_))
    }
}

/// Which index implementation a collection uses.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IndexKind {
    /// Brute-force scan. Exact, O(n) per query.
    Flat,
    /// Hierarchical navigable small world graph.
    Hnsw,
    /// Inverted-file with product-quantized residuals.
    IvfPq,
}

impl IndexKind {
    /// Collection size below which brute force wins.
    pub const FLAT_THRESHOLD: usize = 10_000;

    /// Collection size below which HNSW is preferred over IVF-PQ.
    pub const HNSW_THRESHOLD: usize = 1_000_000;

    /// Picks an index type for an expected collection size.
    #[must_use]
    pub fn auto_select(expected_size: usize) -> Self {
        if expected_size < Self::FLAT_THRESHOLD {
            IndexKind::Flat
        } else if expected_size < Self::HNSW_THRESHOLD {
            IndexKind::Hnsw
        } else {
            IndexKind::IvfPq
        }
    }
}

impl std::fmt::Display for IndexKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            IndexKind::Flat => "flat",
            IndexKind::Hnsw => "hnsw",
            IndexKind::IvfPq => "ivf_pq",
        };
        f.write_str(name)
    }
}

/// One search hit: an id and its distance from the query.
#[derive(Clone, Debug, PartialEq)]
pub struct Neighbor {
    /// Entry id.
    pub id: String,
    /// Distance under the index metric; smaller is closer.
    pub distance: f32,
}

/// Per-query knobs.
#[derive(Clone, Debug, Default)]
pub struct SearchOptions {
    /// Overrides the index-level `ef_search` beam width (HNSW only).
    pub ef_search: Option<usize>,
    /// Overrides the number of probed cells (IVF-PQ only).
    pub n_probes: Option<usize>,
}

/// The contract all index implementations satisfy.
///
/// Callers serialise mutations externally (one writer at a time); searches
/// only need `&self` and may run concurrently with each other.
pub trait VectorIndex: Send + Sync {
    /// Adds a vector under `id`.
    fn insert(&mut self, id: &str, vector: &[f32]) -> Result<(), IndexError>;

    /// Returns up to `k` nearest neighbors, closest first. Equal distances
    /// tie-break by insertion order.
    fn search(
        &self,
        query: &[f32],
        k: usize,
        options: &SearchOptions,
    ) -> Result<Vec<Neighbor>, IndexError>;

    /// Removes `id` from the index.
    fn delete(&mut self, id: &str) -> Result<(), IndexError>;

    /// Number of live (non-deleted) vectors.
    fn len(&self) -> usize;

    /// True when no live vectors exist.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Approximate heap bytes held by the index.
    fn memory_usage(&self) -> usize;

    /// Atomically persists the index to `path`.
    fn save(&mut self, path: &Path) -> Result<(), IndexError>;

    /// Replaces in-memory state from a snapshot at `path`.
    fn load(&mut self, path: &Path) -> Result<(), IndexError>;

    /// Releases resources; subsequent operations fail with `Closed`.
    fn close(&mut self) -> Result<(), IndexError>;

    /// Which implementation this is.
    fn kind(&self) -> IndexKind;

    /// True when in-memory state has diverged from the last snapshot.
    fn is_dirty(&self) -> bool;

    /// Maintenance pass (e.g. tombstone compaction). Returns reclaimed
    /// slots; implementations without maintenance return 0.
    fn optimize(&mut self) -> Result<usize, IndexError> {
        Ok(0)
    }

    /// Adjusts the default query beam width, where the implementation has
    /// one.
    fn set_ef_search(&mut self, ef_search: usize) {
        let _ = ef_search;
    }
}

/// Validates a query's `k` and dimension before dispatch.
pub(crate) fn validate_query(
    query: &[f32],
    k: usize,
    dimension: usize,
) -> Result<(), IndexError> {
    if k == 0 {
        return Err(IndexError::InvalidConfig("k must be > 0".into()));
    }
    if query.len() != dimension {
        return Err(IndexError::DimensionMismatch {
            expected: dimension,
            actual: query.len(),
        });
    }
    Ok(())
}
