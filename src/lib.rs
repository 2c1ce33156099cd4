//! # vecbase
//!
//! An embeddable vector database: in-process storage for high-dimensional
//! float vectors plus metadata, approximate-nearest-neighbor search under a
//! configurable distance metric, and crash-safe persistence.
//!
//! ## Features
//!
//! - **HNSW graph index**: layered proximity graph with tunable
//!   recall/latency parameters and an atomic on-disk snapshot format.
//! - **Alternate indices**: brute-force `Flat` for small collections and
//!   `IVF-PQ` for very large ones, behind one [`index::VectorIndex`] contract.
//! - **Quantization**: product and scalar quantizers trading accuracy for
//!   memory, behind a pluggable registry.
//! - **Durability**: a framed, checksummed write-ahead log; every mutation is
//!   replayed on open.
//! - **Memory control**: usage accounting, pressure callbacks, LRU caching,
//!   and mmap offload for large indices.
//! - **Filtering**: a composable metadata filter algebra applied on top of
//!   ANN candidates.
//!
//! ## Example
//!
//! ```rust,no_run
//! use vecbase::collection::{Collection, CollectionConfig};
//! use vecbase::metadata::Value;
//! use vecbase::metric::DistanceMetric;
//!
//! let config = CollectionConfig::new(3).with_metric(DistanceMetric::Cosine);
//! let coll = Collection::open("./data/demo", config).expect("open failed");
//!
//! coll.insert("a", &[1.0, 0.0, 0.0], Default::default()).expect("insert failed");
//!
//! let hits = coll.search(&[1.0, 0.0, 0.0], 1).expect("search failed");
//! assert_eq!(hits.results[0].id, "a");
//! ```

#![warn(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::too_many_lines)]

/// Unified error handling.
pub mod error;

/// Cooperative cancellation for long-running work.
pub mod cancel;

/// Process-wide atomic counters and latency histogram.
pub mod metrics;

/// Distance kernels.
pub mod metric;

/// Metadata values and schema validation.
pub mod metadata;

/// Vector quantization (product and scalar) and the quantizer registry.
pub mod quant;

/// Write-ahead log.
pub mod wal;

/// In-memory entry store backed by the WAL.
pub mod store;

/// HNSW graph index.
pub mod hnsw;

/// Index contract, Flat and IVF-PQ implementations.
pub mod index;

/// Memory accounting, LRU cache, mmap files, pressure recovery.
pub mod memory;

/// Metadata filter algebra.
pub mod filter;

/// Query builder and search pipeline.
pub mod query;

/// Collection orchestrator.
pub mod collection;

pub use collection::{Collection, CollectionConfig};
pub use error::Error;
pub use filter::Filter;
pub use hnsw::{HnswConfig, HnswIndex};
pub use index::{IndexKind, Neighbor, SearchOptions, VectorIndex};
pub use metadata::Value;
pub use metric::DistanceMetric;
pub use quant::{QuantizationKind, Quantizer, QuantizerConfig};
pub use query::{QueryBuilder, SearchHit, SearchResponse};
pub use store::VectorEntry;

/// The crate version string.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Returns the crate version string.
#[must_use]
pub fn version() -> &'static str {
    VERSION
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_not_empty() {
        assert!(!version().is_empty());
    }
}
