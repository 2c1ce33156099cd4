//! Unified error hierarchy for vecbase.
//!
//! Each subsystem defines its own `thiserror` enum (`IndexError`, `WalError`,
//! `QuantizationError`, `FilterError`, `MemoryError`); this module defines
//! [`Error`], the top-level type returned by the collection API, wrapping all
//! component errors with the failing component preserved.

use crate::filter::FilterError;
use crate::index::IndexError;
use crate::memory::MemoryError;
use crate::quant::QuantizationError;
use crate::wal::WalError;
use thiserror::Error;

/// The unified vecbase error type.
#[derive(Debug, Error)]
pub enum Error {
    /// The collection has been closed; no further operations are accepted.
    #[error("collection is closed")]
    Closed,

    /// No entry with the given id exists.
    #[error("entry not found: {id}")]
    NotFound {
        /// The id that was requested.
        id: String,
    },

    /// Vector length does not match the collection dimension.
    #[error("dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch {
        /// Configured dimension.
        expected: usize,
        /// Dimension of the offending vector.
        actual: usize,
    },

    /// Invalid configuration or argument.
    #[error("invalid config: {0}")]
    InvalidConfig(String),

    /// Metadata failed schema validation.
    #[error("schema violation: {0}")]
    SchemaViolation(String),

    /// Input/output errors (filesystem).
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Index errors (graph, persistence, quantization inside the index).
    #[error(transparent)]
    Index(#[from] IndexError),

    /// Write-ahead log errors.
    #[error(transparent)]
    Wal(#[from] WalError),

    /// Quantizer errors.
    #[error(transparent)]
    Quantization(#[from] QuantizationError),

    /// Filter validation or evaluation errors.
    #[error(transparent)]
    Filter(#[from] FilterError),

    /// Memory manager errors, including limit and pressure conditions.
    #[error(transparent)]
    Memory(#[from] MemoryError),

    /// An operation was cancelled via its cancellation token.
    #[error("operation cancelled")]
    Cancelled,

    /// Writes are rejected while the engine sheds load.
    #[error("backpressure active: {0}")]
    BackpressureActive(String),
}

impl Error {
    /// Returns true if this error indicates on-disk corruption.
    ///
    /// Corruption is never auto-repaired; callers decide whether to fall back
    /// to an earlier snapshot or rebuild from the WAL.
    #[must_use]
    pub fn is_corruption(&self) -> bool {
        match self {
            Error::Index(e) => e.is_corruption(),
            Error::Wal(e) => matches!(e, WalError::Corruption { .. }),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_contains_context() {
        let err = Error::NotFound { id: "abc".into() };
        assert!(err.to_string().contains("abc"));

        let err = Error::DimensionMismatch {
            expected: 128,
            actual: 64,
        };
        assert!(err.to_string().contains("128"));
        assert!(err.to_string().contains("64"));
    }

    #[test]
    fn test_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<Error>();
    }
}
