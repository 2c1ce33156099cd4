//! Vector quantization.
//!
//! Quantizers trade accuracy for memory: a trained quantizer maps each
//! `f32` vector to a compact byte code and computes distances directly over
//! codes. Two implementations ship in-crate — product quantization
//! ([`ProductQuantizer`]) and scalar quantization ([`ScalarQuantizer`]) —
//! and a process-local [`registry`] lets embedders plug in their own.

mod kmeans;
mod pq;
pub mod registry;
mod sq;

pub use kmeans::{kmeans, nearest};
pub use pq::{DistanceTable, ProductQuantizer};
pub use sq::ScalarQuantizer;

use crate::cancel::CancelToken;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors from quantizer configuration, training and codec paths.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum QuantizationError {
    /// Operation requires configuration first.
    #[error("quantizer is not configured")]
    Unconfigured,

    /// Operation requires a trained quantizer.
    #[error("quantizer is not trained")]
    Untrained,

    /// Vector length does not match the configured dimension.
    #[error("dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch {
        /// Configured dimension.
        expected: usize,
        /// Length of the offending vector.
        actual: usize,
    },

    /// A compressed code has the wrong length for this configuration.
    #[error("invalid code: expected {expected} bytes, got {actual}")]
    InvalidCode {
        /// Expected code length in bytes.
        expected: usize,
        /// Observed code length.
        actual: usize,
    },

    /// Invalid configuration parameter.
    #[error("invalid quantizer config: {0}")]
    InvalidConfig(String),

    /// Training requires more vectors than were supplied.
    #[error("insufficient training data: need at least {needed}, got {got}")]
    InsufficientTrainingData {
        /// Minimum number of training vectors.
        needed: usize,
        /// Number supplied.
        got: usize,
    },

    /// A factory for this kind is already registered.
    #[error("quantizer factory already registered: {0}")]
    DuplicateFactory(QuantizationKind),

    /// No factory is registered for this kind.
    #[error("unknown quantizer kind: {0}")]
    UnknownKind(QuantizationKind),

    /// Training was cancelled.
    #[error("training cancelled")]
    Cancelled,
}

/// The kind of quantizer to construct.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuantizationKind {
    /// Product quantization: split dimensions into subspaces, one codebook
    /// per subspace.
    Product,
    /// Scalar quantization: per-component affine mapping to small integers.
    Scalar,
}

impl std::fmt::Display for QuantizationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            QuantizationKind::Product => f.write_str("product"),
            QuantizationKind::Scalar => f.write_str("scalar"),
        }
    }
}

/// Quantizer configuration.
///
/// `subspaces` only applies to product quantization and must divide
/// `dimension` evenly. `bits` is the per-code width and must lie in `1..=8`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuantizerConfig {
    /// Which quantizer family to use.
    pub kind: QuantizationKind,
    /// Vector dimensionality.
    pub dimension: usize,
    /// Number of subspaces (product quantization only).
    #[serde(default = "default_subspaces")]
    pub subspaces: usize,
    /// Bits per code.
    #[serde(default = "default_bits")]
    pub bits: u8,
}

fn default_subspaces() -> usize {
    8
}

fn default_bits() -> u8 {
    8
}

impl QuantizerConfig {
    /// Product-quantization config with `subspaces` codebooks of `2^bits`
    /// centroids each.
    #[must_use]
    pub fn product(dimension: usize, subspaces: usize, bits: u8) -> Self {
        Self {
            kind: QuantizationKind::Product,
            dimension,
            subspaces,
            bits,
        }
    }

    /// Scalar-quantization config with `bits` per component.
    #[must_use]
    pub fn scalar(dimension: usize, bits: u8) -> Self {
        Self {
            kind: QuantizationKind::Scalar,
            dimension,
            subspaces: 1,
            bits,
        }
    }

    /// Validates structural constraints shared by all quantizers.
    pub fn validate(&self) -> Result<(), QuantizationError> {
        if self.dimension == 0 {
            return Err(QuantizationError::InvalidConfig(
                "dimension must be > 0".into(),
            ));
        }
        if self.bits == 0 || self.bits > 8 {
            return Err(QuantizationError::InvalidConfig(format!(
                "bits must be in 1..=8, got {}",
                self.bits
            )));
        }
        if self.kind == QuantizationKind::Product {
            if self.subspaces == 0 {
                return Err(QuantizationError::InvalidConfig(
                    "subspaces must be > 0".into(),
                ));
            }
            if self.dimension % self.subspaces != 0 {
                return Err(QuantizationError::InvalidConfig(format!(
                    "dimension {} is not divisible by {} subspaces",
                    self.dimension, self.subspaces
                )));
            }
        }
        Ok(())
    }
}

/// The quantizer capability.
///
/// Lifecycle: construct (possibly via the [`registry`]), [`configure`], then
/// [`train`] on a representative sample before any codec call. `distance`
/// operates over two codes; `distance_to_query` compares a code against an
/// uncompressed query. Both return the Euclidean distance between the
/// reconstructions.
///
/// [`configure`]: Quantizer::configure
/// [`train`]: Quantizer::train
pub trait Quantizer: Send + Sync {
    /// Applies (or re-applies) a configuration. Resets training state.
    fn configure(&mut self, config: &QuantizerConfig) -> Result<(), QuantizationError>;

    /// Trains on a sample of vectors. Checks `cancel` at iteration
    /// boundaries.
    fn train(&mut self, vectors: &[Vec<f32>], cancel: &CancelToken)
        -> Result<(), QuantizationError>;

    /// Compresses one vector into its byte code.
    fn compress(&self, vector: &[f32]) -> Result<Vec<u8>, QuantizationError>;

    /// Reconstructs an approximation of the original vector.
    fn decompress(&self, code: &[u8]) -> Result<Vec<f32>, QuantizationError>;

    /// Distance between two codes.
    fn distance(&self, a: &[u8], b: &[u8]) -> Result<f32, QuantizationError>;

    /// Distance between a code and an uncompressed query vector.
    fn distance_to_query(&self, code: &[u8], query: &[f32]) -> Result<f32, QuantizationError>;

    /// True once training has completed.
    fn is_trained(&self) -> bool;

    /// Ratio of uncompressed to compressed bytes per vector.
    fn compression_ratio(&self) -> f32;

    /// Heap bytes held by the quantizer itself (codebooks, bounds).
    fn memory_usage(&self) -> usize;

    /// The active configuration.
    fn config(&self) -> &QuantizerConfig;

    /// Compressed size of one vector, in bytes.
    fn code_len(&self) -> usize;

    /// Serializable state, for quantizers that ship in-crate.
    ///
    /// Index snapshots embed this blob so a reopened index decodes the same
    /// codes. Externally-registered quantizers return `None` and are not
    /// persisted with the index.
    fn builtin_state(&self) -> Option<BuiltinQuantizer> {
        None
    }
}

/// Snapshot of an in-crate quantizer, embeddable in index files.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum BuiltinQuantizer {
    /// A trained (or fresh) product quantizer.
    Product(ProductQuantizer),
    /// A trained (or fresh) scalar quantizer.
    Scalar(ScalarQuantizer),
}

impl BuiltinQuantizer {
    /// Rehydrates the trait object.
    #[must_use]
    pub fn into_boxed(self) -> Box<dyn Quantizer> {
        match self {
            BuiltinQuantizer::Product(pq) => Box::new(pq),
            BuiltinQuantizer::Scalar(sq) => Box::new(sq),
        }
    }
}

/// Packs `bits`-wide codes into bytes, least significant bit first.
pub(crate) fn pack_codes(codes: &[u16], bits: u8) -> Vec<u8> {
    let total_bits = codes.len() * bits as usize;
    let mut out = vec![0u8; total_bits.div_ceil(8)];
    let mut bit_pos = 0usize;
    for &code in codes {
        for b in 0..bits {
            if code & (1 << b) != 0 {
                out[bit_pos / 8] |= 1 << (bit_pos % 8);
            }
            bit_pos += 1;
        }
    }
    out
}

/// Unpacks `count` codes of `bits` width, least significant bit first.
pub(crate) fn unpack_codes(bytes: &[u8], count: usize, bits: u8) -> Vec<u16> {
    let mut out = Vec::with_capacity(count);
    let mut bit_pos = 0usize;
    for _ in 0..count {
        let mut code = 0u16;
        for b in 0..bits {
            let byte = bytes[bit_pos / 8];
            if byte & (1 << (bit_pos % 8)) != 0 {
                code |= 1 << b;
            }
            bit_pos += 1;
        }
        out.push(code);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_validation() {
        assert!(QuantizerConfig::product(128, 8, 8).validate().is_ok());
        assert!(QuantizerConfig::product(100, 7, 8).validate().is_err()); // 100 % 7 != 0
        assert!(QuantizerConfig::product(128, 8, 0).validate().is_err());
        assert!(QuantizerConfig::product(128, 8, 9).validate().is_err());
        assert!(QuantizerConfig::scalar(0, 8).validate().is_err());
    }

    #[test]
    fn test_pack_unpack_roundtrip_8bit() {
        let codes = vec![0u16, 1, 127, 255, 42];
        let packed = pack_codes(&codes, 8);
        assert_eq!(packed.len(), 5);
        assert_eq!(unpack_codes(&packed, codes.len(), 8), codes);
    }

    #[test]
    fn test_pack_unpack_roundtrip_odd_widths() {
        for bits in 1..=8u8 {
            let max = (1u16 << bits) - 1;
            let codes: Vec<u16> = (0..17).map(|i| i % (max + 1)).collect();
            let packed = pack_codes(&codes, bits);
            let expected_len = (codes.len() * bits as usize).div_ceil(8);
            assert_eq!(packed.len(), expected_len, "bits={bits}");
            assert_eq!(unpack_codes(&packed, codes.len(), bits), codes, "bits={bits}");
        }
    }

    #[test]
    fn test_pack_is_lsb_first() {
        // Code 0b101 with 3-bit width: bit 0 -> byte bit 0, bit 2 -> byte bit 2.
        let packed = pack_codes(&[0b101], 3);
        assert_eq!(packed, vec![0b101]);

        // Two 3-bit codes: second starts at bit 3.
        let packed = pack_codes(&[0b101, 0b011], 3);
        assert_eq!(packed, vec![0b101 | (0b011 << 3)]);
    }
}
