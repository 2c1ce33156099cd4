//! Scalar quantization.

use super::{pack_codes, unpack_codes, QuantizationError, QuantizationKind, Quantizer, QuantizerConfig};
use crate::cancel::CancelToken;
use serde::{Deserialize, Serialize};

/// Scalar quantizer.
///
/// Maps each component to a `bits`-wide integer with a per-component affine
/// transform. Training observes per-component min/max and extends the range
/// symmetrically about zero, so 0.0 always encodes exactly and sign
/// information survives aggressive widths.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScalarQuantizer {
    config: QuantizerConfig,
    /// Per-component half-range: component i maps from `[-bounds[i], bounds[i]]`.
    bounds: Vec<f32>,
    trained: bool,
}

impl ScalarQuantizer {
    /// Creates an untrained scalar quantizer.
    pub fn new(config: &QuantizerConfig) -> Result<Self, QuantizationError> {
        if config.kind != QuantizationKind::Scalar {
            return Err(QuantizationError::InvalidConfig(format!(
                "expected scalar config, got {}",
                config.kind
            )));
        }
        config.validate()?;
        Ok(Self {
            config: config.clone(),
            bounds: Vec::new(),
            trained: false,
        })
    }

    fn levels(&self) -> u16 {
        (1u16 << self.config.bits) - 1
    }

    fn check_trained(&self) -> Result<(), QuantizationError> {
        if self.trained {
            Ok(())
        } else {
            Err(QuantizationError::Untrained)
        }
    }

    fn check_dimension(&self, len: usize) -> Result<(), QuantizationError> {
        if len == self.config.dimension {
            Ok(())
        } else {
            Err(QuantizationError::DimensionMismatch {
                expected: self.config.dimension,
                actual: len,
            })
        }
    }

    fn check_code(&self, code: &[u8]) -> Result<(), QuantizationError> {
        let expected = self.code_len();
        if code.len() == expected {
            Ok(())
        } else {
            Err(QuantizationError::InvalidCode {
                expected,
                actual: code.len(),
            })
        }
    }
}

impl Quantizer for ScalarQuantizer {
    fn configure(&mut self, config: &QuantizerConfig) -> Result<(), QuantizationError> {
        let fresh = Self::new(config)?;
        *self = fresh;
        Ok(())
    }

    fn train(
        &mut self,
        vectors: &[Vec<f32>],
        cancel: &CancelToken,
    ) -> Result<(), QuantizationError> {
        if vectors.is_empty() {
            return Err(QuantizationError::InsufficientTrainingData { needed: 1, got: 0 });
        }
        if cancel.is_cancelled() {
            return Err(QuantizationError::Cancelled);
        }

        let dim = self.config.dimension;
        let mut bounds = vec![0.0f32; dim];
        for v in vectors {
            self.check_dimension(v.len())?;
            for (bound, &x) in bounds.iter_mut().zip(v.iter()) {
                *bound = bound.max(x.abs());
            }
        }
        // Degenerate all-zero components still need a non-zero range.
        for bound in &mut bounds {
            if *bound < f32::EPSILON {
                *bound = 1.0;
            }
        }

        self.bounds = bounds;
        self.trained = true;
        Ok(())
    }

    fn compress(&self, vector: &[f32]) -> Result<Vec<u8>, QuantizationError> {
        self.check_trained()?;
        self.check_dimension(vector.len())?;
        let levels = f32::from(self.levels());
        let mut codes = Vec::with_capacity(vector.len());
        for (&x, &bound) in vector.iter().zip(self.bounds.iter()) {
            let norm = (x + bound) / (2.0 * bound);
            let q = (norm * levels).round().clamp(0.0, levels);
            #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
            codes.push(q as u16);
        }
        Ok(pack_codes(&codes, self.config.bits))
    }

    fn decompress(&self, code: &[u8]) -> Result<Vec<f32>, QuantizationError> {
        self.check_trained()?;
        self.check_code(code)?;
        let levels = f32::from(self.levels());
        let codes = unpack_codes(code, self.config.dimension, self.config.bits);
        let mut out = Vec::with_capacity(self.config.dimension);
        for (&q, &bound) in codes.iter().zip(self.bounds.iter()) {
            let norm = f32::from(q) / levels;
            out.push(norm * 2.0 * bound - bound);
        }
        Ok(out)
    }

    fn distance(&self, a: &[u8], b: &[u8]) -> Result<f32, QuantizationError> {
        let va = self.decompress(a)?;
        let vb = self.decompress(b)?;
        let mut sum = 0.0f32;
        for (x, y) in va.iter().zip(vb.iter()) {
            let d = x - y;
            sum += d * d;
        }
        Ok(sum.sqrt())
    }

    fn distance_to_query(&self, code: &[u8], query: &[f32]) -> Result<f32, QuantizationError> {
        self.check_dimension(query.len())?;
        let v = self.decompress(code)?;
        let mut sum = 0.0f32;
        for (x, y) in v.iter().zip(query.iter()) {
            let d = x - y;
            sum += d * d;
        }
        Ok(sum.sqrt())
    }

    fn is_trained(&self) -> bool {
        self.trained
    }

    fn compression_ratio(&self) -> f32 {
        #[allow(clippy::cast_precision_loss)]
        let uncompressed = (self.config.dimension * 4) as f32;
        #[allow(clippy::cast_precision_loss)]
        let compressed = self.code_len() as f32;
        uncompressed / compressed
    }

    fn memory_usage(&self) -> usize {
        std::mem::size_of::<Self>() + self.bounds.len() * 4
    }

    fn config(&self) -> &QuantizerConfig {
        &self.config
    }

    fn code_len(&self) -> usize {
        (self.config.dimension * self.config.bits as usize).div_ceil(8)
    }

    fn builtin_state(&self) -> Option<super::BuiltinQuantizer> {
        Some(super::BuiltinQuantizer::Scalar(self.clone()))
    }
}
