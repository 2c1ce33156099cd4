//! Product quantization.

use super::kmeans::{kmeans, nearest};
use super::{pack_codes, unpack_codes, QuantizationError, QuantizationKind, Quantizer, QuantizerConfig};
use crate::cancel::CancelToken;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};

/// Per-query lookup table of subvector distances.
///
/// `table[k * centroids + c]` holds the distance from the query's k-th
/// subvector to centroid `c` of codebook `k`. The full distance of a coded
/// vector is then `sqrt(sum_k table[k][code_k]^2)` — one lookup per subspace
/// instead of one full vector scan.
#[derive(Debug, Clone)]
pub struct DistanceTable {
    table: Vec<f32>,
    centroids: usize,
}

impl DistanceTable {
    /// Distance of the query to the vector encoded by `codes`.
    #[must_use]
    pub fn lookup(&self, codes: &[u16]) -> f32 {
        let mut sum = 0.0f32;
        for (k, &code) in codes.iter().enumerate() {
            let d = self.table[k * self.centroids + code as usize];
            sum += d * d;
        }
        sum.sqrt()
    }
}

/// Product quantizer.
///
/// Splits `dimension` into `subspaces` equal chunks and trains one codebook
/// of `2^bits` centroids per chunk via k-means. A vector compresses to one
/// code per subspace, packed LSB-first.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProductQuantizer {
    config: QuantizerConfig,
    /// `subspaces` codebooks, each `2^bits` centroids of `sub_dim` floats.
    codebooks: Vec<Vec<Vec<f32>>>,
    trained: bool,
}

impl ProductQuantizer {
    /// Creates an untrained product quantizer.
    pub fn new(config: &QuantizerConfig) -> Result<Self, QuantizationError> {
        if config.kind != QuantizationKind::Product {
            return Err(QuantizationError::InvalidConfig(format!(
                "expected product config, got {}",
                config.kind
            )));
        }
        config.validate()?;
        Ok(Self {
            config: config.clone(),
            codebooks: Vec::new(),
            trained: false,
        })
    }

    fn sub_dim(&self) -> usize {
        self.config.dimension / self.config.subspaces
    }

    fn centroid_count(&self) -> usize {
        1usize << self.config.bits
    }

    fn check_trained(&self) -> Result<(), QuantizationError> {
        if self.trained {
            Ok(())
        } else {
            Err(QuantizationError::Untrained)
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

    /// Raw (unpacked) codes for one vector.
    fn encode(&self, vector: &[f32]) -> Vec<u16> {
        let sub_dim = self.sub_dim();
        let mut codes = Vec::with_capacity(self.config.subspaces);
        for (k, chunk) in vector.chunks_exact(sub_dim).enumerate() {
            let (idx, _) = nearest(chunk, &self.codebooks[k]);
            #[allow(clippy::cast_possible_truncation)]
            codes.push(idx as u16);
        }
        codes
    }

    /// Builds the per-query distance table.
    pub fn query_table(&self, query: &[f32]) -> Result<DistanceTable, QuantizationError> {
        self.check_trained()?;
        if query.len() != self.config.dimension {
            return Err(QuantizationError::DimensionMismatch {
                expected: self.config.dimension,
                actual: query.len(),
            });
        }
        let sub_dim = self.sub_dim();
        let centroids = self.centroid_count();
        let mut table = vec![0.0f32; self.config.subspaces * centroids];
        for (k, chunk) in query.chunks_exact(sub_dim).enumerate() {
            for (c, centroid) in self.codebooks[k].iter().enumerate() {
                let mut sum = 0.0f32;
                for (x, y) in chunk.iter().zip(centroid.iter()) {
                    let d = x - y;
                    sum += d * d;
                }
                table[k * centroids + c] = sum.sqrt();
            }
        }
        Ok(DistanceTable { table, centroids })
    }

    /// Distance via a prebuilt table. The batch path for cell scans.
    pub fn distance_with_table(
        &self,
        table: &DistanceTable,
        code: &[u8],
    ) -> Result<f32, QuantizationError> {
        self.check_code(code)?;
        let codes = unpack_codes(code, self.config.subspaces, self.config.bits);
        Ok(table.lookup(&codes))
    }
}

impl Quantizer for ProductQuantizer {
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
        let centroids = self.centroid_count();
        if vectors.len() < centroids {
            return Err(QuantizationError::InsufficientTrainingData {
                needed: centroids,
                got: vectors.len(),
            });
        }
        for v in vectors {
            if v.len() != self.config.dimension {
                return Err(QuantizationError::DimensionMismatch {
                    expected: self.config.dimension,
                    actual: v.len(),
                });
            }
        }

        let sub_dim = self.sub_dim();
        let mut rng = ChaCha8Rng::seed_from_u64(0x5142);
        let mut codebooks = Vec::with_capacity(self.config.subspaces);

        for k in 0..self.config.subspaces {
            // Each subspace trains independently; cancellation is observed
            // at subspace boundaries as well as inside kmeans.
            if cancel.is_cancelled() {
                return Err(QuantizationError::Cancelled);
            }
            let start = k * sub_dim;
            let slices: Vec<&[f32]> = vectors.iter().map(|v| &v[start..start + sub_dim]).collect();
            let codebook = kmeans(&slices, centroids, &mut rng, cancel)?;
            codebooks.push(codebook);
        }

        self.codebooks = codebooks;
        self.trained = true;
        Ok(())
    }

    fn compress(&self, vector: &[f32]) -> Result<Vec<u8>, QuantizationError> {
        self.check_trained()?;
        if vector.len() != self.config.dimension {
            return Err(QuantizationError::DimensionMismatch {
                expected: self.config.dimension,
                actual: vector.len(),
            });
        }
        Ok(pack_codes(&self.encode(vector), self.config.bits))
    }

    fn decompress(&self, code: &[u8]) -> Result<Vec<f32>, QuantizationError> {
        self.check_trained()?;
        self.check_code(code)?;
        let codes = unpack_codes(code, self.config.subspaces, self.config.bits);
        let mut out = Vec::with_capacity(self.config.dimension);
        for (k, &c) in codes.iter().enumerate() {
            out.extend_from_slice(&self.codebooks[k][c as usize]);
        }
        Ok(out)
    }

    fn distance(&self, a: &[u8], b: &[u8]) -> Result<f32, QuantizationError> {
        self.check_trained()?;
        self.check_code(a)?;
        self.check_code(b)?;
        let ca = unpack_codes(a, self.config.subspaces, self.config.bits);
        let cb = unpack_codes(b, self.config.subspaces, self.config.bits);
        let mut sum = 0.0f32;
        for (k, (&x, &y)) in ca.iter().zip(cb.iter()).enumerate() {
            let cx = &self.codebooks[k][x as usize];
            let cy = &self.codebooks[k][y as usize];
            for (a_i, b_i) in cx.iter().zip(cy.iter()) {
                let d = a_i - b_i;
                sum += d * d;
            }
        }
        Ok(sum.sqrt())
    }

    fn distance_to_query(&self, code: &[u8], query: &[f32]) -> Result<f32, QuantizationError> {
        let table = self.query_table(query)?;
        self.distance_with_table(&table, code)
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
        let centroid_bytes: usize = self
            .codebooks
            .iter()
            .map(|cb| cb.iter().map(|c| c.len() * 4).sum::<usize>())
            .sum();
        std::mem::size_of::<Self>() + centroid_bytes
    }

    fn config(&self) -> &QuantizerConfig {
        &self.config
    }

    fn code_len(&self) -> usize {
        (self.config.subspaces * self.config.bits as usize).div_ceil(8)
    }

    fn builtin_state(&self) -> Option<super::BuiltinQuantizer> {
        Some(super::BuiltinQuantizer::Product(self.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::Rng;

    fn training_set(n: usize, dim: usize) -> Vec<Vec<f32>> {
        let mut rng = ChaCha8Rng::seed_from_u64(99);
        (0..n)
            .map(|_| (0..dim).map(|_| rng.gen_range(-1.0f32..1.0)).collect())
            .collect()
    }

    fn trained(dim: usize, subspaces: usize, bits: u8) -> ProductQuantizer {
        let config = QuantizerConfig::product(dim, subspaces, bits);
        let mut pq = ProductQuantizer::new(&config).expect("config rejected");
        let data = training_set(300, dim);
        pq.train(&data, &CancelToken::new()).expect("training failed");
        pq
    }

    #[test]
    fn test_untrained_rejects_codec_calls() {
        let pq = ProductQuantizer::new(&QuantizerConfig::product(8, 2, 4)).expect("new");
        assert!(!pq.is_trained());
        assert!(matches!(
            pq.compress(&[0.0; 8]),
            Err(QuantizationError::Untrained)
        ));
    }

    #[test]
    fn test_indivisible_dimension_rejected() {
        let result = ProductQuantizer::new(&QuantizerConfig::product(10, 3, 4));
        assert!(matches!(result, Err(QuantizationError::InvalidConfig(_))));
    }

    #[test]
    fn test_code_len() {
        let pq = trained(16, 4, 8);
        assert_eq!(pq.code_len(), 4);
        let pq = trained(16, 4, 6); // 24 bits -> 3 bytes
        assert_eq!(pq.code_len(), 3);
    }

    #[test]
    fn test_roundtrip_error_is_bounded() {
        let pq = trained(16, 4, 8);
        let data = training_set(20, 16);
        for v in &data {
            let code = pq.compress(v).expect("compress");
            let back = pq.decompress(&code).expect("decompress");
            assert_eq!(back.len(), v.len());
            let err: f32 = v
                .iter()
                .zip(back.iter())
                .map(|(a, b)| (a - b) * (a - b))
                .sum::<f32>()
                .sqrt();
            // Random data in [-1, 1]^16 against 256 centroids per 4-dim
            // subspace keeps reconstruction error well under the diameter.
            assert!(err < 2.0, "reconstruction error too large: {err}");
        }
    }

    #[test]
    fn test_distance_to_query_matches_table_path() {
        let pq = trained(16, 4, 8);
        let data = training_set(10, 16);
        let query = &data[0];
        let table = pq.query_table(query).expect("table");
        for v in &data {
            let code = pq.compress(v).expect("compress");
            let direct = pq.distance_to_query(&code, query).expect("direct");
            let via_table = pq.distance_with_table(&table, &code).expect("table lookup");
            assert!((direct - via_table).abs() < 1e-5);
        }
    }

    #[test]
    fn test_distance_to_query_approximates_true_distance() {
        let pq = trained(16, 4, 8);
        let data = training_set(20, 16);
        let query = &data[0];
        for v in &data {
            let code = pq.compress(v).expect("compress");
            let approx = pq.distance_to_query(&code, query).expect("distance");
            let exact: f32 = v
                .iter()
                .zip(query.iter())
                .map(|(a, b)| (a - b) * (a - b))
                .sum::<f32>()
                .sqrt();
            assert!((approx - exact).abs() < 1.5, "approx={approx} exact={exact}");
        }
    }

    #[test]
    fn test_symmetric_distance_zero_for_same_code() {
        let pq = trained(8, 2, 4);
        let v = training_set(1, 8).remove(0);
        let code = pq.compress(&v).expect("compress");
        let d = pq.distance(&code, &code).expect("distance");
        assert!(d.abs() < 1e-6);
    }

    #[test]
    fn test_compression_ratio() {
        let pq = trained(16, 4, 8);
        // 64 bytes of f32 -> 4 bytes of codes
        assert!((pq.compression_ratio() - 16.0).abs() < f32::EPSILON);
    }
}
