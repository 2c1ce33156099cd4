//! IVF-PQ: inverted file with product-quantized residuals.
//!
//! Vectors are bucketed into coarse cells by k-means; within a cell only the
//! PQ code of the residual (vector minus cell centroid) is kept. A query
//! probes the `n_probes` nearest cells and ranks their codes. Until enough
//! vectors arrive to train the coarse clustering, inserts buffer
//! uncompressed and searches fall back to a brute-force scan.

use super::container;
use super::{validate_query, IndexError, IndexKind, Neighbor, SearchOptions, VectorIndex};
use crate::cancel::CancelToken;
use crate::metric::{DistanceMetric, Metric, L2};
use crate::quant::{kmeans, nearest, ProductQuantizer, Quantizer, QuantizerConfig};
use log::info;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

const MAGIC: [u8; 4] = *b"VBIV";

/// Training rule of thumb: k-means wants this many points per centroid.
const TRAIN_POINTS_PER_CLUSTER: usize = 39;

/// IVF-PQ parameters.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct IvfPqConfig {
    /// Vector dimensionality.
    pub dimension: usize,
    /// Number of coarse cells.
    pub n_clusters: usize,
    /// Cells probed per query.
    pub n_probes: usize,
    /// PQ subspaces for the residual codes.
    pub pq_subspaces: usize,
    /// PQ bits per subspace.
    pub pq_bits: u8,
}

impl IvfPqConfig {
    /// Defaults: 256 cells, 8 probes, 8 subspaces of 8 bits.
    #[must_use]
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension,
            n_clusters: 256,
            n_probes: 8,
            pq_subspaces: 8,
            pq_bits: 8,
        }
    }

    /// Vectors buffered before coarse training kicks in.
    #[must_use]
    pub fn training_threshold(&self) -> usize {
        self.n_clusters * TRAIN_POINTS_PER_CLUSTER
    }

    fn validate(&self) -> Result<(), IndexError> {
        if self.n_clusters == 0 {
            return Err(IndexError::InvalidConfig("n_clusters must be > 0".into()));
        }
        if self.n_probes == 0 {
            return Err(IndexError::InvalidConfig("n_probes must be > 0".into()));
        }
        QuantizerConfig::product(self.dimension, self.pq_subspaces, self.pq_bits)
            .validate()
            .map_err(IndexError::Quantization)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
struct CellEntry {
    id: String,
    #[serde(with = "serde_bytes")]
    code: Vec<u8>,
    seq: u64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
struct BufferedEntry {
    id: String,
    vector: Vec<f32>,
    seq: u64,
}

#[derive(Serialize, Deserialize)]
struct IvfBody {
    config: IvfPqConfig,
    metric: DistanceMetric,
    centroids: Vec<Vec<f32>>,
    cells: Vec<Vec<CellEntry>>,
    buffer: Vec<BufferedEntry>,
    pq: Option<ProductQuantizer>,
    next_seq: u64,
}

/// The IVF-PQ index.
pub struct IvfPqIndex {
    config: IvfPqConfig,
    metric: DistanceMetric,
    centroids: Vec<Vec<f32>>,
    cells: Vec<Vec<CellEntry>>,
    /// id -> cell, for deletes after training.
    cell_of: HashMap<String, usize>,
    buffer: Vec<BufferedEntry>,
    pq: Option<ProductQuantizer>,
    next_seq: u64,
    dirty: bool,
    closed: bool,
}

impl IvfPqIndex {
    /// Creates an untrained index.
    pub fn new(config: IvfPqConfig, metric: DistanceMetric) -> Result<Self, IndexError> {
        config.validate()?;
        Ok(Self {
            config,
            metric,
            centroids: Vec::new(),
            cells: Vec::new(),
            cell_of: HashMap::new(),
            buffer: Vec::new(),
            pq: None,
            next_seq: 0,
            dirty: false,
            closed: false,
        })
    }

    fn check_open(&self) -> Result<(), IndexError> {
        if self.closed {
            Err(IndexError::Closed)
        } else {
            Ok(())
        }
    }

    fn is_trained(&self) -> bool {
        self.pq.is_some()
    }

    /// Trains coarse centroids and the residual PQ on the buffered vectors,
    /// then drains the buffer into cells.
    fn train(&mut self) -> Result<(), IndexError> {
        let cancel = CancelToken::new();
        let mut rng = ChaCha8Rng::seed_from_u64(0x1BF5);

        let refs: Vec<&[f32]> = self.buffer.iter().map(|e| e.vector.as_slice()).collect();
        let centroids = kmeans(&refs, self.config.n_clusters, &mut rng, &cancel)?;

        // Residuals against the assigned centroid are what PQ must code.
        let residuals: Vec<Vec<f32>> = self
            .buffer
            .iter()
            .map(|e| {
                let (cell, _) = nearest(&e.vector, &centroids);
                e.vector
                    .iter()
                    .zip(centroids[cell].iter())
                    .map(|(x, c)| x - c)
                    .collect()
            })
            .collect();

        let pq_config = QuantizerConfig::product(
            self.config.dimension,
            self.config.pq_subspaces,
            self.config.pq_bits,
        );
        let mut pq = ProductQuantizer::new(&pq_config)?;
        pq.train(&residuals, &cancel)?;

        let mut cells: Vec<Vec<CellEntry>> = vec![Vec::new(); self.config.n_clusters];
        let mut cell_of = HashMap::with_capacity(self.buffer.len());
        for entry in self.buffer.drain(..) {
            let (cell, _) = nearest(&entry.vector, &centroids);
            let residual: Vec<f32> = entry
                .vector
                .iter()
                .zip(centroids[cell].iter())
                .map(|(x, c)| x - c)
                .collect();
            let code = pq.compress(&residual)?;
            cell_of.insert(entry.id.clone(), cell);
            cells[cell].push(CellEntry {
                id: entry.id,
                code,
                seq: entry.seq,
            });
        }

        info!(
            "ivf-pq trained: {} cells over {} vectors",
            self.config.n_clusters,
            cell_of.len()
        );

        self.centroids = centroids;
        self.cells = cells;
        self.cell_of = cell_of;
        self.pq = Some(pq);
        Ok(())
    }

    /// Reconstructs the approximate vector for a cell entry.
    fn reconstruct(&self, cell: usize, entry: &CellEntry) -> Result<Vec<f32>, IndexError> {
        let pq = self
            .pq
            .as_ref()
            .ok_or(IndexError::Quantization(crate::quant::QuantizationError::Untrained))?;
        let residual = pq.decompress(&entry.code)?;
        Ok(self.centroids[cell]
            .iter()
            .zip(residual.iter())
            .map(|(c, r)| c + r)
            .collect())
    }

    fn probed_cells(&self, query: &[f32], n_probes: usize) -> Vec<usize> {
        let mut ranked: Vec<(f32, usize)> = self
            .centroids
            .iter()
            .enumerate()
            .map(|(i, c)| (L2::distance(query, c), i))
            .collect();
        ranked.sort_by(|a, b| a.0.total_cmp(&b.0));
        ranked.truncate(n_probes);
        ranked.into_iter().map(|(_, i)| i).collect()
    }

    fn search_trained(
        &self,
        query: &[f32],
        k: usize,
        n_probes: usize,
    ) -> Result<Vec<Neighbor>, IndexError> {
        let pq = self
            .pq
            .as_ref()
            .ok_or(IndexError::Quantization(crate::quant::QuantizationError::Untrained))?;
        let mut hits: Vec<(f32, u64, &CellEntry)> = Vec::new();

        for cell in self.probed_cells(query, n_probes) {
            if self.cells[cell].is_empty() {
                continue;
            }
            if self.metric == DistanceMetric::L2 {
                // Fast path: the residual query shares the cell centroid, so
                // one distance table per cell ranks every code in it.
                let residual_query: Vec<f32> = query
                    .iter()
                    .zip(self.centroids[cell].iter())
                    .map(|(x, c)| x - c)
                    .collect();
                let table = pq.query_table(&residual_query)?;
                for entry in &self.cells[cell] {
                    let d = pq.distance_with_table(&table, &entry.code)?;
                    // Squared to stay comparable with the L2 kernel.
                    hits.push((d * d, entry.seq, entry));
                }
            } else {
                for entry in &self.cells[cell] {
                    let approx = self.reconstruct(cell, entry)?;
                    hits.push((self.metric.distance(query, &approx), entry.seq, entry));
                }
            }
        }

        hits.sort_by(|a, b| a.0.total_cmp(&b.0).then(a.1.cmp(&b.1)));
        hits.truncate(k);
        Ok(hits
            .into_iter()
            .map(|(distance, _, e)| Neighbor {
                id: e.id.clone(),
                distance,
            })
            .collect())
    }

    fn search_buffered(&self, query: &[f32], k: usize) -> Vec<Neighbor> {
        let mut hits: Vec<(f32, u64, &BufferedEntry)> = self
            .buffer
            .iter()
            .map(|e| (self.metric.distance(query, &e.vector), e.seq, e))
            .collect();
        hits.sort_by(|a, b| a.0.total_cmp(&b.0).then(a.1.cmp(&b.1)));
        hits.truncate(k);
        hits.into_iter()
            .map(|(distance, _, e)| Neighbor {
                id: e.id.clone(),
                distance,
            })
            .collect()
    }

    fn contains(&self, id: &str) -> bool {
        self.cell_of.contains_key(id) || self.buffer.iter().any(|e| e.id == id)
    }
}

impl VectorIndex for IvfPqIndex {
    fn insert(&mut self, id: &str, vector: &[f32]) -> Result<(), IndexError> {
        self.check_open()?;
        if id.is_empty() {
            return Err(IndexError::InvalidConfig("id must be non-empty".into()));
        }
        if vector.len() != self.config.dimension {
            return Err(IndexError::DimensionMismatch {
                expected: self.config.dimension,
                actual: vector.len(),
            });
        }
        if self.contains(id) {
            return Err(IndexError::DuplicateId { id: id.to_string() });
        }

        let seq = self.next_seq;
        self.next_seq += 1;
        self.dirty = true;

        if let Some(pq) = &self.pq {
            let (cell, _) = nearest(vector, &self.centroids);
            let residual: Vec<f32> = vector
                .iter()
                .zip(self.centroids[cell].iter())
                .map(|(x, c)| x - c)
                .collect();
            let code = pq.compress(&residual)?;
            self.cell_of.insert(id.to_string(), cell);
            self.cells[cell].push(CellEntry {
                id: id.to_string(),
                code,
                seq,
            });
            return Ok(());
        }

        self.buffer.push(BufferedEntry {
            id: id.to_string(),
            vector: vector.to_vec(),
            seq,
        });
        if self.buffer.len() >= self.config.training_threshold() {
            self.train()?;
        }
        Ok(())
    }

    fn search(
        &self,
        query: &[f32],
        k: usize,
        options: &SearchOptions,
    ) -> Result<Vec<Neighbor>, IndexError> {
        self.check_open()?;
        validate_query(query, k, self.config.dimension)?;

        if self.is_trained() {
            let n_probes = options.n_probes.unwrap_or(self.config.n_probes);
            self.search_trained(query, k, n_probes.max(1))
        } else {
            Ok(self.search_buffered(query, k))
        }
    }

    fn delete(&mut self, id: &str) -> Result<(), IndexError> {
        self.check_open()?;
        if let Some(cell) = self.cell_of.remove(id) {
            self.cells[cell].retain(|e| e.id != id);
            self.dirty = true;
            return Ok(());
        }
        let before = self.buffer.len();
        self.buffer.retain(|e| e.id != id);
        if self.buffer.len() == before {
            return Err(IndexError::NotFound { id: id.to_string() });
        }
        self.dirty = true;
        Ok(())
    }

    fn len(&self) -> usize {
        self.cell_of.len() + self.buffer.len()
    }

    fn memory_usage(&self) -> usize {
        let centroid_bytes: usize = self.centroids.iter().map(|c| c.len() * 4).sum();
        let cell_bytes: usize = self
            .cells
            .iter()
            .flatten()
            .map(|e| e.id.len() + e.code.len() + 8)
            .sum();
        let buffer_bytes: usize = self
            .buffer
            .iter()
            .map(|e| e.id.len() + e.vector.capacity() * 4 + 8)
            .sum();
        let pq_bytes = self.pq.as_ref().map_or(0, |q| q.memory_usage());
        std::mem::size_of::<Self>() + centroid_bytes + cell_bytes + buffer_bytes + pq_bytes
    }

    fn save(&mut self, path: &Path) -> Result<(), IndexError> {
        self.check_open()?;
        let body = IvfBody {
            config: self.config.clone(),
            metric: self.metric,
            centroids: self.centroids.clone(),
            cells: self.cells.clone(),
            buffer: self.buffer.clone(),
            pq: self.pq.clone(),
            next_seq: self.next_seq,
        };
        let bytes =
            postcard::to_allocvec(&body).map_err(|e| IndexError::Corruption(e.to_string()))?;
        container::write_atomic(
            path,
            MAGIC,
            self.config.dimension,
            0,
            self.len() as u64,
            &bytes,
        )?;
        self.dirty = false;
        Ok(())
    }

    fn load(&mut self, path: &Path) -> Result<(), IndexError> {
        self.check_open()?;
        let (_, bytes) = container::read_verified(path, MAGIC)?;
        let body: IvfBody = postcard::from_bytes(&bytes)
            .map_err(|e| IndexError::Corruption(format!("undecodable body: {e}")))?;

        let mut cell_of = HashMap::new();
        for (cell, entries) in body.cells.iter().enumerate() {
            for entry in entries {
                cell_of.insert(entry.id.clone(), cell);
            }
        }

        self.config = body.config;
        self.metric = body.metric;
        self.centroids = body.centroids;
        self.cells = body.cells;
        self.cell_of = cell_of;
        self.buffer = body.buffer;
        self.pq = body.pq;
        self.next_seq = body.next_seq;
        self.dirty = false;
        Ok(())
    }

    fn close(&mut self) -> Result<(), IndexError> {
        self.closed = true;
        self.cells.clear();
        self.cell_of.clear();
        self.buffer.clear();
        self.centroids.clear();
        Ok(())
    }

    fn kind(&self) -> IndexKind {
        IndexKind::IvfPq
    }

    fn is_dirty(&self) -> bool {
        self.dirty
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::Rng;

    fn tiny_config(dim: usize) -> IvfPqConfig {
        IvfPqConfig {
            dimension: dim,
            n_clusters: 4,
            n_probes: 2,
            pq_subspaces: 2,
            pq_bits: 4,
        }
    }

    fn random_vectors(n: usize, dim: usize, seed: u64) -> Vec<Vec<f32>> {
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        (0..n)
            .map(|_| (0..dim).map(|_| rng.gen_range(-1.0f32..1.0)).collect())
            .collect()
    }

    #[test]
    fn test_buffered_phase_is_exact() {
        let mut index = IvfPqIndex::new(tiny_config(4), DistanceMetric::L2).expect("new");
        for (i, v) in random_vectors(20, 4, 5).into_iter().enumerate() {
            index.insert(&format!("n{i}"), &v).expect("insert");
        }
        assert!(!index.is_trained());
        let hits = index
            .search(&[0.0; 4], 5, &SearchOptions::default())
            .expect("search");
        assert_eq!(hits.len(), 5);
    }

    #[test]
    fn test_training_kicks_in_and_searches() {
        let config = tiny_config(4);
        let threshold = config.training_threshold();
        let mut index = IvfPqIndex::new(config, DistanceMetric::L2).expect("new");

        let vectors = random_vectors(threshold + 10, 4, 6);
        for (i, v) in vectors.iter().enumerate() {
            index.insert(&format!("n{i}"), v).expect("insert");
        }
        assert!(index.is_trained());
        assert_eq!(index.len(), threshold + 10);

        // The query's own vector should rank at (or very near) the top.
        let hits = index
            .search(&vectors[3], 5, &SearchOptions::default())
            .expect("search");
        assert!(!hits.is_empty());
        assert!(
            hits.iter().any(|h| h.id == "n3"),
            "own vector missing from top hits: {hits:?}"
        );
    }

    #[test]
    fn test_delete_in_both_phases() {
        let config = tiny_config(4);
        let threshold = config.training_threshold();
        let mut index = IvfPqIndex::new(config, DistanceMetric::L2).expect("new");

        let vectors = random_vectors(threshold + 5, 4, 7);
        for (i, v) in vectors.iter().enumerate() {
            if i == 10 {
                // Buffered-phase delete.
                index.delete("n4").expect("buffered delete");
            }
            index.insert(&format!("n{i}"), v).expect("insert");
        }
        assert!(index.is_trained());
        index.delete("n20").expect("trained delete");
        assert!(matches!(
            index.delete("n20"),
            Err(IndexError::NotFound { .. })
        ));
        assert_eq!(index.len(), threshold + 5 - 2);
    }

    #[test]
    fn test_save_load_roundtrip() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("ivf.vbiv");

        let config = tiny_config(4);
        let threshold = config.training_threshold();
        let mut index = IvfPqIndex::new(config.clone(), DistanceMetric::L2).expect("new");
        let vectors = random_vectors(threshold + 3, 4, 8);
        for (i, v) in vectors.iter().enumerate() {
            index.insert(&format!("n{i}"), v).expect("insert");
        }
        index.save(&path).expect("save");

        let mut reopened = IvfPqIndex::new(config, DistanceMetric::L2).expect("new");
        reopened.load(&path).expect("load");
        assert_eq!(reopened.len(), index.len());
        assert!(reopened.is_trained());

        let before = index
            .search(&vectors[0], 10, &SearchOptions::default())
            .expect("search");
        let after = reopened
            .search(&vectors[0], 10, &SearchOptions::default())
            .expect("search");
        assert_eq!(before, after);
    }
}
