//! Graph storage: node arena, link lists, level draws, soft delete.

use super::config::{HnswConfig, MAX_LEVEL};
use crate::index::{IndexError, IndexKind, Neighbor, SearchOptions, VectorIndex};
use crate::quant::Quantizer;
use bitvec::prelude::*;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use std::collections::HashMap;
use std::path::Path;

/// Arena slot index. Doubles as insertion order for distance tie-breaking.
pub(crate) type NodeId = u32;

/// One graph node.
///
/// `links[level]` holds the out-edges on that layer; the vector is dropped in
/// favour of its code once a trained quantizer is attached. Links are kept
/// symmetric by the insert path, and every mutation of `links[level]` is
/// guarded by `level < links.len()` — nodes shorter than the layer being
/// wired simply don't participate.
#[derive(Clone, Debug)]
pub(crate) struct Node {
    pub id: String,
    pub vector: Vec<f32>,
    pub code: Option<Vec<u8>>,
    pub level: u8,
    pub links: Vec<Vec<NodeId>>,
}

impl Node {
    pub(crate) fn heap_bytes(&self) -> usize {
        let links: usize = self.links.iter().map(|l| l.capacity() * 4 + 24).sum();
        let code = self.code.as_ref().map_or(0, Vec::len);
        self.id.len() + self.vector.capacity() * 4 + code + links
    }
}

/// The HNSW index.
///
/// Mutations require `&mut self`; searches take `&self` and may run
/// concurrently with each other. Callers that share the index across threads
/// wrap it in an `RwLock`, which serialises readers against an in-progress
/// write and gives every search a consistent snapshot of the graph.
pub struct HnswIndex {
    pub(crate) config: HnswConfig,
    pub(crate) nodes: Vec<Node>,
    pub(crate) by_id: HashMap<String, NodeId>,
    /// Tombstones, indexed by `NodeId`.
    pub(crate) deleted: BitVec,
    pub(crate) deleted_count: usize,
    pub(crate) entry_point: Option<NodeId>,
    pub(crate) max_level: u8,
    pub(crate) rng: ChaCha8Rng,
    pub(crate) quantizer: Option<Box<dyn Quantizer>>,
    pub(crate) dirty: bool,
    pub(crate) read_only: bool,
    pub(crate) closed: bool,
}

impl HnswIndex {
    /// Creates an empty index.
    pub fn new(config: HnswConfig) -> Result<Self, IndexError> {
        config.validate().map_err(IndexError::InvalidConfig)?;
        let rng = ChaCha8Rng::seed_from_u64(config.seed);
        Ok(Self {
            config,
            nodes: Vec::new(),
            by_id: HashMap::new(),
            deleted: BitVec::new(),
            deleted_count: 0,
            entry_point: None,
            max_level: 0,
            rng,
            quantizer: None,
            dirty: false,
            read_only: false,
            closed: false,
        })
    }

    /// Creates an index that stores compressed vectors.
    ///
    /// The quantizer must already be trained; nodes inserted afterwards keep
    /// only their code.
    pub fn with_quantizer(
        config: HnswConfig,
        quantizer: Box<dyn Quantizer>,
    ) -> Result<Self, IndexError> {
        if !quantizer.is_trained() {
            return Err(IndexError::Quantization(
                crate::quant::QuantizationError::Untrained,
            ));
        }
        let mut index = Self::new(config)?;
        index.quantizer = Some(quantizer);
        Ok(index)
    }

    /// The configuration. `ef_search` may be tuned via
    /// [`HnswIndex::set_ef_search`]; everything else is fixed.
    #[must_use]
    pub fn config(&self) -> &HnswConfig {
        &self.config
    }

    /// Adjusts the default query beam width.
    pub fn set_ef_search(&mut self, ef_search: usize) {
        self.config.ef_search = ef_search;
    }

    /// Draws a level from the geometric distribution
    /// `floor(-ln(U) * level_mult)`, clamped to [`MAX_LEVEL`].
    pub(crate) fn random_level(&mut self) -> u8 {
        let u: f64 = self.rng.gen_range(f64::EPSILON..=1.0);
        let level = (-u.ln() * self.config.level_mult).floor();
        if level >= f64::from(MAX_LEVEL) {
            MAX_LEVEL
        } else {
            // In-range by the branch above.
            #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
            {
                level as u8
            }
        }
    }

    pub(crate) fn is_deleted(&self, node: NodeId) -> bool {
        self.deleted
            .get(node as usize)
            .map_or(false, |bit| *bit)
    }

    /// Distance between a query vector and a stored node.
    pub(crate) fn dist_to_query(&self, query: &[f32], node: NodeId) -> f32 {
        let n = &self.nodes[node as usize];
        if let (Some(q), Some(code)) = (&self.quantizer, &n.code) {
            if let Ok(d) = q.distance_to_query(code, query) {
                return d;
            }
        }
        self.config.metric.distance(query, &n.vector)
    }

    /// Distance between two stored nodes.
    pub(crate) fn dist_between(&self, a: NodeId, b: NodeId) -> f32 {
        let na = &self.nodes[a as usize];
        let nb = &self.nodes[b as usize];
        if let Some(q) = &self.quantizer {
            match (&na.code, &nb.code) {
                (Some(ca), Some(cb)) => {
                    if let Ok(d) = q.distance(ca, cb) {
                        return d;
                    }
                }
                (Some(ca), None) => {
                    if let Ok(d) = q.distance_to_query(ca, &nb.vector) {
                        return d;
                    }
                }
                (None, Some(cb)) => {
                    if let Ok(d) = q.distance_to_query(cb, &na.vector) {
                        return d;
                    }
                }
                (None, None) => {}
            }
        }
        self.config.metric.distance(&na.vector, &nb.vector)
    }

    /// Out-links of `node` on `level`, or an empty slice for nodes below the
    /// layer.
    pub(crate) fn links(&self, node: NodeId, level: u8) -> &[NodeId] {
        let n = &self.nodes[node as usize];
        if (level as usize) < n.links.len() {
            &n.links[level as usize]
        } else {
            &[]
        }
    }

    fn check_writable(&self) -> Result<(), IndexError> {
        if self.closed {
            return Err(IndexError::Closed);
        }
        if self.read_only {
            return Err(IndexError::ReadOnly);
        }
        Ok(())
    }

    /// Soft delete: mark the tombstone, free the id. The node stays in the
    /// arena as a routing ghost; neighbor lists are scrubbed lazily by later
    /// inserts that touch them, and [`HnswIndex::compact`] rebuilds without
    /// them entirely.
    pub fn soft_delete(&mut self, id: &str) -> Result<(), IndexError> {
        self.check_writable()?;
        let node = self
            .by_id
            .remove(id)
            .ok_or_else(|| IndexError::NotFound { id: id.to_string() })?;
        self.deleted.set(node as usize, true);
        self.deleted_count += 1;
        self.dirty = true;
        Ok(())
    }

    /// Fraction of arena slots that are tombstones.
    #[must_use]
    pub fn dead_fraction(&self) -> f64 {
        if self.nodes.is_empty() {
            return 0.0;
        }
        #[allow(clippy::cast_precision_loss)]
        {
            self.deleted_count as f64 / self.nodes.len() as f64
        }
    }

    /// Rebuilds the graph without tombstoned nodes. Returns the number of
    /// reclaimed slots.
    ///
    /// Quantized nodes are decompressed for re-insertion, so the rebuilt
    /// graph re-codes them against the same codebooks.
    pub fn compact(&mut self) -> Result<usize, IndexError> {
        self.check_writable()?;
        if self.deleted_count == 0 {
            return Ok(0);
        }

        let reclaimed = self.deleted_count;
        let old_nodes = std::mem::take(&mut self.nodes);
        let old_deleted = std::mem::take(&mut self.deleted);

        self.by_id.clear();
        self.deleted_count = 0;
        self.entry_point = None;
        self.max_level = 0;

        for (slot, node) in old_nodes.into_iter().enumerate() {
            if old_deleted.get(slot).map_or(false, |bit| *bit) {
                continue;
            }
            let vector = if node.vector.is_empty() {
                match (&self.quantizer, &node.code) {
                    (Some(q), Some(code)) => q.decompress(code)?,
                    _ => node.vector,
                }
            } else {
                node.vector
            };
            self.insert(&node.id, &vector)?;
        }

        self.dirty = true;
        Ok(reclaimed)
    }

    pub(crate) fn live_len(&self) -> usize {
        self.nodes.len() - self.deleted_count
    }
}

impl VectorIndex for HnswIndex {
    fn insert(&mut self, id: &str, vector: &[f32]) -> Result<(), IndexError> {
        self.check_writable()?;
        self.insert_impl(id, vector)
    }

    fn search(
        &self,
        query: &[f32],
        k: usize,
        options: &SearchOptions,
    ) -> Result<Vec<Neighbor>, IndexError> {
        if self.closed {
            return Err(IndexError::Closed);
        }
        self.search_impl(query, k, options)
    }

    fn delete(&mut self, id: &str) -> Result<(), IndexError> {
        self.soft_delete(id)
    }

    fn len(&self) -> usize {
        self.live_len()
    }

    fn memory_usage(&self) -> usize {
        let nodes: usize = self.nodes.iter().map(Node::heap_bytes).sum();
        let ids: usize = self.by_id.keys().map(|k| k.len() + 8).sum();
        let quantizer = self.quantizer.as_ref().map_or(0, |q| q.memory_usage());
        std::mem::size_of::<Self>() + nodes + ids + self.deleted.capacity() / 8 + quantizer
    }

    fn save(&mut self, path: &Path) -> Result<(), IndexError> {
        if self.closed {
            return Err(IndexError::Closed);
        }
        super::persist::save(self, path)?;
        self.dirty = false;
        Ok(())
    }

    fn load(&mut self, path: &Path) -> Result<(), IndexError> {
        if self.closed {
            return Err(IndexError::Closed);
        }
        let loaded = super::persist::load(path)?;
        *self = loaded;
        Ok(())
    }

    fn close(&mut self) -> Result<(), IndexError> {
        self.closed = true;
        self.nodes.clear();
        self.by_id.clear();
        self.deleted.clear();
        Ok(())
    }

    fn kind(&self) -> IndexKind {
        IndexKind::Hnsw
    }

    fn is_dirty(&self) -> bool {
        self.dirty
    }

    fn optimize(&mut self) -> Result<usize, IndexError> {
        self.compact()
    }

    fn set_ef_search(&mut self, ef_search: usize) {
        self.config.ef_search = ef_search;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<HnswIndex>();
    }

    #[test]
    fn test_empty_index() {
        let index = HnswIndex::new(HnswConfig::new(4)).expect("new");
        assert_eq!(index.len(), 0);
        assert!(index.is_empty());
        assert_eq!(index.entry_point, None);
    }

    #[test]
    fn test_level_distribution_geometric() {
        let mut index = HnswIndex::new(HnswConfig::new(4)).expect("new");
        let levels: Vec<u8> = (0..2000).map(|_| index.random_level()).collect();

        // With m_L = 1/ln2, P(level >= 1) = 0.5.
        let level0 = levels.iter().filter(|&&l| l == 0).count();
        assert!(level0 > 800 && level0 < 1200, "level0 = {level0}");
        assert!(*levels.iter().max().expect("non-empty") <= MAX_LEVEL);
    }

    #[test]
    fn test_soft_delete_unknown_id() {
        let mut index = HnswIndex::new(HnswConfig::new(4)).expect("new");
        assert!(matches!(
            index.soft_delete("ghost"),
            Err(IndexError::NotFound { .. })
        ));
    }

    #[test]
    fn test_closed_rejects_operations() {
        let mut index = HnswIndex::new(HnswConfig::new(2)).expect("new");
        index.insert("a", &[0.0, 1.0]).expect("insert");
        index.close().expect("close");
        assert!(matches!(
            index.insert("b", &[1.0, 0.0]),
            Err(IndexError::Closed)
        ));
        assert!(matches!(
            index.search(&[0.0, 1.0], 1, &SearchOptions::default()),
            Err(IndexError::Closed)
        ));
    }

    #[test]
    fn test_dead_fraction() {
        let mut index = HnswIndex::new(HnswConfig::new(2)).expect("new");
        for i in 0..10 {
            index
                .insert(&format!("n{i}"), &[i as f32, 0.0])
                .expect("insert");
        }
        assert!(index.dead_fraction().abs() < f64::EPSILON);
        index.soft_delete("n0").expect("delete");
        index.soft_delete("n1").expect("delete");
        assert!((index.dead_fraction() - 0.2).abs() < 1e-9);
        assert_eq!(index.len(), 8);
    }

    #[test]
    fn test_compact_reclaims_tombstones() {
        let mut index = HnswIndex::new(HnswConfig::new(2)).expect("new");
        for i in 0..20 {
            index
                .insert(&format!("n{i}"), &[i as f32, (i * 3 % 7) as f32])
                .expect("insert");
        }
        for i in 0..5 {
            index.soft_delete(&format!("n{i}")).expect("delete");
        }

        let reclaimed = index.compact().expect("compact");
        assert_eq!(reclaimed, 5);
        assert_eq!(index.len(), 15);
        assert_eq!(index.nodes.len(), 15);
        assert_eq!(index.deleted_count, 0);

        // Deleted ids are gone; survivors still searchable.
        let hits = index
            .search(&[10.0, 2.0], 3, &SearchOptions::default())
            .expect("search");
        assert!(!hits.is_empty());
        assert!(hits.iter().all(|h| h.id != "n0"));
    }
}
