//! Snapshot format and background autosave.
//!
//! # File layout
//!
//! A fixed 64-byte header followed by a postcard-encoded body:
//!
//! | Offset | Size | Field |
//! |--------|------|-------|
//! | 0      | 4    | magic `VBIX` |
//! | 4      | 2    | version (1 = legacy read-only, 2 = current) |
//! | 6      | 2    | flags (bit 0: quantizer blob present) |
//! | 8      | 4    | dimension |
//! | 12     | 4    | metric code |
//! | 16     | 4    | m |
//! | 20     | 4    | m0 |
//! | 24     | 4    | `ef_construction` |
//! | 28     | 4    | `ef_search` |
//! | 32     | 8    | node count |
//! | 40     | 4    | entry point (`u32::MAX` = none) |
//! | 44     | 4    | max level |
//! | 48     | 4    | CRC32 of all bytes after this field |
//! | 52     | 12   | reserved |
//!
//! The CRC covers everything from offset 52 to the end of the file, so a
//! truncated body, a flipped bit, or a foreign file all fail closed with a
//! corruption error before any state is materialised. Saves are atomic:
//! write to `<path>.tmp`, fsync, rename.

use super::config::HnswConfig;
use super::graph::{HnswIndex, Node, NodeId};
use crate::cancel::CancelToken;
use crate::index::{IndexError, VectorIndex};
use crate::metric::DistanceMetric;
use crate::quant::{BuiltinQuantizer, Quantizer as _};
use bitvec::prelude::*;
use bytemuck::{Pod, Zeroable};
use log::{debug, info, warn};
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use std::thread::JoinHandle;
use std::time::Duration;

/// Magic bytes: "VBIX".
pub const MAGIC: [u8; 4] = *b"VBIX";

/// Current write-path version.
pub const VERSION_CURRENT: u16 = 2;

/// Legacy version; loads read-only.
pub const VERSION_LEGACY: u16 = 1;

/// Byte offset of the body CRC field. Fixed by the format.
pub const CRC_OFFSET: usize = 48;

/// Header flag: a quantizer blob follows the node table.
pub const FLAG_QUANTIZED: u16 = 1 << 0;

const HEADER_SIZE: usize = 64;

/// The fixed-layout snapshot header.
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
#[repr(C)]
pub struct SnapshotHeader {
    /// Magic bytes.
    pub magic: [u8; 4], // 0
    /// Format version.
    pub version: u16, // 4
    /// Flags.
    pub flags: u16, // 6
    /// Vector dimensionality.
    pub dimension: u32, // 8
    /// Metric code (0 = L2, 1 = inner product, 2 = cosine).
    pub metric: u32, // 12
    /// HNSW m.
    pub m: u32, // 16
    /// HNSW m0.
    pub m0: u32, // 20
    /// Construction beam width.
    pub ef_construction: u32, // 24
    /// Query beam width.
    pub ef_search: u32, // 28
    /// Number of nodes in the body.
    pub node_count: u64, // 32
    /// Entry point slot; `u32::MAX` when the graph is empty.
    pub entry_point: u32, // 40
    /// Highest layer in the graph.
    pub max_level: u32, // 44
    /// CRC32 of all file bytes after this field.
    pub body_crc: u32, // 48
    /// Reserved, zeroed.
    pub reserved: [u32; 3], // 52
}

const _: () = assert!(std::mem::size_of::<SnapshotHeader>() == HEADER_SIZE);
const _: () = assert!(std::mem::align_of::<SnapshotHeader>() == 8);
// The CRC field must sit at its documented offset.
const _: () = assert!(std::mem::offset_of!(SnapshotHeader, body_crc) == CRC_OFFSET);

fn metric_code(metric: DistanceMetric) -> u32 {
    match metric {
        DistanceMetric::L2 => 0,
        DistanceMetric::InnerProduct => 1,
        DistanceMetric::Cosine => 2,
    }
}

fn metric_from_code(code: u32) -> Result<DistanceMetric, IndexError> {
    match code {
        0 => Ok(DistanceMetric::L2),
        1 => Ok(DistanceMetric::InnerProduct),
        2 => Ok(DistanceMetric::Cosine),
        other => Err(IndexError::Corruption(format!(
            "unknown metric code {other}"
        ))),
    }
}

#[derive(Serialize, Deserialize)]
struct NodeSnapshot {
    id: String,
    vector: Vec<f32>,
    #[serde(with = "serde_bytes")]
    code: Option<Vec<u8>>,
    level: u8,
    links: Vec<Vec<NodeId>>,
}

#[derive(Serialize, Deserialize)]
struct SnapshotBody {
    config: HnswConfig,
    nodes: Vec<NodeSnapshot>,
    /// Tombstone bitmap, one bit per node, LSB-first.
    #[serde(with = "serde_bytes")]
    deleted: Vec<u8>,
    entry_point: Option<NodeId>,
    max_level: u8,
    /// RNG state, so level draws continue identically after reopen.
    rng: ChaCha8Rng,
    quantizer: Option<BuiltinQuantizer>,
}

/// Serialises the index and writes it atomically.
pub(crate) fn save(index: &HnswIndex, path: &Path) -> Result<(), IndexError> {
    let nodes: Vec<NodeSnapshot> = index
        .nodes
        .iter()
        .map(|n| NodeSnapshot {
            id: n.id.clone(),
            vector: n.vector.clone(),
            code: n.code.clone(),
            level: n.level,
            links: n.links.clone(),
        })
        .collect();

    let mut deleted = vec![0u8; index.nodes.len().div_ceil(8)];
    for slot in index.deleted.iter_ones() {
        deleted[slot / 8] |= 1 << (slot % 8);
    }

    let quantizer = match &index.quantizer {
        Some(q) => {
            let state = q.builtin_state();
            if state.is_none() {
                warn!("snapshot skips externally-registered quantizer; reopen must re-attach it");
            }
            state
        }
        None => None,
    };
    let has_quantizer = quantizer.is_some();

    let body = SnapshotBody {
        config: index.config.clone(),
        nodes,
        deleted,
        entry_point: index.entry_point,
        max_level: index.max_level,
        rng: index.rng.clone(),
        quantizer,
    };
    let body_bytes =
        postcard::to_allocvec(&body).map_err(|e| IndexError::Corruption(e.to_string()))?;

    let mut header = SnapshotHeader {
        magic: MAGIC,
        version: VERSION_CURRENT,
        flags: if has_quantizer { FLAG_QUANTIZED } else { 0 },
        dimension: u32::try_from(index.config.dimension)
            .map_err(|_| IndexError::InvalidConfig("dimension exceeds u32".into()))?,
        metric: metric_code(index.config.metric),
        m: u32::try_from(index.config.m).unwrap_or(u32::MAX),
        m0: u32::try_from(index.config.m0).unwrap_or(u32::MAX),
        ef_construction: u32::try_from(index.config.ef_construction).unwrap_or(u32::MAX),
        ef_search: u32::try_from(index.config.ef_search).unwrap_or(u32::MAX),
        node_count: index.nodes.len() as u64,
        entry_point: index.entry_point.unwrap_or(u32::MAX),
        max_level: u32::from(index.max_level),
        body_crc: 0,
        reserved: [0; 3],
    };

    let mut buffer = Vec::with_capacity(HEADER_SIZE + body_bytes.len());
    buffer.extend_from_slice(bytemuck::bytes_of(&header));
    buffer.extend_from_slice(&body_bytes);

    // CRC covers everything after the CRC field itself.
    let crc = crc32fast::hash(&buffer[CRC_OFFSET + 4..]);
    header.body_crc = crc;
    buffer[..HEADER_SIZE].copy_from_slice(bytemuck::bytes_of(&header));

    let tmp = tmp_path(path);
    {
        let mut file = fs::File::create(&tmp)?;
        file.write_all(&buffer)?;
        file.sync_all()?;
    }
    fs::rename(&tmp, path)?;

    debug!(
        "hnsw snapshot saved: {} node(s), {} bytes, crc {crc:#010x}",
        index.nodes.len(),
        buffer.len()
    );
    Ok(())
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut os = path.as_os_str().to_os_string();
    os.push(".tmp");
    PathBuf::from(os)
}

/// Verifies and materialises a snapshot.
///
/// Magic, version and CRC are checked before any node is built; failures
/// leave the file on disk untouched and return
/// [`IndexError::Corruption`].
pub(crate) fn load(path: &Path) -> Result<HnswIndex, IndexError> {
    let data = fs::read(path)?;
    if data.len() < HEADER_SIZE {
        return Err(IndexError::Corruption(format!(
            "file too short: {} bytes",
            data.len()
        )));
    }

    let header: SnapshotHeader = bytemuck::pod_read_unaligned(&data[..HEADER_SIZE]);

    if header.magic != MAGIC {
        return Err(IndexError::Corruption(format!(
            "bad magic: {:02x?}",
            header.magic
        )));
    }
    let read_only = match header.version {
        VERSION_CURRENT => false,
        VERSION_LEGACY => true,
        other => {
            return Err(IndexError::Corruption(format!(
                "unsupported snapshot version {other}"
            )))
        }
    };

    let actual_crc = crc32fast::hash(&data[CRC_OFFSET + 4..]);
    if actual_crc != header.body_crc {
        return Err(IndexError::Corruption(format!(
            "checksum mismatch: header {:#010x}, body {actual_crc:#010x}",
            header.body_crc
        )));
    }

    let body: SnapshotBody = postcard::from_bytes(&data[HEADER_SIZE..])
        .map_err(|e| IndexError::Corruption(format!("undecodable body: {e}")))?;

    if body.nodes.len() as u64 != header.node_count {
        return Err(IndexError::Corruption(format!(
            "node count mismatch: header {}, body {}",
            header.node_count,
            body.nodes.len()
        )));
    }
    if body.config.dimension != header.dimension as usize {
        return Err(IndexError::Corruption(format!(
            "dimension mismatch: header {}, body {}",
            header.dimension, body.config.dimension
        )));
    }
    // Metric must decode and agree with the body config.
    let metric = metric_from_code(header.metric)?;
    if metric != body.config.metric {
        return Err(IndexError::Corruption(
            "metric mismatch between header and body".into(),
        ));
    }

    let mut nodes = Vec::with_capacity(body.nodes.len());
    let mut by_id: HashMap<String, NodeId> = HashMap::with_capacity(body.nodes.len());
    let mut deleted = BitVec::with_capacity(body.nodes.len());
    let mut deleted_count = 0usize;

    for (slot, snap) in body.nodes.into_iter().enumerate() {
        let is_deleted = body
            .deleted
            .get(slot / 8)
            .map_or(false, |byte| byte & (1 << (slot % 8)) != 0);
        if is_deleted {
            deleted_count += 1;
        } else {
            #[allow(clippy::cast_possible_truncation)]
            by_id.insert(snap.id.clone(), slot as NodeId);
        }
        deleted.push(is_deleted);
        nodes.push(Node {
            id: snap.id,
            vector: snap.vector,
            code: snap.code,
            level: snap.level,
            links: snap.links,
        });
    }

    // Validate link targets before trusting them.
    let count = nodes.len();
    for node in &nodes {
        for links in &node.links {
            for &target in links {
                if target as usize >= count {
                    return Err(IndexError::Corruption(format!(
                        "link target {target} out of bounds ({count} nodes)"
                    )));
                }
            }
        }
    }
    if let Some(ep) = body.entry_point {
        if ep as usize >= count {
            return Err(IndexError::Corruption(format!(
                "entry point {ep} out of bounds ({count} nodes)"
            )));
        }
    }

    body.config
        .validate()
        .map_err(|e| IndexError::Corruption(format!("invalid config in snapshot: {e}")))?;

    info!(
        "hnsw snapshot loaded: {count} node(s), {deleted_count} tombstone(s){}",
        if read_only { " (legacy, read-only)" } else { "" }
    );

    Ok(HnswIndex {
        config: body.config,
        nodes,
        by_id,
        deleted,
        deleted_count,
        entry_point: body.entry_point,
        max_level: body.max_level,
        rng: body.rng,
        quantizer: body.quantizer.map(BuiltinQuantizer::into_boxed),
        dirty: false,
        read_only,
        closed: false,
    })
}

/// Background autosave.
///
/// A thread that wakes every `interval`, and if the index has changed since
/// the last snapshot, takes the write lock just long enough to save. The
/// handle owns the thread; [`Autosaver::stop`] (or drop) cancels and joins.
pub struct Autosaver {
    cancel: CancelToken,
    handle: Option<JoinHandle<()>>,
}

impl Autosaver {
    /// Spawns the autosave thread.
    #[must_use]
    pub fn spawn(
        index: Arc<RwLock<Box<dyn VectorIndex>>>,
        path: PathBuf,
        interval: Duration,
    ) -> Self {
        let cancel = CancelToken::new();
        let token = cancel.clone();
        let handle = std::thread::Builder::new()
            .name("vecbase-autosave".into())
            .spawn(move || {
                while !token.wait_timeout(interval) {
                    let needs_save = index
                        .read()
                        .map(|guard| guard.is_dirty())
                        .unwrap_or(false);
                    if !needs_save {
                        continue;
                    }
                    match index.write() {
                        Ok(mut guard) => {
                            if guard.is_dirty() {
                                if let Err(e) = guard.save(&path) {
                                    warn!("autosave failed: {e}");
                                }
                            }
                        }
                        Err(_) => {
                            warn!("autosave skipped: index lock poisoned");
                            return;
                        }
                    }
                }
            })
            .expect("failed to spawn autosave thread");
        Self {
            cancel,
            handle: Some(handle),
        }
    }

    /// Cancels the thread and waits for it to exit.
    pub fn stop(&mut self) {
        self.cancel.cancel();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for Autosaver {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::SearchOptions;

    fn filled(n: usize) -> HnswIndex {
        let mut index = HnswIndex::new(HnswConfig::new(4).with_m(8)).expect("new");
        for i in 0..n {
            let v = [
                (i % 13) as f32,
                (i % 7) as f32,
                (i % 5) as f32,
                (i % 3) as f32,
            ];
            index.insert(&format!("n{i}"), &v).expect("insert");
        }
        index
    }

    #[test]
    fn test_crc_field_at_documented_offset() {
        assert_eq!(std::mem::offset_of!(SnapshotHeader, body_crc), 48);
    }

    #[test]
    fn test_save_load_identical_topk() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("index.vbix");

        let mut index = filled(200);
        index.soft_delete("n3").expect("delete");
        index.save(&path).expect("save");
        assert!(!index.is_dirty());

        let loaded = load(&path).expect("load");
        assert_eq!(loaded.len(), index.len());

        let query = [2.0, 3.0, 1.0, 0.0];
        let before = index
            .search(&query, 10, &SearchOptions::default())
            .expect("search before");
        let after = loaded
            .search(&query, 10, &SearchOptions::default())
            .expect("search after");
        assert_eq!(before.len(), after.len());
        for (a, b) in before.iter().zip(after.iter()) {
            assert_eq!(a.id, b.id);
            assert!((a.distance - b.distance).abs() < 1e-6);
        }
    }

    #[test]
    fn test_truncated_file_is_corruption() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("index.vbix");

        let mut index = filled(100);
        index.save(&path).expect("save");

        let data = fs::read(&path).expect("read");
        let before = data.clone();
        fs::write(&path, &data[..data.len() - 16]).expect("truncate");

        let result = load(&path);
        assert!(matches!(result, Err(IndexError::Corruption(_))));

        // The mangled file is exactly what we wrote; load never rewrites it.
        let after = fs::read(&path).expect("reread");
        assert_eq!(after, before[..before.len() - 16]);
    }

    #[test]
    fn test_bad_magic_is_corruption() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("index.vbix");

        let mut index = filled(10);
        index.save(&path).expect("save");

        let mut data = fs::read(&path).expect("read");
        data[0] = b'X';
        fs::write(&path, &data).expect("mangle");

        assert!(matches!(load(&path), Err(IndexError::Corruption(_))));
    }

    #[test]
    fn test_flipped_body_bit_is_corruption() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("index.vbix");

        let mut index = filled(50);
        index.save(&path).expect("save");

        let mut data = fs::read(&path).expect("read");
        let mid = HEADER_SIZE + (data.len() - HEADER_SIZE) / 2;
        data[mid] ^= 0x01;
        fs::write(&path, &data).expect("mangle");

        assert!(matches!(load(&path), Err(IndexError::Corruption(_))));
    }

    #[test]
    fn test_legacy_version_loads_read_only() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("index.vbix");

        let mut index = filled(20);
        index.save(&path).expect("save");

        // Rewrite the version field to v1. The CRC covers only bytes after
        // offset 52, so the header edit still verifies.
        let mut data = fs::read(&path).expect("read");
        data[4..6].copy_from_slice(&VERSION_LEGACY.to_le_bytes());
        fs::write(&path, &data).expect("rewrite");

        let mut index2 = load(&path).expect("legacy load");
        assert!(index2.read_only);
        assert!(matches!(
            index2.insert("new", &[0.0; 4]),
            Err(IndexError::ReadOnly)
        ));
        // Searches still work.
        let hits = index2
            .search(&[1.0, 1.0, 1.0, 1.0], 3, &SearchOptions::default())
            .expect("search");
        assert!(!hits.is_empty());
    }

    #[test]
    fn test_atomic_save_leaves_no_tmp() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("index.vbix");
        let mut index = filled(10);
        index.save(&path).expect("save");
        assert!(path.exists());
        assert!(!tmp_path(&path).exists());
    }

    #[test]
    fn test_autosaver_persists_dirty_index() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("auto.vbix");

        let shared: Arc<RwLock<Box<dyn VectorIndex>>> =
            Arc::new(RwLock::new(Box::new(filled(30))));
        let mut autosaver =
            Autosaver::spawn(Arc::clone(&shared), path.clone(), Duration::from_millis(20));

        // Wait for at least one tick.
        for _ in 0..100 {
            std::thread::sleep(Duration::from_millis(10));
            if path.exists() {
                break;
            }
        }
        autosaver.stop();

        assert!(path.exists(), "autosave never wrote the snapshot");
        let loaded = load(&path).expect("load autosaved");
        assert_eq!(loaded.len(), 30);
    }
}
