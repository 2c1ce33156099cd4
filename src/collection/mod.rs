//! The collection: storage, index, and memory control wired together.
//!
//! A collection owns its entry store, WAL, index, and memory manager
//! exclusively. Writes run under one critical section — WAL append, index
//! insert, store put — so a crash between any two of them is repaired by
//! WAL replay on the next open. Searches take the read side and may run
//! concurrently with each other.

mod config;

pub use config::{CollectionConfig, HnswParams, CONFIG_FILE, CONFIG_VERSION};

use crate::cancel::CancelToken;
use crate::error::Error;
use crate::hnsw::{Autosaver, HnswIndex};
use crate::index::{FlatIndex, IndexKind, IvfPqConfig, IvfPqIndex, SearchOptions, VectorIndex};
use crate::memory::{
    MemoryManager, MemoryManagerConfig, MemoryUsage, PressureLevel, RecoveryConfig,
    RecoveryManager,
};
use crate::metadata::Metadata;
use crate::metrics;
use crate::quant::{registry, Quantizer};
use crate::query::{
    candidate_budget, order_by_selectivity, QueryBuilder, QuerySpec, SearchHit, SearchResponse,
};
use crate::store::{EntryStore, VectorEntry};
use crate::wal::{Wal, WalOptions, WalRecord};
use log::{info, warn};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

/// Default storage base path for [`Collection::open_default`].
pub const DEFAULT_BASE_PATH: &str = "./data";

/// Index snapshot file name inside the collection directory.
pub const INDEX_FILE: &str = "index.vbix";

/// WAL directory name inside the collection directory.
pub const WAL_DIR: &str = "wal";

/// Refresh memory accounting every this many writes.
const ACCOUNTING_STRIDE: usize = 64;

/// Knobs for [`Collection::optimize`].
#[derive(Clone, Debug)]
pub struct OptimizeOptions {
    /// Rebuild the index without tombstones.
    pub compact_index: bool,
    /// Rewrite the WAL to just the live entry set.
    pub rewrite_wal: bool,
    /// Snapshot the index afterwards.
    pub save_index: bool,
}

impl Default for OptimizeOptions {
    fn default() -> Self {
        Self {
            compact_index: true,
            rewrite_wal: true,
            save_index: true,
        }
    }
}

/// A point-in-time summary of the collection.
#[derive(Clone, Debug)]
pub struct CollectionStats {
    /// Live entries in the store.
    pub entry_count: usize,
    /// Which index implementation is active.
    pub index_kind: IndexKind,
    /// Live vectors in the index.
    pub index_len: usize,
    /// Records in the WAL (including tombstones).
    pub wal_records: u64,
    /// Memory accounting snapshot.
    pub memory: MemoryUsage,
}

struct Inner {
    config: CollectionConfig,
    store: EntryStore,
    wal: Wal,
    closed: bool,
}

/// An embeddable vector collection.
pub struct Collection {
    path: PathBuf,
    inner: Arc<RwLock<Inner>>,
    index: Arc<RwLock<Box<dyn VectorIndex>>>,
    memory: Arc<MemoryManager>,
    autosaver: Mutex<Option<Autosaver>>,
    writes_since_accounting: AtomicUsize,
}

impl Collection {
    /// Opens (or creates) a collection at `path`.
    ///
    /// Recovery order: read `config.json` (falling back to the caller's
    /// config for pre-config-file directories), replay the WAL into the
    /// entry store, then warm-start the index from its snapshot — or
    /// rebuild it from the replayed entries when the snapshot is missing,
    /// stale, or corrupt. A corrupt snapshot is left on disk untouched.
    pub fn open(path: impl AsRef<Path>, config: CollectionConfig) -> Result<Self, Error> {
        let path = path.as_ref().to_path_buf();
        fs::create_dir_all(&path)?;
        config.validate()?;

        let config = match config::load_config(&path)? {
            Some(mut on_disk) => {
                if on_disk.dimension != config.dimension {
                    return Err(Error::InvalidConfig(format!(
                        "collection at {} has dimension {}, caller asked for {}",
                        path.display(),
                        on_disk.dimension,
                        config.dimension
                    )));
                }
                // The two runtime-tunable fields adopt the caller's values.
                on_disk.hnsw.ef_search = config.hnsw.ef_search;
                if config.memory_limit.is_some() {
                    on_disk.memory_limit = config.memory_limit;
                }
                on_disk
            }
            None => {
                config::save_config(&path, &config)?;
                config
            }
        };

        let wal_options = WalOptions {
            sync_on_append: config.sync_on_write,
            ..Default::default()
        };
        let (wal, records) = Wal::open(&path.join(WAL_DIR), wal_options)?;
        let store = EntryStore::from_wal(&records);
        info!(
            "collection {} opened: {} entries recovered from wal",
            path.display(),
            store.len()
        );

        let kind = config
            .index_kind
            .unwrap_or_else(|| IndexKind::auto_select(store.len().max(config.expected_size)));

        let snapshot_path = path.join(INDEX_FILE);
        let mut index = Self::open_index(kind, &config, &store, &snapshot_path)?;
        // A snapshot carries its own ef_search; the config's tunable wins.
        index.set_ef_search(config.hnsw.ef_search);

        let memory = Arc::new(MemoryManager::new(MemoryManagerConfig {
            limit: config.memory_limit,
            ..Default::default()
        }));
        memory.set_index_bytes(index.memory_usage());
        memory.start_monitor();

        let index = Arc::new(RwLock::new(index));
        let autosaver = config.autosave_interval_secs.map(|secs| {
            Autosaver::spawn(
                Arc::clone(&index),
                snapshot_path,
                Duration::from_secs(secs.max(1)),
            )
        });

        Ok(Self {
            path,
            inner: Arc::new(RwLock::new(Inner {
                config,
                store,
                wal,
                closed: false,
            })),
            index,
            memory,
            autosaver: Mutex::new(autosaver),
            writes_since_accounting: AtomicUsize::new(0),
        })
    }

    /// Opens a named collection under [`DEFAULT_BASE_PATH`].
    pub fn open_default(name: &str, config: CollectionConfig) -> Result<Self, Error> {
        Self::open(Path::new(DEFAULT_BASE_PATH).join(name), config)
    }

    fn build_index(
        kind: IndexKind,
        config: &CollectionConfig,
    ) -> Result<Box<dyn VectorIndex>, Error> {
        Ok(match kind {
            IndexKind::Flat => Box::new(FlatIndex::new(config.dimension, config.metric)),
            IndexKind::Hnsw => Box::new(HnswIndex::new(config.hnsw_config())?),
            IndexKind::IvfPq => Box::new(IvfPqIndex::new(
                IvfPqConfig::new(config.dimension),
                config.metric,
            )?),
        })
    }

    /// Warm-starts from the snapshot when it matches the replayed store,
    /// otherwise rebuilds from the store.
    fn open_index(
        kind: IndexKind,
        config: &CollectionConfig,
        store: &EntryStore,
        snapshot_path: &Path,
    ) -> Result<Box<dyn VectorIndex>, Error> {
        if snapshot_path.exists() {
            let mut index = Self::build_index(kind, config)?;
            match index.load(snapshot_path) {
                Ok(()) if index.len() == store.len() => return Ok(index),
                Ok(()) => {
                    warn!(
                        "index snapshot has {} vectors but wal replay has {}; rebuilding",
                        index.len(),
                        store.len()
                    );
                }
                Err(e) if e.is_corruption() => {
                    warn!("index snapshot corrupt ({e}); rebuilding from wal");
                }
                Err(e) => return Err(e.into()),
            }
        }

        let mut index = Self::build_index(kind, config)?;
        if kind == IndexKind::Hnsw {
            if let Some(quantizer) = Self::trained_quantizer(config, store)? {
                index = Box::new(HnswIndex::with_quantizer(config.hnsw_config(), quantizer)?);
            }
        }
        for entry in store.iter() {
            index.insert(&entry.id, &entry.vector)?;
        }
        Ok(index)
    }

    /// Trains the configured quantizer on the recovered entries, if there
    /// are enough of them. Too few just means the index runs unquantized
    /// until a later `optimize`.
    fn trained_quantizer(
        config: &CollectionConfig,
        store: &EntryStore,
    ) -> Result<Option<Box<dyn Quantizer>>, Error> {
        let Some(qconfig) = &config.quantization else {
            return Ok(None);
        };
        let needed = 1usize << qconfig.bits;
        if store.len() < needed {
            info!(
                "quantization configured but only {} entries (need {needed}); deferring",
                store.len()
            );
            return Ok(None);
        }
        let mut quantizer = registry::create(qconfig)?;
        let sample: Vec<Vec<f32>> = store.iter().map(|e| e.vector.clone()).collect();
        quantizer.train(&sample, &CancelToken::new())?;
        Ok(Some(quantizer))
    }

    fn read_inner(&self) -> Result<RwLockReadGuard<'_, Inner>, Error> {
        let guard = self
            .inner
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if guard.closed {
            return Err(Error::Closed);
        }
        Ok(guard)
    }

    fn write_inner(&self) -> Result<RwLockWriteGuard<'_, Inner>, Error> {
        let guard = self
            .inner
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if guard.closed {
            return Err(Error::Closed);
        }
        Ok(guard)
    }

    fn read_index(&self) -> RwLockReadGuard<'_, Box<dyn VectorIndex>> {
        self.index
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn write_index(&self) -> RwLockWriteGuard<'_, Box<dyn VectorIndex>> {
        self.index
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Critical pressure routes through staged recovery before any write is
    /// admitted; only if recovery fails does the caller see the error.
    fn check_pressure(&self) -> Result<(), Error> {
        let usage = self.memory.get_usage();
        if usage.level < PressureLevel::Critical {
            return Ok(());
        }
        let recovery = RecoveryManager::new(Arc::clone(&self.memory), RecoveryConfig::default());
        match recovery.recover(&CancelToken::new()) {
            Ok(report) => {
                info!(
                    "pressure recovery freed {} bytes at {:?} stage",
                    report.bytes_freed, report.final_stage
                );
                Ok(())
            }
            Err(e) => {
                warn!("pressure recovery failed: {e}");
                let usage = self.memory.get_usage();
                Err(Error::Memory(crate::memory::MemoryError::PressureCritical {
                    usage: usage.total_heap,
                    limit: usage.limit.unwrap_or(0),
                }))
            }
        }
    }

    fn maybe_refresh_accounting(&self) {
        let writes = self
            .writes_since_accounting
            .fetch_add(1, Ordering::Relaxed)
            + 1;
        if writes % ACCOUNTING_STRIDE == 0 {
            self.memory.set_index_bytes(self.read_index().memory_usage());
        }
    }

    /// Inserts (or replaces) an entry.
    pub fn insert(&self, id: &str, vector: &[f32], metadata: Metadata) -> Result<(), Error> {
        if id.is_empty() {
            return Err(Error::InvalidConfig("id must be non-empty".into()));
        }
        self.check_pressure()?;

        let mut inner = self.write_inner()?;
        if vector.len() != inner.config.dimension {
            return Err(Error::DimensionMismatch {
                expected: inner.config.dimension,
                actual: vector.len(),
            });
        }
        if let Some(schema) = &inner.config.schema {
            schema
                .validate(&metadata)
                .map_err(|e| Error::SchemaViolation(e.to_string()))?;
        }

        let record = WalRecord::insert(id, vector.to_vec(), metadata.clone());
        inner.wal.append(&record)?;

        {
            let mut index = self.write_index();
            if inner.store.contains(id) {
                // Replacement: the old vector leaves the index first.
                let _ = index.delete(id);
            }
            if let Err(e) = index.insert(id, vector) {
                // Compensate the WAL so replay matches the failed state.
                let _ = inner.wal.append(&WalRecord::tombstone(id, now_millis()));
                return Err(e.into());
            }
        }

        inner.store.put(VectorEntry::new(id, vector.to_vec(), metadata));
        drop(inner);

        metrics::record_insert();
        self.maybe_refresh_accounting();
        Ok(())
    }

    /// Best-effort batch insert.
    ///
    /// A dimension mismatch on the first vector is fatal; later mismatches,
    /// duplicate ids within the batch, and non-finite vectors are skipped.
    /// Returns the ids actually inserted, in order.
    pub fn insert_batch(
        &self,
        batch: Vec<(String, Vec<f32>, Metadata)>,
    ) -> Result<Vec<String>, Error> {
        if batch.is_empty() {
            return Ok(Vec::new());
        }
        let dimension = self.read_inner()?.config.dimension;
        if batch[0].1.len() != dimension {
            return Err(Error::DimensionMismatch {
                expected: dimension,
                actual: batch[0].1.len(),
            });
        }

        let mut inserted = Vec::new();
        let mut seen: std::collections::HashSet<String> = std::collections::HashSet::new();
        for (id, vector, metadata) in batch {
            if id.is_empty() || !seen.insert(id.clone()) {
                continue;
            }
            if vector.len() != dimension {
                continue;
            }
            if vector.iter().any(|x| !x.is_finite()) {
                continue;
            }
            self.insert(&id, &vector, metadata)?;
            inserted.push(id);
        }
        Ok(inserted)
    }

    /// Partial update: either part may be absent; both absent is a no-op.
    /// Metadata merges shallowly (incoming keys overwrite, unseen keys
    /// survive).
    pub fn update(
        &self,
        id: &str,
        vector: Option<&[f32]>,
        metadata: Option<Metadata>,
    ) -> Result<(), Error> {
        if vector.is_none() && metadata.is_none() {
            return Ok(());
        }
        let mut inner = self.write_inner()?;
        if !inner.store.contains(id) {
            return Err(Error::NotFound { id: id.to_string() });
        }
        if let Some(v) = vector {
            if v.len() != inner.config.dimension {
                return Err(Error::DimensionMismatch {
                    expected: inner.config.dimension,
                    actual: v.len(),
                });
            }
        }

        let record = WalRecord::update(id, vector.map(<[f32]>::to_vec), metadata);
        inner.wal.append(&record)?;

        if let Some(v) = vector {
            let mut index = self.write_index();
            let _ = index.delete(id);
            index.insert(id, v)?;
        }
        inner.store.apply(&record);
        drop(inner);

        self.maybe_refresh_accounting();
        Ok(())
    }

    /// Deletes an entry. Permissive: deleting an unknown id still writes a
    /// tombstone and succeeds.
    pub fn delete(&self, id: &str) -> Result<(), Error> {
        let mut inner = self.write_inner()?;
        let record = WalRecord::tombstone(id, now_millis());
        inner.wal.append(&record)?;

        {
            let mut index = self.write_index();
            // The index may never have seen this id; that's fine.
            let _ = index.delete(id);
        }
        inner.store.remove(id);
        drop(inner);

        self.maybe_refresh_accounting();
        Ok(())
    }

    /// Nearest-neighbor search without filters.
    pub fn search(&self, query: &[f32], k: usize) -> Result<SearchResponse, Error> {
        self.execute_spec(&QuerySpec {
            vector: Some(query.to_vec()),
            k,
            ..Default::default()
        })
    }

    /// Starts a fluent query.
    #[must_use]
    pub fn query(&self) -> QueryBuilder<'_> {
        QueryBuilder::new(self)
    }

    pub(crate) fn execute_spec(&self, spec: &QuerySpec) -> Result<SearchResponse, Error> {
        let start = Instant::now();
        let result = self.execute_spec_inner(spec, start);
        match &result {
            Ok(_) => metrics::record_search(start.elapsed()),
            Err(_) => metrics::record_search_error(),
        }
        result
    }

    fn execute_spec_inner(
        &self,
        spec: &QuerySpec,
        start: Instant,
    ) -> Result<SearchResponse, Error> {
        if spec.k == 0 {
            return Err(Error::InvalidConfig("k must be > 0".into()));
        }
        let inner = self.read_inner()?;

        // Stage 1: candidates, scored. ANN when a vector is present, the
        // whole store for pure metadata queries.
        let mut scores: HashMap<String, f32> = HashMap::new();
        let mut rank: HashMap<String, usize> = HashMap::new();
        let candidates: Vec<&VectorEntry> = if let Some(vector) = &spec.vector {
            if vector.len() != inner.config.dimension {
                return Err(Error::DimensionMismatch {
                    expected: inner.config.dimension,
                    actual: vector.len(),
                });
            }
            let budget = if spec.filters.is_empty() {
                spec.k
            } else {
                candidate_budget(spec.k, &spec.filters)
            };
            let neighbors = {
                let index = self.read_index();
                index.search(
                    vector,
                    budget,
                    &SearchOptions {
                        ef_search: spec.ef_search,
                        n_probes: None,
                    },
                )?
            };
            let mut out = Vec::with_capacity(neighbors.len());
            for (position, neighbor) in neighbors.into_iter().enumerate() {
                if let Some(entry) = inner.store.get(&neighbor.id) {
                    scores.insert(neighbor.id.clone(), neighbor.distance);
                    rank.insert(neighbor.id, position);
                    out.push(entry);
                }
            }
            out
        } else {
            inner.store.iter().collect()
        };

        // Stage 2: filters, most selective first; scores ride along by id.
        let mut survivors = candidates;
        for filter in order_by_selectivity(spec.filters.clone()) {
            if survivors.is_empty() {
                break;
            }
            survivors = filter.apply(&survivors);
        }

        // Stage 3: threshold, order, truncate.
        if let Some(threshold) = spec.threshold {
            survivors.retain(|e| scores.get(&e.id).copied().unwrap_or(0.0) <= threshold);
        }
        survivors.sort_by(|a, b| {
            let da = scores.get(&a.id).copied().unwrap_or(0.0);
            let db = scores.get(&b.id).copied().unwrap_or(0.0);
            da.total_cmp(&db).then_with(|| {
                let ra = rank.get(&a.id).copied().unwrap_or(usize::MAX);
                let rb = rank.get(&b.id).copied().unwrap_or(usize::MAX);
                ra.cmp(&rb)
            })
        });
        let total = survivors.len();
        survivors.truncate(spec.k);

        let results: Vec<SearchHit> = survivors
            .into_iter()
            .map(|entry| SearchHit {
                id: entry.id.clone(),
                score: scores.get(&entry.id).copied().unwrap_or(0.0),
                vector: entry.vector.clone(),
                metadata: entry.metadata.clone(),
            })
            .collect();

        Ok(SearchResponse {
            results,
            took: start.elapsed(),
            total,
        })
    }

    /// Fetches a deep copy of one entry.
    pub fn get(&self, id: &str) -> Result<Option<VectorEntry>, Error> {
        Ok(self.read_inner()?.store.get(id).cloned())
    }

    /// True when an entry exists.
    pub fn contains(&self, id: &str) -> Result<bool, Error> {
        Ok(self.read_inner()?.store.contains(id))
    }

    /// Live entry count.
    pub fn len(&self) -> Result<usize, Error> {
        Ok(self.read_inner()?.store.len())
    }

    /// True when the collection holds no entries.
    pub fn is_empty(&self) -> Result<bool, Error> {
        Ok(self.read_inner()?.store.is_empty())
    }

    /// Collection summary.
    pub fn stats(&self) -> Result<CollectionStats, Error> {
        let inner = self.read_inner()?;
        let (index_kind, index_len, index_bytes) = {
            let index = self.read_index();
            (index.kind(), index.len(), index.memory_usage())
        };
        self.memory.set_index_bytes(index_bytes);
        Ok(CollectionStats {
            entry_count: inner.store.len(),
            index_kind,
            index_len,
            wal_records: inner.wal.record_count(),
            memory: self.memory.get_usage(),
        })
    }

    /// Memory accounting, refreshed.
    pub fn get_memory_usage(&self) -> Result<MemoryUsage, Error> {
        let _inner = self.read_inner()?;
        let bytes = self.read_index().memory_usage();
        self.memory.set_index_bytes(bytes);
        Ok(self.memory.get_usage())
    }

    /// Adjusts the heap budget at runtime and persists it.
    pub fn set_memory_limit(&self, limit: Option<usize>) -> Result<(), Error> {
        let mut inner = self.write_inner()?;
        inner.config.memory_limit = limit;
        self.memory.set_limit(limit);
        config::save_config(&self.path, &inner.config)
    }

    /// Adjusts the query beam width at runtime and persists it.
    pub fn set_ef_search(&self, ef_search: usize) -> Result<(), Error> {
        let mut inner = self.write_inner()?;
        inner.config.hnsw.ef_search = ef_search;
        self.write_index().set_ef_search(ef_search);
        config::save_config(&self.path, &inner.config)
    }

    /// Runs registered release hooks; returns bytes reported freed.
    pub fn trigger_gc(&self) -> usize {
        self.memory.trigger_gc()
    }

    /// The memory manager, for registering caches, mappables, and
    /// callbacks.
    #[must_use]
    pub fn memory_manager(&self) -> &Arc<MemoryManager> {
        &self.memory
    }

    /// Maintenance: compact the index, rewrite the WAL to the live set,
    /// snapshot.
    pub fn optimize(&self, options: &OptimizeOptions) -> Result<(), Error> {
        let mut inner = self.write_inner()?;
        if options.compact_index {
            let reclaimed = self.write_index().optimize()?;
            if reclaimed > 0 {
                info!("index compaction reclaimed {reclaimed} slot(s)");
            }
        }
        if options.rewrite_wal {
            let records: Vec<WalRecord> = inner
                .store
                .iter()
                .map(|e| WalRecord::insert(&e.id, e.vector.clone(), e.metadata.clone()))
                .collect();
            inner.wal.rewrite(records.iter())?;
        }
        if options.save_index {
            self.write_index().save(&self.path.join(INDEX_FILE))?;
        }
        drop(inner);
        self.memory.set_index_bytes(self.read_index().memory_usage());
        Ok(())
    }

    /// Fsyncs the WAL and snapshots the index.
    pub fn flush(&self) -> Result<(), Error> {
        let mut inner = self.write_inner()?;
        inner.wal.sync()?;
        self.write_index().save(&self.path.join(INDEX_FILE))?;
        Ok(())
    }

    /// Snapshots the index to an explicit path.
    pub fn save_index(&self, path: &Path) -> Result<(), Error> {
        let _inner = self.read_inner()?;
        self.write_index().save(path)?;
        Ok(())
    }

    /// Replaces the in-memory index from a snapshot.
    pub fn load_index(&self, path: &Path) -> Result<(), Error> {
        let inner = self.read_inner()?;
        let mut index = self.write_index();
        index.load(path)?;
        if index.len() != inner.store.len() {
            warn!(
                "loaded index has {} vectors, store has {}",
                index.len(),
                inner.store.len()
            );
        }
        Ok(())
    }

    /// Shuts the collection down: stops background tasks, fsyncs the WAL,
    /// snapshots the index, and rejects every subsequent operation with
    /// `Closed`. Idempotent.
    pub fn close(&self) -> Result<(), Error> {
        {
            let mut autosaver = self
                .autosaver
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            if let Some(mut saver) = autosaver.take() {
                saver.stop();
            }
        }
        self.memory.stop_monitor();

        let mut inner = self
            .inner
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if inner.closed {
            return Ok(());
        }
        inner.wal.sync()?;
        {
            let mut index = self.write_index();
            index.save(&self.path.join(INDEX_FILE))?;
            index.close()?;
        }
        inner.closed = true;
        info!("collection {} closed", self.path.display());
        Ok(())
    }
}

impl Drop for Collection {
    fn drop(&mut self) {
        // Background tasks must not outlive the collection. Data stays safe
        // without a final snapshot: the WAL already holds every mutation.
        {
            let mut autosaver = self
                .autosaver
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            if let Some(mut saver) = autosaver.take() {
                saver.stop();
            }
        }
        self.memory.stop_monitor();
    }
}

fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| i64::try_from(d.as_millis()).unwrap_or(i64::MAX))
        .unwrap_or(0)
}
