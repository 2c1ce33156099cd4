//! The memory manager: accounting, pressure, the periodic monitor.

use super::{MemoryError, PressureLevel};
use crate::cancel::CancelToken;
use log::{debug, info, warn};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::thread::JoinHandle;
use std::time::Duration;

/// A cache the manager may shrink under pressure.
pub trait EvictableCache: Send + Sync {
    /// Bytes currently held.
    fn size_bytes(&self) -> usize;
    /// Frees at least `bytes` if possible; returns bytes actually freed.
    fn evict_bytes(&self, bytes: usize) -> usize;
}

impl<K, V> EvictableCache for super::cache::LruCache<K, V>
where
    K: std::hash::Hash + Eq + Clone + Send + Sync,
    V: Clone + Send + Sync,
{
    fn size_bytes(&self) -> usize {
        self.size_bytes()
    }

    fn evict_bytes(&self, bytes: usize) -> usize {
        self.evict(bytes)
    }
}

/// A component able to offload its bulk bytes to a memory-mapped file.
pub trait Mappable: Send + Sync {
    /// Estimated heap bytes the component would shed if offloaded.
    fn estimated_size(&self) -> usize;
    /// True once offloaded.
    fn mmap_enabled(&self) -> bool;
    /// Offloads; returns the heap bytes shed.
    fn enable_mmap(&self) -> Result<usize, MemoryError>;
}

/// Pressure notification. Invoked outside the manager's locks.
pub type PressureCallback = Arc<dyn Fn(PressureLevel) + Send + Sync>;

/// Release hook: frees what it can, reports the bytes freed.
pub type ReleaseCallback = Arc<dyn Fn() -> usize + Send + Sync>;

/// Manager tuning.
#[derive(Clone, Debug)]
pub struct MemoryManagerConfig {
    /// Heap budget in bytes; `None` disables pressure logic.
    pub limit: Option<usize>,
    /// Monitor tick interval.
    pub monitor_interval: Duration,
    /// Mappables at or above this estimated size are offloaded
    /// opportunistically.
    pub mmap_threshold: usize,
    /// Usage ratio at which release callbacks run automatically.
    pub gc_threshold: f64,
    /// Whether the monitor runs release callbacks on its own.
    pub auto_gc: bool,
    /// Eviction aims for this fraction of the limit.
    pub eviction_target: f64,
}

impl Default for MemoryManagerConfig {
    fn default() -> Self {
        Self {
            limit: None,
            monitor_interval: Duration::from_secs(5),
            mmap_threshold: 256 * 1024 * 1024,
            gc_threshold: 0.85,
            auto_gc: true,
            eviction_target: 0.80,
        }
    }
}

/// A usage report.
#[derive(Clone, Debug, PartialEq)]
pub struct MemoryUsage {
    /// Heap-resident index bytes.
    pub index_bytes: usize,
    /// Bytes held by registered caches.
    pub cache_bytes: usize,
    /// Bytes of quantized data.
    pub quantized_bytes: usize,
    /// Memory-mapped bytes. Not counted against the limit.
    pub mmap_bytes: usize,
    /// `index + cache + quantized`.
    pub total_heap: usize,
    /// The configured limit, if any.
    pub limit: Option<usize>,
    /// `limit - total_heap`, saturating.
    pub available: Option<usize>,
    /// Current pressure band.
    pub level: PressureLevel,
}

#[derive(Default)]
struct Registries {
    caches: Vec<(String, Arc<dyn EvictableCache>)>,
    mappables: Vec<(String, Arc<dyn Mappable>)>,
    pressure_callbacks: Vec<PressureCallback>,
    release_callbacks: Vec<ReleaseCallback>,
}

/// Budgets RAM across index, cache, and quantized buckets; offloads to mmap
/// and evicts under pressure.
///
/// Accounting writes are lock-free atomics. The registries sit behind a
/// read/write lock, and callbacks are cloned out before invocation so no
/// callback ever runs inside the manager's critical section.
pub struct MemoryManager {
    config: RwLock<MemoryManagerConfig>,
    index_bytes: AtomicUsize,
    quantized_bytes: AtomicUsize,
    mmap_bytes: AtomicUsize,
    registries: RwLock<Registries>,
    last_level: Mutex<PressureLevel>,
    monitor: Mutex<Option<(CancelToken, JoinHandle<()>)>>,
}

impl MemoryManager {
    /// Creates a manager.
    #[must_use]
    pub fn new(config: MemoryManagerConfig) -> Self {
        Self {
            config: RwLock::new(config),
            index_bytes: AtomicUsize::new(0),
            quantized_bytes: AtomicUsize::new(0),
            mmap_bytes: AtomicUsize::new(0),
            registries: RwLock::new(Registries::default()),
            last_level: Mutex::new(PressureLevel::None),
            monitor: Mutex::new(None),
        }
    }

    fn read_config(&self) -> MemoryManagerConfig {
        self.config
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }

    /// Replaces the heap budget.
    pub fn set_limit(&self, limit: Option<usize>) {
        self.config
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .limit = limit;
    }

    /// Sets the index bucket to an absolute value.
    pub fn set_index_bytes(&self, bytes: usize) {
        self.index_bytes.store(bytes, Ordering::Relaxed);
    }

    /// Sets the quantized bucket to an absolute value.
    pub fn set_quantized_bytes(&self, bytes: usize) {
        self.quantized_bytes.store(bytes, Ordering::Relaxed);
    }

    /// Sets the mmap bucket to an absolute value.
    pub fn set_mmap_bytes(&self, bytes: usize) {
        self.mmap_bytes.store(bytes, Ordering::Relaxed);
    }

    fn cache_bytes(&self) -> usize {
        self.registries
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .caches
            .iter()
            .map(|(_, c)| c.size_bytes())
            .sum()
    }

    /// Reads all buckets and classifies pressure.
    #[must_use]
    pub fn get_usage(&self) -> MemoryUsage {
        let index_bytes = self.index_bytes.load(Ordering::Relaxed);
        let quantized_bytes = self.quantized_bytes.load(Ordering::Relaxed);
        let mmap_bytes = self.mmap_bytes.load(Ordering::Relaxed);
        let cache_bytes = self.cache_bytes();
        let total_heap = index_bytes + cache_bytes + quantized_bytes;
        let limit = self.read_config().limit;
        let level = match limit {
            #[allow(clippy::cast_precision_loss)]
            Some(limit) if limit > 0 => {
                PressureLevel::from_ratio(total_heap as f64 / limit as f64)
            }
            _ => PressureLevel::None,
        };
        MemoryUsage {
            index_bytes,
            cache_bytes,
            quantized_bytes,
            mmap_bytes,
            total_heap,
            limit,
            available: limit.map(|l| l.saturating_sub(total_heap)),
            level,
        }
    }

    /// Registers a cache for accounting and pressure eviction.
    pub fn register_cache(&self, name: &str, cache: Arc<dyn EvictableCache>) {
        self.registries
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .caches
            .push((name.to_string(), cache));
    }

    /// Registers a mappable for opportunistic and forced offload.
    pub fn register_mappable(&self, name: &str, mappable: Arc<dyn Mappable>) {
        self.registries
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .mappables
            .push((name.to_string(), mappable));
    }

    /// Registers a pressure-level callback.
    pub fn on_pressure(&self, callback: PressureCallback) {
        self.registries
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .pressure_callbacks
            .push(callback);
    }

    /// Registers a release hook, run by [`MemoryManager::trigger_gc`].
    pub fn on_release(&self, callback: ReleaseCallback) {
        self.registries
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .release_callbacks
            .push(callback);
    }

    /// Runs every release hook, returning total bytes reported freed.
    pub fn trigger_gc(&self) -> usize {
        let callbacks: Vec<ReleaseCallback> = {
            let reg = self
                .registries
                .read()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            reg.release_callbacks.clone()
        };
        let mut freed = 0usize;
        for cb in callbacks {
            freed += cb();
        }
        if freed > 0 {
            debug!("release hooks freed {freed} bytes");
        }
        freed
    }

    /// Evicts caches toward the target ratio, then offloads mappables
    /// (largest first) if eviction alone is not enough. Returns bytes freed
    /// from the heap buckets.
    pub fn handle_limit_exceeded(&self) -> usize {
        let config = self.read_config();
        let Some(limit) = config.limit else {
            return 0;
        };
        let usage = self.get_usage();
        #[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let target = (limit as f64 * config.eviction_target) as usize;
        if usage.total_heap <= target {
            return 0;
        }
        let mut need = usage.total_heap - target;
        let mut freed_total = 0usize;

        // Proportional cache eviction.
        let caches: Vec<(String, Arc<dyn EvictableCache>)> = {
            self.registries
                .read()
                .unwrap_or_else(std::sync::PoisonError::into_inner)
                .caches
                .clone()
        };
        let cache_total: usize = caches.iter().map(|(_, c)| c.size_bytes()).sum();
        if cache_total > 0 {
            for (name, cache) in &caches {
                let share = cache.size_bytes() as f64 / cache_total as f64;
                #[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation, clippy::cast_sign_loss)]
                let ask = (need as f64 * share).ceil() as usize;
                let freed = cache.evict_bytes(ask.min(need));
                debug!("evicted {freed} bytes from cache {name}");
                freed_total += freed;
            }
        }
        need = need.saturating_sub(freed_total);

        // Still over: push the biggest mappables out to disk.
        if need > 0 {
            let mut mappables: Vec<(String, Arc<dyn Mappable>)> = {
                self.registries
                    .read()
                    .unwrap_or_else(std::sync::PoisonError::into_inner)
                    .mappables
                    .clone()
            };
            mappables.sort_by_key(|(_, m)| std::cmp::Reverse(m.estimated_size()));
            for (name, mappable) in mappables {
                if need == 0 {
                    break;
                }
                if mappable.mmap_enabled() {
                    continue;
                }
                match mappable.enable_mmap() {
                    Ok(shed) => {
                        info!("offloaded {name} to mmap, {shed} heap bytes shed");
                        self.index_bytes
                            .fetch_sub(shed.min(self.index_bytes.load(Ordering::Relaxed)), Ordering::Relaxed);
                        self.mmap_bytes.fetch_add(shed, Ordering::Relaxed);
                        freed_total += shed;
                        need = need.saturating_sub(shed);
                    }
                    Err(e) => warn!("mmap offload of {name} failed: {e}"),
                }
            }
        }

        freed_total
    }

    /// One monitor pass: opportunistic mmap, pressure transitions, auto-GC.
    pub fn tick(&self) {
        let config = self.read_config();

        // (a) Opportunistic offload of anything past the threshold.
        let mappables: Vec<(String, Arc<dyn Mappable>)> = {
            self.registries
                .read()
                .unwrap_or_else(std::sync::PoisonError::into_inner)
                .mappables
                .clone()
        };
        for (name, mappable) in mappables {
            if !mappable.mmap_enabled() && mappable.estimated_size() >= config.mmap_threshold {
                match mappable.enable_mmap() {
                    Ok(shed) => {
                        info!("opportunistically offloaded {name} ({shed} bytes) to mmap");
                        self.index_bytes
                            .fetch_sub(shed.min(self.index_bytes.load(Ordering::Relaxed)), Ordering::Relaxed);
                        self.mmap_bytes.fetch_add(shed, Ordering::Relaxed);
                    }
                    Err(e) => warn!("mmap offload of {name} failed: {e}"),
                }
            }
        }

        // (b) Pressure transitions fire callbacks and, from High up, eviction.
        let usage = self.get_usage();
        let crossed = {
            let mut last = self
                .last_level
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            let crossed = usage.level != *last;
            *last = usage.level;
            crossed
        };
        if crossed {
            info!("memory pressure now {} ({} bytes)", usage.level, usage.total_heap);
            let callbacks: Vec<PressureCallback> = {
                self.registries
                    .read()
                    .unwrap_or_else(std::sync::PoisonError::into_inner)
                    .pressure_callbacks
                    .clone()
            };
            for cb in callbacks {
                cb(usage.level);
            }
            if usage.level >= PressureLevel::High {
                self.handle_limit_exceeded();
            }
        }

        // (c) Auto-GC past the threshold.
        if config.auto_gc {
            if let Some(limit) = config.limit {
                #[allow(clippy::cast_precision_loss)]
                let ratio = usage.total_heap as f64 / limit as f64;
                if limit > 0 && ratio >= config.gc_threshold {
                    let freed = self.trigger_gc();
                    debug!("auto-gc at ratio {ratio:.2} freed {freed} bytes");
                }
            }
        }
    }

    /// Starts the periodic monitor thread.
    pub fn start_monitor(self: &Arc<Self>) {
        let mut guard = self
            .monitor
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if guard.is_some() {
            return;
        }
        let cancel = CancelToken::new();
        let token = cancel.clone();
        let manager = Arc::clone(self);
        let interval = self.read_config().monitor_interval;
        let handle = std::thread::Builder::new()
            .name("vecbase-memory-monitor".into())
            .spawn(move || {
                while !token.wait_timeout(interval) {
                    manager.tick();
                }
            })
            .expect("failed to spawn memory monitor");
        *guard = Some((cancel, handle));
    }

    /// Stops the monitor thread, joining it.
    pub fn stop_monitor(&self) {
        let taken = {
            let mut guard = self
                .monitor
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            guard.take()
        };
        if let Some((cancel, handle)) = taken {
            cancel.cancel();
            let _ = handle.join();
        }
    }
}

impl Drop for MemoryManager {
    fn drop(&mut self) {
        self.stop_monitor();
    }
}
