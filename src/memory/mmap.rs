//! Raw memory-mapped file lifecycle.

use super::MemoryError;
use log::debug;
use memmap2::MmapMut;
use std::collections::HashMap;
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

/// A writable memory-mapped file.
///
/// Reads and writes go straight through the mapping; [`MmapFile::sync`]
/// flushes dirty pages, [`MmapFile::resize`] remaps (exclusive access by
/// `&mut self`), and [`MmapFile::close`] unmaps before closing the backing
/// file. Operations after close fail with [`MemoryError::MmapClosed`].
pub struct MmapFile {
    path: PathBuf,
    file: Option<std::fs::File>,
    mmap: Option<MmapMut>,
    len: usize,
}

impl MmapFile {
    /// Creates (or truncates) a file of `size` bytes and maps it.
    pub fn create(path: &Path, size: usize) -> Result<Self, MemoryError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        file.set_len(size as u64)?;
        // SAFETY: the file is exclusively owned by this handle for the
        // mapping's lifetime; external truncation is the caller's contract.
        let mmap = unsafe { MmapMut::map_mut(&file)? };
        Ok(Self {
            path: path.to_path_buf(),
            file: Some(file),
            mmap: Some(mmap),
            len: size,
        })
    }

    /// Opens and maps an existing file at its current length.
    pub fn open(path: &Path) -> Result<Self, MemoryError> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let len = usize::try_from(file.metadata()?.len()).unwrap_or(usize::MAX);
        // SAFETY: as in `create`.
        let mmap = unsafe { MmapMut::map_mut(&file)? };
        Ok(Self {
            path: path.to_path_buf(),
            file: Some(file),
            mmap: Some(mmap),
            len,
        })
    }

    /// The mapped bytes.
    pub fn data(&self) -> Result<&[u8], MemoryError> {
        self.mmap.as_deref().ok_or(MemoryError::MmapClosed)
    }

    /// The mapped bytes, writable.
    pub fn data_mut(&mut self) -> Result<&mut [u8], MemoryError> {
        self.mmap.as_deref_mut().ok_or(MemoryError::MmapClosed)
    }

    /// Mapping length in bytes.
    #[must_use]
    pub fn size(&self) -> usize {
        self.len
    }

    /// The backing file path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Flushes dirty pages to the backing file.
    pub fn sync(&self) -> Result<(), MemoryError> {
        let mmap = self.mmap.as_ref().ok_or(MemoryError::MmapClosed)?;
        mmap.flush()?;
        Ok(())
    }

    /// Grows or shrinks the file and remaps.
    ///
    /// Exclusive access is enforced by `&mut self`; the old mapping is
    /// dropped before the file length changes.
    pub fn resize(&mut self, new_size: usize) -> Result<(), MemoryError> {
        let file = self.file.as_ref().ok_or(MemoryError::MmapClosed)?;
        // Unmap before touching the file length.
        self.mmap = None;
        file.set_len(new_size as u64)?;
        // SAFETY: as in `create`.
        let mmap = unsafe { MmapMut::map_mut(file)? };
        self.mmap = Some(mmap);
        self.len = new_size;
        Ok(())
    }

    /// Flushes, unmaps, and closes the backing file.
    pub fn close(&mut self) -> Result<(), MemoryError> {
        if let Some(mmap) = self.mmap.take() {
            mmap.flush()?;
        }
        self.file = None;
        Ok(())
    }

    /// True once [`MmapFile::close`] has run.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.mmap.is_none()
    }
}

impl Drop for MmapFile {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

/// Groups mappings by logical name under one base directory.
pub struct MmapManager {
    base_dir: PathBuf,
    maps: Mutex<HashMap<String, Arc<Mutex<MmapFile>>>>,
}

impl MmapManager {
    /// Creates a manager rooted at `base_dir` (an OS temp subdirectory by
    /// default, via [`MmapManager::with_temp_dir`]).
    #[must_use]
    pub fn new(base_dir: &Path) -> Self {
        Self {
            base_dir: base_dir.to_path_buf(),
            maps: Mutex::new(HashMap::new()),
        }
    }

    /// Creates a manager under `$TMPDIR/vecbase-mmap`.
    #[must_use]
    pub fn with_temp_dir() -> Self {
        Self::new(&std::env::temp_dir().join("vecbase-mmap"))
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Arc<Mutex<MmapFile>>>> {
        self.maps
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Creates (or replaces) a named mapping of `size` bytes.
    pub fn create(&self, name: &str, size: usize) -> Result<Arc<Mutex<MmapFile>>, MemoryError> {
        let path = self.base_dir.join(format!("{name}.mmap"));
        let file = Arc::new(Mutex::new(MmapFile::create(&path, size)?));
        debug!("mmap created: {name} ({size} bytes) at {}", path.display());
        self.lock().insert(name.to_string(), Arc::clone(&file));
        Ok(file)
    }

    /// Looks up a mapping by name.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<Arc<Mutex<MmapFile>>> {
        self.lock().get(name).cloned()
    }

    /// Closes and removes a named mapping, deleting the backing file.
    pub fn remove(&self, name: &str) -> Result<(), MemoryError> {
        if let Some(file) = self.lock().remove(name) {
            let mut guard = file.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
            let path = guard.path().to_path_buf();
            guard.close()?;
            drop(guard);
            let _ = std::fs::remove_file(path);
        }
        Ok(())
    }

    /// Flushes every open mapping.
    pub fn sync_all(&self) -> Result<(), MemoryError> {
        for file in self.lock().values() {
            let guard = file.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
            if !guard.is_closed() {
                guard.sync()?;
            }
        }
        Ok(())
    }

    /// Total mapped bytes across all open mappings.
    #[must_use]
    pub fn total_bytes(&self) -> usize {
        self.lock()
            .values()
            .map(|f| {
                f.lock()
                    .unwrap_or_else(std::sync::PoisonError::into_inner)
                    .size()
            })
            .sum()
    }

    /// Number of managed mappings.
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// True when nothing is mapped.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_write_sync_reopen() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("data.mmap");

        {
            let mut file = MmapFile::create(&path, 64).expect("create");
            file.data_mut().expect("data_mut")[..4].copy_from_slice(b"abcd");
            file.sync().expect("sync");
            file.close().expect("close");
        }

        let file = MmapFile::open(&path).expect("open");
        assert_eq!(file.size(), 64);
        assert_eq!(&file.data().expect("data")[..4], b"abcd");
    }

    #[test]
    fn test_resize_preserves_prefix() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("data.mmap");

        let mut file = MmapFile::create(&path, 16).expect("create");
        file.data_mut().expect("data_mut")[..3].copy_from_slice(b"xyz");
        file.resize(128).expect("grow");
        assert_eq!(file.size(), 128);
        assert_eq!(&file.data().expect("data")[..3], b"xyz");

        file.resize(8).expect("shrink");
        assert_eq!(file.size(), 8);
        assert_eq!(&file.data().expect("data")[..3], b"xyz");
    }

    #[test]
    fn test_closed_file_rejects_access() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("data.mmap");
        let mut file = MmapFile::create(&path, 16).expect("create");
        file.close().expect("close");
        assert!(file.is_closed());
        assert!(matches!(file.data(), Err(MemoryError::MmapClosed)));
        assert!(matches!(file.sync(), Err(MemoryError::MmapClosed)));
    }

    #[test]
    fn test_manager_groups_by_name() {
        let dir = tempfile::tempdir().expect("tempdir");
        let manager = MmapManager::new(dir.path());

        manager.create("index", 1024).expect("create index");
        manager.create("cache", 512).expect("create cache");
        assert_eq!(manager.len(), 2);
        assert_eq!(manager.total_bytes(), 1536);
        assert!(manager.get("index").is_some());
        assert!(manager.get("ghost").is_none());

        manager.sync_all().expect("sync all");
        manager.remove("index").expect("remove");
        assert_eq!(manager.len(), 1);
        assert!(!dir.path().join("index.mmap").exists());
    }
}
