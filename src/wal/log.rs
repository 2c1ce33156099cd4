//! The segmented log: rotation, recovery, compaction.

use super::segment::{read_segment, SegmentWriter};
use super::{WalError, WalRecord};
use log::{info, warn};
use std::fs;
use std::path::{Path, PathBuf};

const SEGMENT_EXTENSION: &str = "wal";

/// WAL tuning knobs.
#[derive(Clone, Debug)]
pub struct WalOptions {
    /// fsync after every append. Durable but slow; off by default, in which
    /// case durability is bounded by explicit [`Wal::sync`] calls.
    pub sync_on_append: bool,
    /// Rotate to a new segment once the active one exceeds this many bytes.
    pub segment_size_limit: u64,
}

impl Default for WalOptions {
    fn default() -> Self {
        Self {
            sync_on_append: false,
            segment_size_limit: 64 * 1024 * 1024,
        }
    }
}

/// A directory of framed, checksummed segment files.
///
/// Single-producer: all appends go through `&mut self`. Recovery happens in
/// [`Wal::open`], strictly before the log accepts writes, so readers never
/// contend with the appender.
pub struct Wal {
    dir: PathBuf,
    options: WalOptions,
    active: SegmentWriter,
    next_segment: u64,
    record_count: u64,
}

impl Wal {
    /// Opens the log in `dir` (creating it if needed), replays every segment
    /// in lexicographic order, and returns the recovered records alongside
    /// the writable log.
    pub fn open(dir: &Path, options: WalOptions) -> Result<(Self, Vec<WalRecord>), WalError> {
        fs::create_dir_all(dir)?;

        let mut segments = list_segments(dir)?;
        segments.sort();

        let mut records = Vec::new();
        for (i, path) in segments.iter().enumerate() {
            let contents = read_segment(path)?;
            if contents.truncated {
                if i + 1 == segments.len() {
                    warn!(
                        "wal segment {} has a truncated tail record; dropped",
                        path.display()
                    );
                    // Cut the partial frame off so new appends follow the
                    // last good record instead of landing after garbage.
                    let file = fs::OpenOptions::new().write(true).open(path)?;
                    file.set_len(contents.valid_len)?;
                    file.sync_data()?;
                } else {
                    // Truncation anywhere but the newest segment means bytes
                    // vanished after a later segment was created.
                    return Err(WalError::Corruption {
                        segment: path.display().to_string(),
                        detail: "truncated record in a non-final segment".into(),
                    });
                }
            }
            records.extend(contents.records);
        }

        let next_segment = segments
            .last()
            .and_then(|p| segment_number(p))
            .map_or(0, |n| n + 1);

        // Resume appends on the newest segment, or start the first one.
        let active_path = match segments.last() {
            Some(path) => path.clone(),
            None => segment_path(dir, 0),
        };
        let active = SegmentWriter::open(&active_path)?;

        info!(
            "wal opened: {} segment(s), {} record(s) recovered",
            segments.len().max(1),
            records.len()
        );

        let record_count = records.len() as u64;
        Ok((
            Self {
                dir: dir.to_path_buf(),
                options,
                active,
                next_segment,
                record_count,
            },
            records,
        ))
    }

    /// Appends one record, rotating first if the active segment is full.
    pub fn append(&mut self, record: &WalRecord) -> Result<(), WalError> {
        if self.active.len() >= self.options.segment_size_limit {
            self.rotate()?;
        }
        self.active.append(record)?;
        if self.options.sync_on_append {
            self.active.sync()?;
        } else {
            self.active.flush()?;
        }
        self.record_count += 1;
        Ok(())
    }

    /// Flushes and fsyncs the active segment.
    pub fn sync(&mut self) -> Result<(), WalError> {
        self.active.sync()
    }

    /// Replaces the entire log with `records`, written to a single fresh
    /// segment. Old segments are deleted only after the replacement is
    /// durable, so a crash mid-compaction leaves a replayable log.
    pub fn rewrite<'a>(
        &mut self,
        records: impl IntoIterator<Item = &'a WalRecord>,
    ) -> Result<(), WalError> {
        let old_segments = {
            let mut s = list_segments(&self.dir)?;
            s.sort();
            s
        };

        let fresh_path = segment_path(&self.dir, self.next_segment);
        self.next_segment += 1;
        let mut fresh = SegmentWriter::open(&fresh_path)?;
        let mut count = 0u64;
        for record in records {
            fresh.append(record)?;
            count += 1;
        }
        fresh.sync()?;

        for path in old_segments {
            if path != fresh_path {
                fs::remove_file(&path)?;
            }
        }

        info!(
            "wal compacted: {count} record(s) into {}",
            fresh_path.display()
        );
        self.active = fresh;
        self.record_count = count;
        Ok(())
    }

    fn rotate(&mut self) -> Result<(), WalError> {
        self.active.sync()?;
        let path = segment_path(&self.dir, self.next_segment);
        self.next_segment += 1;
        self.active = SegmentWriter::open(&path)?;
        Ok(())
    }

    /// Total records appended or recovered over the log's lifetime.
    #[must_use]
    pub fn record_count(&self) -> u64 {
        self.record_count
    }

    /// Total size of all segment files, in bytes.
    pub fn size_bytes(&self) -> Result<u64, WalError> {
        let mut total = 0;
        for path in list_segments(&self.dir)? {
            total += fs::metadata(path)?.len();
        }
        Ok(total)
    }

    /// The log directory.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

fn segment_path(dir: &Path, number: u64) -> PathBuf {
    dir.join(format!("{number:016x}.{SEGMENT_EXTENSION}"))
}

fn segment_number(path: &Path) -> Option<u64> {
    let stem = path.file_stem()?.to_str()?;
    u64::from_str_radix(stem, 16).ok()
}

fn list_segments(dir: &Path) -> Result<Vec<PathBuf>, WalError> {
    let mut segments = Vec::new();
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if path.extension().and_then(|e| e.to_str()) == Some(SEGMENT_EXTENSION) {
            segments.push(path);
        }
    }
    Ok(segments)
}
