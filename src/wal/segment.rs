//! Frame-level reading and writing of a single WAL segment file.

use super::{WalError, WalRecord, FRAME_HEADER_SIZE, MAX_PAYLOAD_SIZE};
use crc32fast::Hasher;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Read, Write};
use std::path::{Path, PathBuf};

/// Appends framed records to one segment file.
pub struct SegmentWriter {
    path: PathBuf,
    writer: BufWriter<File>,
    bytes_written: u64,
}

impl SegmentWriter {
    /// Opens (or creates) a segment for appending.
    pub fn open(path: &Path) -> Result<Self, WalError> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        let bytes_written = file.metadata()?.len();
        Ok(Self {
            path: path.to_path_buf(),
            writer: BufWriter::new(file),
            bytes_written,
        })
    }

    /// Appends one record. Durability requires a following [`SegmentWriter::sync`]
    /// unless the caller syncs on every append.
    pub fn append(&mut self, record: &WalRecord) -> Result<(), WalError> {
        let payload = postcard::to_allocvec(record)?;
        if payload.len() > MAX_PAYLOAD_SIZE {
            return Err(WalError::PayloadTooLarge {
                size: payload.len(),
                max: MAX_PAYLOAD_SIZE,
            });
        }

        let mut hasher = Hasher::new();
        hasher.update(&payload);
        let crc = hasher.finalize();

        // SAFETY of cast: MAX_PAYLOAD_SIZE fits in u32.
        #[allow(clippy::cast_possible_truncation)]
        let len = payload.len() as u32;

        let mut frame = Vec::with_capacity(FRAME_HEADER_SIZE + payload.len());
        frame.extend_from_slice(&len.to_le_bytes());
        frame.extend_from_slice(&crc.to_le_bytes());
        frame.extend_from_slice(&payload);

        self.writer.write_all(&frame)?;
        self.bytes_written += frame.len() as u64;
        Ok(())
    }

    /// Flushes buffered frames and fsyncs the file.
    pub fn sync(&mut self) -> Result<(), WalError> {
        self.writer.flush()?;
        self.writer.get_ref().sync_data()?;
        Ok(())
    }

    /// Flushes buffered frames without fsync.
    pub fn flush(&mut self) -> Result<(), WalError> {
        self.writer.flush()?;
        Ok(())
    }

    /// Bytes written to this segment so far (including pre-existing data).
    #[must_use]
    pub fn len(&self) -> u64 {
        self.bytes_written
    }

    /// True when the segment holds no data.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.bytes_written == 0
    }

    /// The segment file path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Reads all records from one segment.
///
/// A clean EOF ends iteration. A partial frame at the tail is reported via
/// the `truncated` flag on the result and otherwise ignored — it is what a
/// crash mid-append leaves behind. A CRC mismatch on a complete frame is
/// corruption.
pub fn read_segment(path: &Path) -> Result<SegmentContents, WalError> {
    let segment_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string());

    let mut file = File::open(path)?;
    let mut data = Vec::new();
    file.read_to_end(&mut data)?;

    let mut records = Vec::new();
    let mut offset = 0usize;
    let mut truncated = false;
    let mut valid_len = 0usize;

    while offset < data.len() {
        let remaining = data.len() - offset;
        if remaining < FRAME_HEADER_SIZE {
            truncated = true;
            break;
        }

        let len = u32::from_le_bytes(
            data[offset..offset + 4]
                .try_into()
                .expect("slice length is strictly 4 bytes"),
        ) as usize;
        let stored_crc = u32::from_le_bytes(
            data[offset + 4..offset + 8]
                .try_into()
                .expect("slice length is strictly 4 bytes"),
        );

        if len > MAX_PAYLOAD_SIZE {
            return Err(WalError::Corruption {
                segment: segment_name,
                detail: format!("frame length {len} exceeds payload cap"),
            });
        }

        let payload_start = offset + FRAME_HEADER_SIZE;
        if payload_start + len > data.len() {
            truncated = true;
            break;
        }
        let payload = &data[payload_start..payload_start + len];

        let mut hasher = Hasher::new();
        hasher.update(payload);
        let actual_crc = hasher.finalize();
        if actual_crc != stored_crc {
            return Err(WalError::Corruption {
                segment: segment_name,
                detail: format!(
                    "checksum mismatch at offset {offset}: expected {stored_crc:#010x}, got {actual_crc:#010x}"
                ),
            });
        }

        let record: WalRecord = postcard::from_bytes(payload).map_err(|e| WalError::Corruption {
            segment: segment_name.clone(),
            detail: format!("undecodable record at offset {offset}: {e}"),
        })?;
        records.push(record);
        offset = payload_start + len;
        valid_len = offset;
    }

    Ok(SegmentContents {
        records,
        truncated,
        valid_len: valid_len as u64,
    })
}

/// Records recovered from one segment.
pub struct SegmentContents {
    /// Records in durability order.
    pub records: Vec<WalRecord>,
    /// True when a partial frame was found (and dropped) at the tail.
    pub truncated: bool,
    /// Byte length of the clean frame prefix. Appends must resume here,
    /// not after the partial frame.
    pub valid_len: u64,
}
