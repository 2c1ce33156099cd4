//! Shared snapshot container for the non-HNSW indices.
//!
//! Same discipline as the HNSW snapshot: a fixed 64-byte header whose CRC32
//! field sits at byte offset 48 and covers every byte after itself, then a
//! postcard body. Atomic write via tmp-file + rename.

use super::IndexError;
use bytemuck::{Pod, Zeroable};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

/// Byte offset of the CRC field, shared across all index file formats.
pub const CRC_OFFSET: usize = 48;

/// Container format version.
pub const CONTAINER_VERSION: u16 = 2;

const HEADER_SIZE: usize = 64;

/// Fixed header for flat and IVF-PQ snapshots.
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
#[repr(C)]
pub struct ContainerHeader {
    /// Index-kind specific magic.
    pub magic: [u8; 4], // 0
    /// Format version.
    pub version: u16, // 4
    /// Unused, zeroed.
    pub flags: u16, // 6
    /// Vector dimensionality.
    pub dimension: u32, // 8
    /// Metric code.
    pub metric: u32, // 12
    /// Entry count.
    pub count: u64, // 16
    /// Reserved, zeroed.
    pub reserved: [u8; 24], // 24
    /// CRC32 of all bytes after this field.
    pub body_crc: u32, // 48
    /// Reserved, zeroed.
    pub tail: [u32; 3], // 52
}

const _: () = assert!(std::mem::size_of::<ContainerHeader>() == HEADER_SIZE);
const _: () = assert!(std::mem::offset_of!(ContainerHeader, body_crc) == CRC_OFFSET);

/// Writes `body` under a checksummed header, atomically.
pub(crate) fn write_atomic(
    path: &Path,
    magic: [u8; 4],
    dimension: usize,
    metric: u32,
    count: u64,
    body: &[u8],
) -> Result<(), IndexError> {
    let mut header = ContainerHeader {
        magic,
        version: CONTAINER_VERSION,
        flags: 0,
        dimension: u32::try_from(dimension)
            .map_err(|_| IndexError::InvalidConfig("dimension exceeds u32".into()))?,
        metric,
        count,
        reserved: [0; 24],
        body_crc: 0,
        tail: [0; 3],
    };

    let mut buffer = Vec::with_capacity(HEADER_SIZE + body.len());
    buffer.extend_from_slice(bytemuck::bytes_of(&header));
    buffer.extend_from_slice(body);

    header.body_crc = crc32fast::hash(&buffer[CRC_OFFSET + 4..]);
    buffer[..HEADER_SIZE].copy_from_slice(bytemuck::bytes_of(&header));

    let tmp = tmp_path(path);
    {
        let mut file = fs::File::create(&tmp)?;
        file.write_all(&buffer)?;
        file.sync_all()?;
    }
    fs::rename(&tmp, path)?;
    Ok(())
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut os = path.as_os_str().to_os_string();
    os.push(".tmp");
    PathBuf::from(os)
}

/// Reads and verifies a container, returning the header and body bytes.
pub(crate) fn read_verified(
    path: &Path,
    expected_magic: [u8; 4],
) -> Result<(ContainerHeader, Vec<u8>), IndexError> {
    let data = fs::read(path)?;
    if data.len() < HEADER_SIZE {
        return Err(IndexError::Corruption(format!(
            "file too short: {} bytes",
            data.len()
        )));
    }

    let header: ContainerHeader = bytemuck::pod_read_unaligned(&data[..HEADER_SIZE]);
    if header.magic != expected_magic {
        return Err(IndexError::Corruption(format!(
            "bad magic: {:02x?}",
            header.magic
        )));
    }
    if header.version != CONTAINER_VERSION {
        return Err(IndexError::Corruption(format!(
            "unsupported container version {}",
            header.version
        )));
    }

    let actual_crc = crc32fast::hash(&data[CRC_OFFSET + 4..]);
    if actual_crc != header.body_crc {
        return Err(IndexError::Corruption(format!(
            "checksum mismatch: header {:#010x}, body {actual_crc:#010x}",
            header.body_crc
        )));
    }

    Ok((header, data[HEADER_SIZE..].to_vec()))
}
