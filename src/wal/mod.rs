//! Write-ahead log.
//!
//! Every mutation is appended to the WAL before it touches the in-memory
//! state, so an interrupted process can replay the log and arrive at the
//! exact entry map that existed at shutdown. Records are framed as
//! `[len u32][crc32 u32][payload]` with the CRC computed over the payload.
//!
//! The log rotates into numbered segment files once the active segment
//! exceeds a size threshold; recovery stitches segments back together in
//! lexicographic (= numeric) order. A truncated record at the tail of a
//! segment is tolerated — it is the signature of a crash mid-append — but a
//! checksum mismatch anywhere else is corruption and fails recovery.

mod log;
mod segment;

pub use self::log::{Wal, WalOptions};
pub use segment::{read_segment, SegmentContents, SegmentWriter};

use crate::metadata::Metadata;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Frame header size: length prefix plus CRC.
pub const FRAME_HEADER_SIZE: usize = 8;

/// Maximum allowed payload size (16MB), guarding recovery against a
/// corrupted length prefix producing a giant allocation.
pub const MAX_PAYLOAD_SIZE: usize = 16 * 1024 * 1024;

/// WAL errors.
#[derive(Debug, Error)]
pub enum WalError {
    /// I/O failure reading or writing the log.
    #[error("wal io error: {0}")]
    Io(#[from] std::io::Error),

    /// Record failed to serialize or deserialize.
    #[error("wal codec error: {0}")]
    Codec(#[from] postcard::Error),

    /// Checksum mismatch or impossible frame inside the log body.
    #[error("wal corruption in {segment}: {detail}")]
    Corruption {
        /// Segment file name.
        segment: String,
        /// What failed.
        detail: String,
    },

    /// Payload exceeds [`MAX_PAYLOAD_SIZE`].
    #[error("wal payload too large: {size} > {max}")]
    PayloadTooLarge {
        /// Requested payload size.
        size: usize,
        /// The cap.
        max: usize,
    },
}

/// The mutation kind a record describes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum WalOp {
    /// A new entry.
    Insert,
    /// Vector and/or metadata replacement for an existing entry.
    Update,
    /// Tombstone: erases any earlier record for the same id during replay.
    Delete,
}

/// One durable mutation.
///
/// `Delete` records carry no vector; their metadata holds the tombstone
/// markers (`_deleted`, `_deleted_at`).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct WalRecord {
    /// Mutation kind.
    pub op: WalOp,
    /// Entry id.
    pub id: String,
    /// New vector, when the mutation carries one.
    pub vector: Option<Vec<f32>>,
    /// New metadata, when the mutation carries any.
    pub metadata: Option<Metadata>,
}

impl WalRecord {
    /// An insert record.
    #[must_use]
    pub fn insert(id: &str, vector: Vec<f32>, metadata: Metadata) -> Self {
        Self {
            op: WalOp::Insert,
            id: id.to_string(),
            vector: Some(vector),
            metadata: Some(metadata),
        }
    }

    /// An update record; either part may be absent.
    #[must_use]
    pub fn update(id: &str, vector: Option<Vec<f32>>, metadata: Option<Metadata>) -> Self {
        Self {
            op: WalOp::Update,
            id: id.to_string(),
            vector,
            metadata,
        }
    }

    /// A tombstone for `id`, stamped with the deletion time.
    #[must_use]
    pub fn tombstone(id: &str, deleted_at_millis: i64) -> Self {
        use crate::metadata::{Value, DELETED_AT_KEY, DELETED_KEY};
        let mut metadata = Metadata::new();
        metadata.insert(DELETED_KEY.to_string(), Value::Bool(true));
        metadata.insert(DELETED_AT_KEY.to_string(), Value::Timestamp(deleted_at_millis));
        Self {
            op: WalOp::Delete,
            id: id.to_string(),
            vector: None,
            metadata: Some(metadata),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::Value;

    #[test]
    fn test_record_postcard_roundtrip() {
        let mut metadata = Metadata::new();
        metadata.insert("price".into(), Value::Float(9.5));
        metadata.insert("tags".into(), Value::from(vec!["a", "b"]));

        let record = WalRecord::insert("doc-1", vec![0.5, 1.5], metadata);
        let bytes = postcard::to_allocvec(&record).expect("serialize");
        let back: WalRecord = postcard::from_bytes(&bytes).expect("deserialize");
        assert_eq!(record, back);
    }

    #[test]
    fn test_tombstone_markers() {
        let record = WalRecord::tombstone("gone", 1_700_000_000_000);
        assert_eq!(record.op, WalOp::Delete);
        assert!(record.vector.is_none());
        let metadata = record.metadata.expect("tombstone metadata");
        assert_eq!(
            metadata.get(crate::metadata::DELETED_KEY),
            Some(&Value::Bool(true))
        );
    }
}
