//! Byte chunks as delivered by a transport

use std::sync::Arc;
use std::time::SystemTime;

use super::ByteRange;

/// Immutable run of bytes received in one transport read.
///
/// This is the fundamental data unit that flows through the pipeline. The
/// payload is shared via `Arc` so the store, the event feed and the archive
/// can hold it without copying.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ByteChunk {
    /// Per-connection sequence number, starting at 0
    pub seq: u64,

    /// Logical offset of the first byte
    pub offset: u64,

    /// Received bytes
    pub data: Arc<[u8]>,

    /// Arrival time
    pub timestamp: SystemTime,
}

impl ByteChunk {
    /// Create a new chunk
    pub fn new(seq: u64, offset: u64, data: Vec<u8>, timestamp: SystemTime) -> Self {
        Self { seq, offset, data: data.into(), timestamp }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Logical range covered by this chunk
    pub fn range(&self) -> ByteRange {
        ByteRange::at(self.offset, self.data.len())
    }
}
