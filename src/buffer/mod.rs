//! Bounded byte history with optional cold storage.
//!
//! [`RingBufferStore`] keeps the most recent bytes of one connection under a
//! hard ceiling. Evicted ranges can be handed to an [`Archive`] through an
//! [`ArchiveSink`]; that hand-off never blocks the append path.
//!
//! ```rust
//! use serialscope::buffer::RingBufferStore;
//! use serialscope::types::{ByteRange, ConnectionId};
//! use std::time::SystemTime;
//!
//! let mut store = RingBufferStore::new(ConnectionId::new(1), 8);
//! store.append(b"0123456789".to_vec(), SystemTime::now());
//! assert_eq!(store.resident_range(), ByteRange::new(2, 10));
//! assert_eq!(store.read(ByteRange::new(6, 10)).unwrap(), b"6789".to_vec());
//! ```

mod archive;
mod store;

pub use archive::{
    Archive, ArchiveHandle, ArchiveRecord, ArchiveSink, ArchiveStatus, FileArchive, MemoryArchive,
};
pub use store::{BufferStats, ChunkStats, RingBufferStore};
