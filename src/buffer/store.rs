//! Bounded per-connection byte history.

use std::collections::VecDeque;
use std::time::SystemTime;
use tracing::{debug, trace};

use super::archive::{ArchiveHandle, ArchiveSink};
use crate::error::ReadError;
use crate::filter::CompiledFilter;
use crate::types::{ByteChunk, ByteRange, ConnectionId, MatchEvent, TimeWindow};

/// Counters describing a store.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BufferStats {
    pub resident_bytes: usize,
    pub resident_chunks: usize,
    pub ceiling_bytes: usize,
    /// Every byte ever appended, including evicted ones
    pub total_bytes: u64,
    pub total_chunks: u64,
    pub evicted_bytes: u64,
    /// Evicted bytes handed to the archive writer
    pub archive_submitted_bytes: u64,
    pub min_chunk: usize,
    pub max_chunk: usize,
    pub mean_chunk: f64,
    /// Population standard deviation of chunk sizes
    pub std_dev_chunk: f64,
}

/// Chunk-size figures over the resident chunks that arrived in a window.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChunkStats {
    pub bytes: u64,
    pub chunks: usize,
    pub min_chunk: usize,
    pub max_chunk: usize,
    pub mean_chunk: f64,
    pub std_dev_chunk: f64,
    pub first_arrival: Option<SystemTime>,
    pub last_arrival: Option<SystemTime>,
}

impl ChunkStats {
    fn from_chunks<'a>(chunks: impl Iterator<Item = &'a ByteChunk>) -> Self {
        let mut stats = ChunkStats { min_chunk: usize::MAX, ..ChunkStats::default() };
        let mut sizes = SizeMoments::default();
        for chunk in chunks {
            stats.bytes += chunk.len() as u64;
            stats.chunks += 1;
            stats.min_chunk = stats.min_chunk.min(chunk.len());
            stats.max_chunk = stats.max_chunk.max(chunk.len());
            stats.first_arrival.get_or_insert(chunk.timestamp);
            stats.last_arrival = Some(chunk.timestamp);
            sizes.push(chunk.len());
        }
        if stats.chunks == 0 {
            stats.min_chunk = 0;
        }
        stats.mean_chunk = sizes.mean;
        stats.std_dev_chunk = sizes.std_dev();
        stats
    }
}

/// Running mean and variance of chunk sizes (Welford).
#[derive(Debug, Clone, Copy, Default)]
struct SizeMoments {
    count: u64,
    mean: f64,
    m2: f64,
}

impl SizeMoments {
    fn push(&mut self, size: usize) {
        self.count += 1;
        let x = size as f64;
        let delta = x - self.mean;
        self.mean += delta / self.count as f64;
        self.m2 += delta * (x - self.mean);
    }

    fn std_dev(&self) -> f64 {
        if self.count == 0 { 0.0 } else { (self.m2 / self.count as f64).sqrt() }
    }
}

/// Ring buffer of received chunks with a resident byte ceiling.
///
/// Eviction is FIFO and byte-exact: when an append pushes the resident size
/// over the ceiling, whole chunks are dropped from the front and the oldest
/// surviving chunk is trimmed by exactly the remaining excess. Logical
/// offsets are never rewound, so ranges handed out earlier keep their
/// meaning after eviction.
///
/// The store has a single writer (the connection's pipeline task) and is
/// never shared across connections.
#[derive(Debug)]
pub struct RingBufferStore {
    connection: ConnectionId,
    ceiling: usize,
    chunks: VecDeque<ByteChunk>,
    resident: usize,
    next_offset: u64,
    next_seq: u64,
    evicted: u64,
    archive_submitted: u64,
    min_chunk: usize,
    max_chunk: usize,
    sizes: SizeMoments,
    archive: Option<ArchiveSink>,
}

impl RingBufferStore {
    /// Create an empty store. A zero ceiling is raised to one byte.
    pub fn new(connection: ConnectionId, ceiling: usize) -> Self {
        Self {
            connection,
            ceiling: ceiling.max(1),
            chunks: VecDeque::new(),
            resident: 0,
            next_offset: 0,
            next_seq: 0,
            evicted: 0,
            archive_submitted: 0,
            min_chunk: usize::MAX,
            max_chunk: 0,
            sizes: SizeMoments::default(),
            archive: None,
        }
    }

    /// Forward evicted ranges to cold storage.
    pub fn with_archive(mut self, sink: ArchiveSink) -> Self {
        self.archive = Some(sink);
        self
    }

    /// Append the bytes of one transport read.
    ///
    /// Assigns the next sequence number and logical offset, then evicts down
    /// to the ceiling. Empty reads produce an empty chunk and leave the store
    /// untouched.
    pub fn append(&mut self, data: Vec<u8>, timestamp: SystemTime) -> ByteChunk {
        let chunk = ByteChunk::new(self.next_seq, self.next_offset, data, timestamp);
        if chunk.is_empty() {
            return chunk;
        }

        self.next_seq += 1;
        self.next_offset += chunk.len() as u64;
        self.resident += chunk.len();
        self.min_chunk = self.min_chunk.min(chunk.len());
        self.max_chunk = self.max_chunk.max(chunk.len());
        self.sizes.push(chunk.len());
        self.chunks.push_back(chunk.clone());

        if self.resident > self.ceiling {
            self.evict(self.resident - self.ceiling);
        }
        debug_assert!(self.resident <= self.ceiling);
        chunk
    }

    /// Drop `excess` bytes from the front.
    fn evict(&mut self, mut excess: usize) {
        let start = self.resident_start();
        let mut archived = self.archive.as_ref().map(|_| Vec::with_capacity(excess));

        while excess > 0 {
            let Some(front) = self.chunks.front_mut() else { break };
            if front.len() <= excess {
                excess -= front.len();
                self.resident -= front.len();
                if let Some(buf) = archived.as_mut() {
                    buf.extend_from_slice(&front.data);
                }
                self.chunks.pop_front();
            } else {
                if let Some(buf) = archived.as_mut() {
                    buf.extend_from_slice(&front.data[..excess]);
                }
                let rest = front.data[excess..].to_vec();
                *front = ByteChunk {
                    seq: front.seq,
                    offset: front.offset + excess as u64,
                    data: rest.into(),
                    timestamp: front.timestamp,
                };
                self.resident -= excess;
                excess = 0;
            }
        }

        let range = ByteRange::new(start, self.resident_start());
        self.evicted += range.len();
        trace!(connection = %self.connection, %range, "Evicted range");

        if let (Some(sink), Some(bytes)) = (self.archive.as_ref(), archived) {
            self.archive_submitted += bytes.len() as u64;
            sink.submit(range, bytes);
        }
    }

    /// Logical offset of the oldest resident byte.
    pub fn resident_start(&self) -> u64 {
        self.next_offset - self.resident as u64
    }

    /// Logical range currently held in memory.
    pub fn resident_range(&self) -> ByteRange {
        ByteRange::new(self.resident_start(), self.next_offset)
    }

    /// Offset the next received byte will get.
    pub fn next_offset(&self) -> u64 {
        self.next_offset
    }

    pub fn resident_bytes(&self) -> usize {
        self.resident
    }

    pub fn ceiling(&self) -> usize {
        self.ceiling
    }

    /// Read a logical range.
    ///
    /// Partially evicted ranges are refused as a whole; the error names the
    /// evicted part.
    pub fn read(&self, range: ByteRange) -> Result<Vec<u8>, ReadError> {
        if range.end > self.next_offset {
            return Err(ReadError::NotYetReceived { range, next_offset: self.next_offset });
        }
        if range.is_empty() {
            return Ok(Vec::new());
        }

        let resident_start = self.resident_start();
        if range.start < resident_start {
            let evicted = ByteRange::new(range.start, range.end.min(resident_start));
            return match &self.archive {
                Some(sink) if sink.is_archived(&evicted) => Err(ReadError::RangeArchived(
                    ArchiveHandle { connection: self.connection, range: evicted },
                )),
                _ => Err(ReadError::RangeEvicted { range }),
            };
        }

        let mut out = Vec::with_capacity(range.len() as usize);
        let first = self.chunks.partition_point(|c| c.range().end <= range.start);
        for chunk in self.chunks.range(first..) {
            let Some(part) = chunk.range().intersect(&range) else { break };
            let from = (part.start - chunk.offset) as usize;
            let to = (part.end - chunk.offset) as usize;
            out.extend_from_slice(&chunk.data[from..to]);
        }
        Ok(out)
    }

    /// Resident bytes as one contiguous buffer, with the offset of the first.
    pub fn snapshot(&self) -> (u64, Vec<u8>) {
        let mut out = Vec::with_capacity(self.resident);
        for chunk in &self.chunks {
            out.extend_from_slice(&chunk.data);
        }
        (self.resident_start(), out)
    }

    /// Run a filter over the resident history.
    pub fn search(&self, filter: &CompiledFilter) -> Vec<MatchEvent> {
        self.search_within(filter, &TimeWindow::ALL)
    }

    /// Run a filter over the resident chunks that arrived within `window`.
    ///
    /// Consecutive selected chunks are searched as one span, so matches may
    /// cross their boundaries but never bridge a chunk outside the window.
    pub fn search_within(&self, filter: &CompiledFilter, window: &TimeWindow) -> Vec<MatchEvent> {
        let now = SystemTime::now();
        self.spans(window)
            .into_iter()
            .flat_map(|(base, bytes)| filter.find_all(base, &bytes, now))
            .collect()
    }

    /// Contiguous runs of resident chunks inside `window`.
    fn spans(&self, window: &TimeWindow) -> Vec<(u64, Vec<u8>)> {
        if window.is_unbounded() {
            return vec![self.snapshot()];
        }
        let mut spans: Vec<(u64, Vec<u8>)> = Vec::new();
        let mut open = false;
        for chunk in &self.chunks {
            if !window.contains(chunk.timestamp) {
                open = false;
                continue;
            }
            match spans.last_mut() {
                Some((_, bytes)) if open => bytes.extend_from_slice(&chunk.data),
                _ => spans.push((chunk.offset, chunk.data.to_vec())),
            }
            open = true;
        }
        spans
    }

    /// Chunk-size figures for resident chunks that arrived within `window`.
    pub fn window_stats(&self, window: &TimeWindow) -> ChunkStats {
        ChunkStats::from_chunks(self.chunks.iter().filter(|c| window.contains(c.timestamp)))
    }

    /// Evict everything. Offsets keep counting from where they were.
    pub fn clear(&mut self) {
        if self.resident > 0 {
            debug!(connection = %self.connection, bytes = self.resident, "Clearing store");
            self.evict(self.resident);
        }
    }

    pub fn stats(&self) -> BufferStats {
        let total_chunks = self.next_seq;
        BufferStats {
            resident_bytes: self.resident,
            resident_chunks: self.chunks.len(),
            ceiling_bytes: self.ceiling,
            total_bytes: self.next_offset,
            total_chunks,
            evicted_bytes: self.evicted,
            archive_submitted_bytes: self.archive_submitted,
            min_chunk: if total_chunks == 0 { 0 } else { self.min_chunk },
            max_chunk: self.max_chunk,
            mean_chunk: if total_chunks == 0 {
                0.0
            } else {
                self.next_offset as f64 / total_chunks as f64
            },
            std_dev_chunk: self.sizes.std_dev(),
        }
    }
}
