//! Cold storage for evicted ranges.
//!
//! Archiving is fire-and-forget: the store hands evicted bytes to an
//! [`ArchiveSink`], which queues them for a background writer task. A full
//! queue or a failed write drops the range from cold storage, logs it, and
//! reports it on the status channel. Nothing is ever retried inline.

use async_trait::async_trait;
use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use crate::error::ArchiveError;
use crate::types::{ByteRange, ConnectionId};

/// Reference to an archived range, returned when a read hits evicted bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveHandle {
    pub connection: ConnectionId,
    pub range: ByteRange,
}

/// One append-only write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveRecord {
    pub connection: ConnectionId,
    pub range: ByteRange,
    pub bytes: Vec<u8>,
}

/// Outcome of a background archive write, published on the status channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArchiveStatus {
    Stored { connection: ConnectionId, range: ByteRange },
    Failed(ArchiveError),
}

/// Cold storage backend.
#[async_trait]
pub trait Archive: Send + Sync + 'static {
    /// Append a record. Records of one connection arrive in offset order.
    async fn append(&self, record: ArchiveRecord) -> Result<(), ArchiveError>;

    /// Read back the bytes of an archived range.
    async fn retrieve(&self, handle: &ArchiveHandle) -> Result<Vec<u8>, ArchiveError>;
}

/// Copy the parts of `records` that intersect `wanted` into one buffer.
///
/// Fails unless the records cover the range without gaps.
fn assemble<'a, I>(records: I, wanted: ByteRange) -> Result<Vec<u8>, ArchiveError>
where
    I: IntoIterator<Item = (ByteRange, &'a [u8])>,
{
    let mut out = Vec::with_capacity(wanted.len() as usize);
    let mut cursor = wanted.start;
    for (range, bytes) in records {
        let Some(part) = range.intersect(&wanted) else { continue };
        if part.start != cursor {
            break;
        }
        let from = (part.start - range.start) as usize;
        let to = (part.end - range.start) as usize;
        out.extend_from_slice(&bytes[from..to]);
        cursor = part.end;
    }
    if cursor == wanted.end {
        Ok(out)
    } else {
        Err(ArchiveError::Unavailable {
            reason: format!("range {} only archived up to offset {}", wanted, cursor),
        })
    }
}

/// In-process archive, mostly for tests and short sessions.
#[derive(Debug, Default)]
pub struct MemoryArchive {
    records: Mutex<HashMap<ConnectionId, Vec<(ByteRange, Vec<u8>)>>>,
    fail_writes: AtomicBool,
}

impl MemoryArchive {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent write fail with `WriteFailed`.
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Total archived bytes for a connection.
    pub fn archived_bytes(&self, connection: ConnectionId) -> u64 {
        let records = self.records.lock().unwrap_or_else(|e| e.into_inner());
        records.get(&connection).map_or(0, |r| r.iter().map(|(range, _)| range.len()).sum())
    }
}

#[async_trait]
impl Archive for MemoryArchive {
    async fn append(&self, record: ArchiveRecord) -> Result<(), ArchiveError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(ArchiveError::WriteFailed {
                connection: record.connection,
                range: record.range,
                reason: "writes disabled".into(),
            });
        }
        let mut records = self.records.lock().unwrap_or_else(|e| e.into_inner());
        records.entry(record.connection).or_default().push((record.range, record.bytes));
        Ok(())
    }

    async fn retrieve(&self, handle: &ArchiveHandle) -> Result<Vec<u8>, ArchiveError> {
        let records = self.records.lock().unwrap_or_else(|e| e.into_inner());
        let list = records.get(&handle.connection).map(Vec::as_slice).unwrap_or_default();
        assemble(list.iter().map(|(range, bytes)| (*range, bytes.as_slice())), handle.range)
    }
}

/// Append-only file archive: one `<connection>.bin` file per connection.
///
/// Each record is stored as `start: u64 LE`, `len: u32 LE`, then the bytes.
/// Ranges longer than `u32::MAX` bytes are written as consecutive records.
#[derive(Debug, Clone)]
pub struct FileArchive {
    dir: PathBuf,
}

const RECORD_HEADER: usize = 12;
const MAX_RECORD_LEN: usize = u32::MAX as usize;

impl FileArchive {
    /// Use `dir` as archive root, creating it if needed.
    pub fn open<P: AsRef<Path>>(dir: P) -> Result<Self, ArchiveError> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir).map_err(|e| ArchiveError::Unavailable {
            reason: format!("cannot create {}: {}", dir.display(), e),
        })?;
        Ok(Self { dir })
    }

    fn path_for(&self, connection: ConnectionId) -> PathBuf {
        self.dir.join(format!("{}.bin", connection))
    }

    fn append_blocking(path: &Path, record: &ArchiveRecord) -> std::io::Result<()> {
        let mut file = OpenOptions::new().create(true).append(true).open(path)?;
        let buf = Self::encode(record.range.start, &record.bytes, MAX_RECORD_LEN);
        file.write_all(&buf)?;
        file.flush()
    }

    /// Encode `bytes` starting at `start`, splitting at `max_len` bytes per record.
    fn encode(start: u64, bytes: &[u8], max_len: usize) -> Vec<u8> {
        let max_len = max_len.clamp(1, MAX_RECORD_LEN);
        let parts = bytes.len().div_ceil(max_len);
        let mut buf = Vec::with_capacity(parts * RECORD_HEADER + bytes.len());
        let mut offset = start;
        for part in bytes.chunks(max_len) {
            buf.extend_from_slice(&offset.to_le_bytes());
            // `part.len() <= MAX_RECORD_LEN`
            buf.extend_from_slice(&(part.len() as u32).to_le_bytes());
            buf.extend_from_slice(part);
            offset += part.len() as u64;
        }
        buf
    }

    fn read_blocking(path: &Path) -> std::io::Result<Vec<(ByteRange, Vec<u8>)>> {
        let mut data = Vec::new();
        File::open(path)?.read_to_end(&mut data)?;

        let mut records = Vec::new();
        let mut pos = 0;
        while pos + RECORD_HEADER <= data.len() {
            let mut start = [0u8; 8];
            start.copy_from_slice(&data[pos..pos + 8]);
            let mut len = [0u8; 4];
            len.copy_from_slice(&data[pos + 8..pos + 12]);
            let start = u64::from_le_bytes(start);
            let len = u32::from_le_bytes(len) as usize;
            pos += RECORD_HEADER;
            if pos + len > data.len() {
                // Torn tail from an interrupted write
                break;
            }
            records.push((ByteRange::at(start, len), data[pos..pos + len].to_vec()));
            pos += len;
        }
        Ok(records)
    }
}

#[async_trait]
impl Archive for FileArchive {
    async fn append(&self, record: ArchiveRecord) -> Result<(), ArchiveError> {
        let path = self.path_for(record.connection);
        let connection = record.connection;
        let range = record.range;
        let result = tokio::task::spawn_blocking(move || Self::append_blocking(&path, &record))
            .await
            .map_err(|e| ArchiveError::WriteFailed { connection, range, reason: e.to_string() })?;
        result.map_err(|e| ArchiveError::WriteFailed { connection, range, reason: e.to_string() })
    }

    async fn retrieve(&self, handle: &ArchiveHandle) -> Result<Vec<u8>, ArchiveError> {
        let path = self.path_for(handle.connection);
        let records = tokio::task::spawn_blocking(move || Self::read_blocking(&path))
            .await
            .map_err(|e| ArchiveError::Unavailable { reason: e.to_string() })?
            .map_err(|e| ArchiveError::Unavailable { reason: e.to_string() })?;
        assemble(records.iter().map(|(range, bytes)| (*range, bytes.as_slice())), handle.range)
    }
}

/// Sorted, merged set of ranges that reached cold storage.
#[derive(Debug, Default)]
struct RangeIndex {
    ranges: Vec<ByteRange>,
}

impl RangeIndex {
    fn insert(&mut self, range: ByteRange) {
        if let Some(last) = self.ranges.last_mut()
            && last.end == range.start
        {
            last.end = range.end;
            return;
        }
        self.ranges.push(range);
    }

    fn covers(&self, range: &ByteRange) -> bool {
        self.ranges.iter().any(|r| r.covers(range))
    }
}

/// Per-connection front end of the archive writer task.
#[derive(Debug)]
pub struct ArchiveSink {
    connection: ConnectionId,
    queue: mpsc::Sender<ArchiveRecord>,
    index: Arc<Mutex<RangeIndex>>,
    status: broadcast::Sender<ArchiveStatus>,
}

impl ArchiveSink {
    /// Spawn the background writer for one connection.
    pub fn spawn(
        connection: ConnectionId,
        archive: Arc<dyn Archive>,
        queue_len: usize,
        status: broadcast::Sender<ArchiveStatus>,
    ) -> (Self, JoinHandle<()>) {
        let (queue, mut rx) = mpsc::channel::<ArchiveRecord>(queue_len.max(1));
        let index = Arc::new(Mutex::new(RangeIndex::default()));

        let task_index = Arc::clone(&index);
        let task_status = status.clone();
        let task = tokio::spawn(async move {
            while let Some(record) = rx.recv().await {
                let range = record.range;
                match archive.append(record).await {
                    Ok(()) => {
                        trace!(connection = %connection, %range, "Archived range");
                        task_index.lock().unwrap_or_else(|e| e.into_inner()).insert(range);
                        let _ = task_status.send(ArchiveStatus::Stored { connection, range });
                    }
                    Err(e) => {
                        warn!(connection = %connection, %range, "Archive write failed: {}", e);
                        let _ = task_status.send(ArchiveStatus::Failed(e));
                    }
                }
            }
            debug!(connection = %connection, "Archive writer finished");
        });

        (Self { connection, queue, index, status }, task)
    }

    /// Queue evicted bytes without waiting. Never fails the caller.
    pub fn submit(&self, range: ByteRange, bytes: Vec<u8>) {
        let record = ArchiveRecord { connection: self.connection, range, bytes };
        if let Err(e) = self.queue.try_send(record) {
            let reason = match e {
                mpsc::error::TrySendError::Full(_) => "archive queue full",
                mpsc::error::TrySendError::Closed(_) => "archive writer stopped",
            };
            warn!(connection = %self.connection, %range, "Dropping evicted range: {}", reason);
            let _ = self.status.send(ArchiveStatus::Failed(ArchiveError::Unavailable {
                reason: format!("{} ({} {})", reason, self.connection, range),
            }));
        }
    }

    /// Whether `range` is known to be retrievable from cold storage.
    pub fn is_archived(&self, range: &ByteRange) -> bool {
        self.index.lock().unwrap_or_else(|e| e.into_inner()).covers(range)
    }
}
