//! Per-connection pipeline tasks.
//!
//! Each open connection runs two tasks:
//!
//! - the **reader** owns the byte source, the ring buffer, the frame detector
//!   and the filter engine. It is their only writer, so every chunk goes
//!   append → detect → scan in arrival order without locks.
//! - the **writer** owns the byte sink and serves `send` requests, so
//!   outbound traffic never waits on ingestion and vice versa.
//!
//! Everything else talks to the reader through a command channel and
//! listens on the broadcast event feed.

use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::buffer::{BufferStats, ChunkStats, RingBufferStore};
use crate::detector::{DetectorEvent, DetectorState, FrameDetector, RecognizerRegistry};
use crate::error::{ConnectionError, ReadError};
use crate::filter::{CompiledFilter, FilterEngine, FilterSet};
use crate::transport::{ByteSink, ByteSource, TransportPair};
use crate::types::{ByteRange, ConnectionEvent, ConnectionId, ConnectionState, MatchEvent, TimeWindow};

/// Snapshot of a connection's counters.
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionStats {
    pub buffer: BufferStats,
    pub frames: u64,
    pub invalid_frames: u64,
    pub frame_errors: u64,
    pub matches: u64,
    pub detector: DetectorState,
}

/// Requests served by the reader task.
pub(crate) enum Command {
    Read { range: ByteRange, reply: oneshot::Sender<Result<Vec<u8>, ReadError>> },
    Search { filter: Box<CompiledFilter>, window: TimeWindow, reply: oneshot::Sender<Vec<MatchEvent>> },
    Stats { reply: oneshot::Sender<ConnectionStats> },
    WindowStats { window: TimeWindow, reply: oneshot::Sender<ChunkStats> },
    Clear { reply: oneshot::Sender<()> },
    /// Raised by the writer task when the sink fails
    TransportFailed(ConnectionError),
    /// Graceful close: drain pending frames, then stop
    Close { reply: oneshot::Sender<ConnectionState> },
}

/// One outbound write.
pub(crate) struct WriteRequest {
    pub bytes: Vec<u8>,
    pub reply: oneshot::Sender<Result<usize, ConnectionError>>,
}

/// Everything the reader task needs besides the transport.
pub(crate) struct PipelineSetup {
    pub id: ConnectionId,
    pub port: String,
    pub store: RingBufferStore,
    pub registry: watch::Receiver<Arc<RecognizerRegistry>>,
    pub filters: watch::Receiver<Arc<FilterSet>>,
    pub max_residue: usize,
    pub match_flush: Duration,
    pub events: broadcast::Sender<ConnectionEvent>,
    pub state: watch::Sender<ConnectionState>,
    pub command_capacity: usize,
    pub send_timeout: Duration,
}

/// Handles to the spawned tasks.
pub(crate) struct PipelineChannels {
    pub commands: mpsc::Sender<Command>,
    pub writes: mpsc::Sender<WriteRequest>,
    /// Cancelling forces both tasks down without draining
    pub cancel: CancellationToken,
    pub reader: JoinHandle<()>,
    pub writer: JoinHandle<()>,
}

/// Reader-side state of one connection.
pub(crate) struct Pipeline {
    id: ConnectionId,
    port: String,
    store: RingBufferStore,
    detector: FrameDetector,
    filters: FilterEngine,
    registry_rx: watch::Receiver<Arc<RecognizerRegistry>>,
    filter_rx: watch::Receiver<Arc<FilterSet>>,
    /// Arrival of the latest chunk, for releasing held-back matches
    last_chunk_at: Option<Instant>,
    match_flush: Duration,
    events: broadcast::Sender<ConnectionEvent>,
    state: watch::Sender<ConnectionState>,
    frames: u64,
    invalid_frames: u64,
    frame_errors: u64,
    matches: u64,
}

impl Pipeline {
    /// Spawn the reader and writer tasks for an open transport.
    pub(crate) fn spawn(setup: PipelineSetup, transport: TransportPair) -> PipelineChannels {
        let PipelineSetup {
            id,
            port,
            store,
            mut registry,
            mut filters,
            max_residue,
            match_flush,
            events,
            state,
            command_capacity,
            send_timeout,
        } = setup;

        let start = store.next_offset();
        let detector =
            FrameDetector::new(Arc::clone(&registry.borrow_and_update()), start, max_residue);
        let engine = FilterEngine::new(&filters.borrow_and_update(), start);

        let (command_tx, command_rx) = mpsc::channel(command_capacity.max(1));
        let (write_tx, write_rx) = mpsc::channel(command_capacity.max(1));
        let cancel = CancellationToken::new();

        let writer = tokio::spawn(Self::writer_task(
            id,
            port.clone(),
            transport.sink,
            write_rx,
            command_tx.clone(),
            send_timeout,
            cancel.clone(),
        ));

        let pipeline = Pipeline {
            id,
            port,
            store,
            detector,
            filters: engine,
            registry_rx: registry,
            filter_rx: filters,
            last_chunk_at: None,
            match_flush,
            events,
            state,
            frames: 0,
            invalid_frames: 0,
            frame_errors: 0,
            matches: 0,
        };
        let reader = tokio::spawn(pipeline.reader_task(transport.source, command_rx, cancel.clone()));

        PipelineChannels { commands: command_tx, writes: write_tx, cancel, reader, writer }
    }

    /// Reader task: the strictly ordered ingestion path.
    async fn reader_task(
        mut self,
        mut source: Box<dyn ByteSource>,
        mut commands: mpsc::Receiver<Command>,
        cancel: CancellationToken,
    ) {
        info!(connection = %self.id, port = %self.port, "Pipeline started");
        self.publish(ConnectionEvent::StateChanged(ConnectionState::Open));

        loop {
            let deadline = self.quiet_deadline();

            tokio::select! {
                biased;

                _ = cancel.cancelled() => {
                    self.abort();
                    break;
                }
                command = commands.recv() => match command {
                    Some(Command::Close { reply }) => {
                        let state = self.shutdown(ConnectionState::Closed);
                        let _ = reply.send(state);
                        break;
                    }
                    Some(Command::TransportFailed(err)) => {
                        error!(connection = %self.id, "Write side failed: {}", err);
                        self.shutdown(ConnectionState::Error(err));
                        break;
                    }
                    Some(command) => self.handle(command),
                    None => {
                        debug!(connection = %self.id, "Command channel dropped");
                        self.shutdown(ConnectionState::Closed);
                        break;
                    }
                },
                result = source.next_chunk() => match result {
                    Ok(Some(bytes)) => self.ingest(bytes),
                    Ok(None) => {
                        info!(connection = %self.id, "Port closed by device");
                        self.shutdown(ConnectionState::Closed);
                        break;
                    }
                    Err(err) => {
                        error!(connection = %self.id, "Transport error: {}", err);
                        self.shutdown(ConnectionState::Error(err));
                        break;
                    }
                },
                _ = quiet_gap(deadline) => self.on_quiet_gap(),
            }
        }

        // The writer has nothing left to serve once the reader is gone
        cancel.cancel();
        info!(
            connection = %self.id,
            "Pipeline ended ({} bytes, {} frames, {} matches)",
            self.store.next_offset(),
            self.frames,
            self.matches
        );
    }

    fn publish(&self, event: ConnectionEvent) {
        // No subscribers is not an error
        let _ = self.events.send(event);
    }

    fn set_state(&self, state: ConnectionState) {
        self.state.send_replace(state.clone());
        self.publish(ConnectionEvent::StateChanged(state));
    }

    /// Pick up configuration changes. Only called between chunks.
    fn apply_updates(&mut self) {
        if self.filter_rx.has_changed().unwrap_or(false) {
            let set = Arc::clone(&self.filter_rx.borrow_and_update());
            self.filters.replace(&set);
        }
        if self.registry_rx.has_changed().unwrap_or(false) {
            let registry = Arc::clone(&self.registry_rx.borrow_and_update());
            self.detector.stage_registry(registry);
        }
    }

    fn ingest(&mut self, bytes: Vec<u8>) {
        if bytes.is_empty() {
            return;
        }
        self.apply_updates();

        let chunk = self.store.append(bytes, SystemTime::now());
        trace!(connection = %self.id, seq = chunk.seq, range = %chunk.range(), "Chunk");
        self.publish(ConnectionEvent::ByteChunkArrived {
            seq: chunk.seq,
            range: chunk.range(),
            timestamp: chunk.timestamp,
        });

        let now = Instant::now();
        self.last_chunk_at = Some(now);
        let detected = self.detector.feed(&chunk, now);
        self.publish_detections(detected);

        let matches = self.filters.scan(&chunk);
        self.publish_matches(matches);
    }

    fn publish_detections(&mut self, events: Vec<DetectorEvent>) {
        for event in events {
            match event {
                DetectorEvent::Frame(frame) => {
                    self.frames += 1;
                    if !frame.valid {
                        self.invalid_frames += 1;
                    }
                    self.publish(ConnectionEvent::FrameDetected(frame));
                }
                DetectorEvent::Error(err) => {
                    self.frame_errors += 1;
                    self.publish(ConnectionEvent::FrameError(err));
                }
            }
        }
    }

    fn publish_matches(&mut self, matches: Vec<MatchEvent>) {
        for m in matches {
            self.matches += 1;
            self.publish(ConnectionEvent::MatchFound(m));
        }
    }

    /// Earliest of the detector's quiet gap and the match flush.
    fn quiet_deadline(&self) -> Option<Instant> {
        let flush = match self.last_chunk_at {
            Some(at) if self.filters.has_deferred() => Some(at + self.match_flush),
            _ => None,
        };
        match (self.detector.deadline(), flush) {
            (Some(gap), Some(flush)) => Some(gap.min(flush)),
            (gap, flush) => gap.or(flush),
        }
    }

    fn on_quiet_gap(&mut self) {
        let now = Instant::now();
        let detected = self.detector.expire(now);
        let gap_elapsed = !detected.is_empty();
        self.publish_detections(detected);

        let flush_due = self.last_chunk_at.is_some_and(|at| now >= at + self.match_flush);
        if gap_elapsed || flush_due {
            let released = self.filters.finish();
            self.publish_matches(released);
        }
    }

    fn handle(&mut self, command: Command) {
        match command {
            Command::Read { range, reply } => {
                let _ = reply.send(self.store.read(range));
            }
            Command::Search { filter, window, reply } => {
                let _ = reply.send(self.store.search_within(&filter, &window));
            }
            Command::WindowStats { window, reply } => {
                let _ = reply.send(self.store.window_stats(&window));
            }
            Command::Stats { reply } => {
                let _ = reply.send(ConnectionStats {
                    buffer: self.store.stats(),
                    frames: self.frames,
                    invalid_frames: self.invalid_frames,
                    frame_errors: self.frame_errors,
                    matches: self.matches,
                    detector: self.detector.state().clone(),
                });
            }
            Command::Clear { reply } => {
                self.store.clear();
                let _ = reply.send(());
            }
            Command::Close { .. } | Command::TransportFailed(_) => {}
        }
    }

    /// Drain pending frames and deferred matches, then enter `state`.
    fn shutdown(&mut self, state: ConnectionState) -> ConnectionState {
        let detected = self.detector.finish();
        self.publish_detections(detected);
        let released = self.filters.finish();
        self.publish_matches(released);
        self.set_state(state.clone());
        state
    }

    /// Forced close: pending frames are dropped.
    fn abort(&mut self) {
        let dropped = self.detector.discard();
        if !dropped.is_empty() {
            warn!(connection = %self.id, range = %dropped, "Forced close discarded pending bytes");
        }
        self.set_state(ConnectionState::Closed);
    }

    /// Writer task: serves sends until cancelled or the sink fails.
    async fn writer_task(
        id: ConnectionId,
        port: String,
        mut sink: Box<dyn ByteSink>,
        mut writes: mpsc::Receiver<WriteRequest>,
        commands: mpsc::Sender<Command>,
        timeout: Duration,
        cancel: CancellationToken,
    ) {
        loop {
            let request = tokio::select! {
                _ = cancel.cancelled() => break,
                request = writes.recv() => match request {
                    Some(request) => request,
                    None => break,
                },
            };

            let len = request.bytes.len();
            let result = tokio::select! {
                _ = cancel.cancelled() => break,
                result = tokio::time::timeout(timeout, sink.write_all(&request.bytes)) => result,
            };

            match result {
                Ok(Ok(())) => {
                    trace!(connection = %id, len, "Sent");
                    let _ = request.reply.send(Ok(len));
                }
                Ok(Err(err)) => {
                    warn!(connection = %id, "Send failed: {}", err);
                    let _ = request.reply.send(Err(err.clone()));
                    let _ = commands.send(Command::TransportFailed(err)).await;
                    break;
                }
                Err(_) => {
                    // The port stays usable; only this send fails
                    let err = ConnectionError::timeout(format!("send on {}", port), timeout);
                    warn!(connection = %id, "{}", err);
                    let _ = request.reply.send(Err(err));
                }
            }
        }
        debug!(connection = %id, "Writer task ended");
    }
}

/// Resolves at the detector deadline, or never without one.
async fn quiet_gap(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
