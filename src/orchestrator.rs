//! Connection orchestrator.
//!
//! The [`Orchestrator`] opens and closes connections, routes sends, and
//! hands out event subscriptions. It keeps one small registry of
//! connections behind a mutex; that lock is only taken to look up or change
//! the registry and is never held across an await, so one connection's
//! traffic never waits on another's.
//!
//! ```no_run
//! use futures::StreamExt;
//! use serialscope::config::{ConnectionConfig, FilterSpec, OrchestratorConfig};
//! use serialscope::transports::ChannelConnector;
//! use serialscope::{ConnectionEvent, Orchestrator};
//! use std::sync::Arc;
//!
//! # async fn example() -> serialscope::Result<()> {
//! let connector = ChannelConnector::new();
//! let device = connector.add_port("sim0");
//! let orchestrator = Orchestrator::new(Arc::new(connector), OrchestratorConfig::default());
//!
//! let config = ConnectionConfig::new("sim0").with_filter(FilterSpec::literal("err", "ERROR"));
//! let id = orchestrator.open_connection(config).await?;
//! let mut events = orchestrator.subscribe(id)?;
//!
//! device.feed(b"boot ERROR 42\n".to_vec());
//! while let Some(event) = events.next().await {
//!     if let ConnectionEvent::MatchFound(m) = event {
//!         println!("{} at {}", m.text(), m.range);
//!         break;
//!     }
//! }
//! orchestrator.close_connection(id).await?;
//! # Ok(())
//! # }
//! ```

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use futures::Stream;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_stream::StreamExt;
use tokio_stream::wrappers::BroadcastStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::buffer::{Archive, ArchiveHandle, ArchiveSink, ArchiveStatus, ChunkStats, RingBufferStore};
use crate::config::{ConnectionConfig, FilterSpec, OrchestratorConfig, RecognizerSpec};
use crate::detector::RecognizerRegistry;
use crate::error::{ArchiveError, ConfigError, ConnectionError, ReadError, Result};
use crate::filter::{CompiledFilter, FilterSet};
use crate::pipeline::{Command, ConnectionStats, Pipeline, PipelineSetup, WriteRequest};
use crate::stream::EventStream;
use crate::transport::Connector;
use crate::types::{ByteRange, ConnectionEvent, ConnectionId, ConnectionState, MatchEvent, TimeWindow};

/// How `close_connection_with` treats pending frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CloseMode {
    /// Emit partial frames, then close. Falls back to forced after the
    /// close timeout.
    #[default]
    Graceful,
    /// Discard pending state immediately.
    Forced,
}

/// Acknowledgement of a completed send.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ack {
    pub bytes_written: usize,
}

/// What a close call does once the registry lock is released.
enum Closing {
    Run(Box<Live>),
    /// Another caller is already closing; wait for its outcome
    Join(watch::Receiver<ConnectionState>),
}

/// Registry entry of a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionInfo {
    pub id: ConnectionId,
    pub port: String,
    pub state: ConnectionState,
}

struct Live {
    port: String,
    events: broadcast::Sender<ConnectionEvent>,
    state: watch::Receiver<ConnectionState>,
    commands: mpsc::Sender<Command>,
    writes: mpsc::Sender<WriteRequest>,
    filters: watch::Sender<Arc<FilterSet>>,
    registry: watch::Sender<Arc<RecognizerRegistry>>,
    cancel: CancellationToken,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
    archiver: Option<JoinHandle<()>>,
}

impl Live {
    fn current_state(&self) -> ConnectionState {
        self.state.borrow().clone()
    }
}

enum Slot {
    /// Port claimed, transport still opening
    Connecting { port: String },
    Live(Box<Live>),
    /// Close in progress
    Closing { port: String, state: watch::Receiver<ConnectionState> },
    Terminated { port: String, state: ConnectionState },
}

impl Slot {
    fn port(&self) -> &str {
        match self {
            Slot::Connecting { port }
            | Slot::Closing { port, .. }
            | Slot::Terminated { port, .. } => port,
            Slot::Live(live) => &live.port,
        }
    }

    fn state(&self) -> ConnectionState {
        match self {
            Slot::Connecting { .. } => ConnectionState::Connecting,
            Slot::Live(live) => live.current_state(),
            Slot::Closing { state, .. } => state.borrow().clone(),
            Slot::Terminated { state, .. } => state.clone(),
        }
    }

    /// Whether this slot still owns its port.
    fn holds_port(&self) -> bool {
        match self {
            Slot::Connecting { .. } | Slot::Closing { .. } => true,
            Slot::Live(live) => !live.current_state().is_terminal(),
            Slot::Terminated { .. } => false,
        }
    }
}

/// Owns every open connection.
pub struct Orchestrator {
    connector: Arc<dyn Connector>,
    archive: Option<Arc<dyn Archive>>,
    config: OrchestratorConfig,
    next_id: AtomicU64,
    slots: Mutex<HashMap<ConnectionId, Slot>>,
    archive_status: broadcast::Sender<ArchiveStatus>,
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("config", &self.config)
            .field("archive", &self.archive.is_some())
            .finish_non_exhaustive()
    }
}

impl Orchestrator {
    pub fn new(connector: Arc<dyn Connector>, config: OrchestratorConfig) -> Self {
        let (archive_status, _) = broadcast::channel(config.event_capacity.max(1));
        Self {
            connector,
            archive: None,
            config,
            next_id: AtomicU64::new(1),
            slots: Mutex::new(HashMap::new()),
            archive_status,
        }
    }

    /// Like [`new`](Self::new), but rejects an invalid configuration up
    /// front.
    pub fn try_new(
        connector: Arc<dyn Connector>,
        config: OrchestratorConfig,
    ) -> std::result::Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self::new(connector, config))
    }

    /// Enable cold storage for connections that ask for it.
    pub fn with_archive(mut self, archive: Arc<dyn Archive>) -> Self {
        self.archive = Some(archive);
        self
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    fn slots(&self) -> MutexGuard<'_, HashMap<ConnectionId, Slot>> {
        self.slots.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Claim the port and allocate an id, or report who holds it.
    fn reserve(&self, port: &str) -> std::result::Result<ConnectionId, ConnectionError> {
        let mut slots = self.slots();
        if let Some((id, _)) = slots.iter().find(|(_, s)| s.port() == port && s.holds_port()) {
            return Err(ConnectionError::AlreadyOpen { port: port.to_string(), id: *id });
        }
        let id = ConnectionId::new(self.next_id.fetch_add(1, Ordering::Relaxed));
        slots.insert(id, Slot::Connecting { port: port.to_string() });
        Ok(id)
    }

    /// Open a port and start its pipeline.
    ///
    /// Configuration, filters and recognizers are validated before the
    /// transport is touched. Connect attempts are bounded by the configured
    /// connect timeout.
    pub async fn open_connection(&self, config: ConnectionConfig) -> Result<ConnectionId> {
        config.validate()?;
        let filters = FilterSet::compile(&config.filters)?;
        let registry = RecognizerRegistry::from_specs(&config.detector.recognizers)?;

        let id = self.reserve(&config.port)?;
        info!(connection = %id, port = %config.port, "Opening connection");

        let timeout = self.config.connect_timeout();
        let connected =
            tokio::time::timeout(timeout, self.connector.connect(&config.port, &config.settings))
                .await
                .unwrap_or_else(|_| {
                    Err(ConnectionError::timeout(format!("connect to {}", config.port), timeout))
                });
        let transport = match connected {
            Ok(transport) => transport,
            Err(err) => {
                warn!(connection = %id, port = %config.port, "Open failed: {}", err);
                self.slots().remove(&id);
                return Err(err.into());
            }
        };

        let mut store = RingBufferStore::new(id, config.buffer.effective_ceiling());
        let mut archiver = None;
        if config.buffer.archive {
            match &self.archive {
                Some(archive) => {
                    let (sink, task) = ArchiveSink::spawn(
                        id,
                        Arc::clone(archive),
                        self.config.archive_queue.max(1),
                        self.archive_status.clone(),
                    );
                    store = store.with_archive(sink);
                    archiver = Some(task);
                }
                None => warn!(connection = %id, "Archiving requested but no archive configured"),
            }
        }

        let (events, _) = broadcast::channel(self.config.event_capacity.max(1));
        let (state_tx, state_rx) = watch::channel(ConnectionState::Open);
        let (filters_tx, filters_rx) = watch::channel(Arc::new(filters));
        let (registry_tx, registry_rx) = watch::channel(Arc::new(registry));

        let channels = Pipeline::spawn(
            PipelineSetup {
                id,
                port: config.port.clone(),
                store,
                registry: registry_rx,
                filters: filters_rx,
                max_residue: config.detector.max_residue,
                match_flush: config.match_flush(),
                events: events.clone(),
                state: state_tx,
                command_capacity: self.config.command_capacity,
                send_timeout: self.config.send_timeout(),
            },
            transport,
        );

        let live = Live {
            port: config.port.clone(),
            events,
            state: state_rx,
            commands: channels.commands,
            writes: channels.writes,
            filters: filters_tx,
            registry: registry_tx,
            cancel: channels.cancel,
            reader: channels.reader,
            writer: channels.writer,
            archiver,
        };
        self.slots().insert(id, Slot::Live(Box::new(live)));
        info!(connection = %id, port = %config.port, "Connection open");
        Ok(id)
    }

    fn with_live<R>(
        &self,
        id: ConnectionId,
        f: impl FnOnce(&Live) -> R,
    ) -> std::result::Result<R, ConnectionError> {
        match self.slots().get(&id) {
            Some(Slot::Live(live)) => Ok(f(live)),
            Some(slot) => Err(ConnectionError::NotOpen { id, state: Box::new(slot.state()) }),
            None => Err(ConnectionError::UnknownConnection(id)),
        }
    }

    fn not_open(&self, id: ConnectionId) -> ConnectionError {
        let state = self.state(id).unwrap_or(ConnectionState::Closed);
        ConnectionError::NotOpen { id, state: Box::new(state) }
    }

    /// Write bytes to an open connection.
    ///
    /// Runs on the connection's writer task, concurrently with ingestion.
    /// A send that exceeds the send timeout fails with `Timeout`; a sink
    /// fault fails the send and moves the connection to `Error`.
    pub async fn send(&self, id: ConnectionId, bytes: &[u8]) -> std::result::Result<Ack, ConnectionError> {
        let (writes, state) = self.with_live(id, |live| (live.writes.clone(), live.current_state()))?;
        if state != ConnectionState::Open {
            return Err(ConnectionError::NotOpen { id, state: Box::new(state) });
        }

        let (reply, response) = oneshot::channel();
        let timeout = self.config.send_timeout();
        let request = WriteRequest { bytes: bytes.to_vec(), reply };
        let outcome = tokio::time::timeout(timeout, async {
            writes.send(request).await.map_err(|_| self.not_open(id))?;
            let written = response.await.map_err(|_| self.not_open(id))??;
            Ok::<usize, ConnectionError>(written)
        })
        .await;

        match outcome {
            Ok(written) => written.map(|bytes_written| Ack { bytes_written }),
            Err(_) => Err(ConnectionError::timeout(format!("send on {}", id), timeout)),
        }
    }

    /// Subscribe to a connection's event feed.
    ///
    /// Only events published after subscribing are delivered.
    pub fn subscribe(&self, id: ConnectionId) -> std::result::Result<EventStream, ConnectionError> {
        self.with_live(id, |live| {
            let state = live.current_state();
            if state.is_terminal() {
                Err(ConnectionError::NotOpen { id, state: Box::new(state) })
            } else {
                Ok(EventStream::new(live.events.subscribe()))
            }
        })?
    }

    /// Close a connection, draining pending frames first.
    ///
    /// Closing an already closed connection returns its final state and
    /// emits nothing.
    pub async fn close_connection(&self, id: ConnectionId) -> std::result::Result<ConnectionState, ConnectionError> {
        self.close_connection_with(id, CloseMode::Graceful).await
    }

    pub async fn close_connection_with(
        &self,
        id: ConnectionId,
        mode: CloseMode,
    ) -> std::result::Result<ConnectionState, ConnectionError> {
        let closing = {
            let mut slots = self.slots();
            let Some(slot) = slots.remove(&id) else {
                return Err(ConnectionError::UnknownConnection(id));
            };
            match slot {
                Slot::Live(live) => {
                    slots.insert(id, Slot::Closing { port: live.port.clone(), state: live.state.clone() });
                    Closing::Run(live)
                }
                Slot::Closing { port, state } => {
                    let waiter = state.clone();
                    slots.insert(id, Slot::Closing { port, state });
                    Closing::Join(waiter)
                }
                Slot::Connecting { .. } => {
                    slots.insert(id, slot);
                    return Err(ConnectionError::NotOpen { id, state: Box::new(ConnectionState::Connecting) });
                }
                other => {
                    let state = other.state();
                    slots.insert(id, other);
                    return Ok(state);
                }
            }
        };

        let live = match closing {
            Closing::Run(live) => live,
            Closing::Join(state) => return Ok(self.join_close(id, state).await),
        };

        let state = self.shutdown(id, *live, mode).await;
        let port = self.slots().get(&id).map(|s| s.port().to_string()).unwrap_or_default();
        self.slots().insert(id, Slot::Terminated { port, state: state.clone() });
        info!(connection = %id, %state, "Connection closed");
        Ok(state)
    }

    /// Wait for a close another caller started.
    async fn join_close(&self, id: ConnectionId, mut state: watch::Receiver<ConnectionState>) -> ConnectionState {
        // Graceful drain plus the forced fallback
        let limit = self.config.close_timeout() * 2;
        let reached = tokio::time::timeout(limit, state.wait_for(ConnectionState::is_terminal))
            .await
            .ok()
            .and_then(|reached| reached.ok().map(|value| value.clone()));
        match reached {
            Some(state) => state,
            None => {
                debug!(connection = %id, "Close in progress did not report a terminal state");
                let current = state.borrow().clone();
                if current.is_terminal() { current } else { ConnectionState::Closed }
            }
        }
    }

    async fn shutdown(&self, id: ConnectionId, live: Live, mode: CloseMode) -> ConnectionState {
        let Live { state, commands, cancel, reader, writer, archiver, .. } = live;
        let close_timeout = self.config.close_timeout();

        let finished = state.borrow().is_terminal();
        if mode == CloseMode::Graceful && !finished {
            let (reply, response) = oneshot::channel();
            let graceful = tokio::time::timeout(close_timeout, async {
                commands.send(Command::Close { reply }).await.ok()?;
                response.await.ok()
            })
            .await
            .ok()
            .flatten();
            if graceful.is_none() {
                warn!(connection = %id, "Graceful close timed out, forcing");
            }
        }

        // Forced close, or cleanup after a graceful one
        cancel.cancel();
        drop(commands);
        if tokio::time::timeout(close_timeout, reader).await.is_err() {
            warn!(connection = %id, "Reader task did not stop in time");
        }
        let _ = tokio::time::timeout(close_timeout, writer).await;
        if let Some(archiver) = archiver {
            // Archive writer finishes once the store (and its sink) is dropped
            let _ = tokio::time::timeout(close_timeout, archiver).await;
        }

        let final_state = state.borrow().clone();
        if final_state.is_terminal() { final_state } else { ConnectionState::Closed }
    }

    /// Close every connection gracefully.
    pub async fn close_all(&self) -> Vec<(ConnectionId, ConnectionState)> {
        let ids: Vec<ConnectionId> = self
            .slots()
            .iter()
            .filter(|(_, slot)| matches!(slot, Slot::Live(_)))
            .map(|(id, _)| *id)
            .collect();

        let mut closed = Vec::with_capacity(ids.len());
        for id in ids {
            if let Ok(state) = self.close_connection(id).await {
                closed.push((id, state));
            }
        }
        closed
    }

    /// Current lifecycle state.
    pub fn state(&self, id: ConnectionId) -> Option<ConnectionState> {
        self.slots().get(&id).map(Slot::state)
    }

    /// Wait until a connection reaches a terminal state, for at most `limit`.
    pub async fn wait_terminal(&self, id: ConnectionId, limit: Duration) -> Option<ConnectionState> {
        let mut state = match self.slots().get(&id)? {
            Slot::Live(live) => live.state.clone(),
            Slot::Closing { state, .. } => state.clone(),
            Slot::Terminated { state, .. } => return Some(state.clone()),
            Slot::Connecting { .. } => return None,
        };
        match tokio::time::timeout(limit, state.wait_for(ConnectionState::is_terminal)).await {
            Ok(Ok(reached)) => Some(reached.clone()),
            _ => None,
        }
    }

    /// All known connections, including terminated ones.
    pub fn connections(&self) -> Vec<ConnectionInfo> {
        let mut list: Vec<ConnectionInfo> = self
            .slots()
            .iter()
            .map(|(id, slot)| ConnectionInfo { id: *id, port: slot.port().to_string(), state: slot.state() })
            .collect();
        list.sort_by_key(|info| info.id);
        list
    }

    async fn request<T>(
        &self,
        id: ConnectionId,
        make: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> std::result::Result<T, ConnectionError> {
        let commands = self.with_live(id, |live| live.commands.clone())?;
        let (reply, response) = oneshot::channel();
        commands.send(make(reply)).await.map_err(|_| self.not_open(id))?;
        response.await.map_err(|_| self.not_open(id))
    }

    /// Read a logical range from the connection's history.
    pub async fn read(&self, id: ConnectionId, range: ByteRange) -> Result<Vec<u8>> {
        let result: std::result::Result<Vec<u8>, ReadError> =
            self.request(id, |reply| Command::Read { range, reply }).await?;
        Ok(result?)
    }

    /// Fetch an archived range returned by [`read`](Self::read).
    pub async fn fetch_archived(&self, handle: &ArchiveHandle) -> std::result::Result<Vec<u8>, ArchiveError> {
        match &self.archive {
            Some(archive) => archive.retrieve(handle).await,
            None => Err(ArchiveError::Unavailable { reason: "no archive configured".into() }),
        }
    }

    /// One-off search over the resident history.
    pub async fn search(&self, id: ConnectionId, spec: &FilterSpec) -> Result<Vec<MatchEvent>> {
        self.search_within(id, spec, TimeWindow::ALL).await
    }

    /// One-off search over resident chunks that arrived within `window`.
    pub async fn search_within(
        &self,
        id: ConnectionId,
        spec: &FilterSpec,
        window: TimeWindow,
    ) -> Result<Vec<MatchEvent>> {
        let filter = Box::new(CompiledFilter::compile(spec)?);
        Ok(self.request(id, |reply| Command::Search { filter, window, reply }).await?)
    }

    pub async fn stats(&self, id: ConnectionId) -> std::result::Result<ConnectionStats, ConnectionError> {
        self.request(id, |reply| Command::Stats { reply }).await
    }

    /// Chunk-size figures for resident chunks that arrived within `window`.
    pub async fn window_stats(
        &self,
        id: ConnectionId,
        window: TimeWindow,
    ) -> std::result::Result<ChunkStats, ConnectionError> {
        self.request(id, |reply| Command::WindowStats { window, reply }).await
    }

    /// Evict the whole resident history. Offsets are not rewound.
    pub async fn clear(&self, id: ConnectionId) -> std::result::Result<(), ConnectionError> {
        self.request(id, |reply| Command::Clear { reply }).await
    }

    /// Replace the filter set. Takes effect at the next chunk boundary.
    ///
    /// An invalid filter rejects the whole update and leaves the active set
    /// untouched.
    pub fn set_filters(&self, id: ConnectionId, specs: &[FilterSpec]) -> Result<()> {
        let set = FilterSet::compile(specs)?;
        self.with_live(id, |live| {
            live.filters.send_replace(Arc::new(set));
        })?;
        debug!(connection = %id, filters = specs.len(), "Filter set updated");
        Ok(())
    }

    /// Add or replace a single filter.
    pub fn add_filter(&self, id: ConnectionId, spec: &FilterSpec) -> Result<()> {
        let filter = CompiledFilter::compile(spec)?;
        self.with_live(id, |live| {
            live.filters.send_modify(|set| *set = Arc::new(set.with(filter)));
        })?;
        Ok(())
    }

    /// Remove a filter. Returns whether it existed.
    pub fn remove_filter(&self, id: ConnectionId, filter_id: &str) -> Result<bool> {
        let removed = self.with_live(id, |live| {
            live.filters.send_if_modified(|set| {
                if set.contains(filter_id) {
                    *set = Arc::new(set.without(filter_id));
                    true
                } else {
                    false
                }
            })
        })?;
        Ok(removed)
    }

    /// Replace the recognizer registry. Takes effect once no frame is in
    /// progress.
    pub fn set_recognizers(&self, id: ConnectionId, specs: &[RecognizerSpec]) -> Result<()> {
        let registry = RecognizerRegistry::from_specs(specs)?;
        self.with_live(id, |live| {
            live.registry.send_replace(Arc::new(registry));
        })?;
        Ok(())
    }

    /// Outcomes of background archive writes, across all connections.
    pub fn archive_status(&self) -> impl Stream<Item = ArchiveStatus> + Send + use<> {
        BroadcastStream::new(self.archive_status.subscribe()).filter_map(|status| status.ok())
    }
}

impl Drop for Orchestrator {
    fn drop(&mut self) {
        let slots = self.slots.get_mut().unwrap_or_else(|e| e.into_inner());
        for slot in slots.values() {
            if let Slot::Live(live) = slot {
                live.cancel.cancel();
            }
        }
    }
}
