//! In-process simulated serial ports.
//!
//! [`ChannelConnector`] stands in for real hardware: each registered port
//! is driven through a [`SimulatedPort`] handle that can push bytes, inject
//! faults and inspect what was written.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, trace};

use crate::config::SerialSettings;
use crate::error::ConnectionError;
use crate::transport::{ByteSink, ByteSource, Connector, TransportPair};

enum Inbound {
    Data(Vec<u8>),
    Fail(ConnectionError),
    HangUp,
}

#[derive(Default)]
struct PortEntry {
    denied: bool,
    connect_delay: Option<Duration>,
    write_failure: Option<ConnectionError>,
    stall_writes: bool,
    /// Sender into the currently open session, if any
    session: Option<mpsc::UnboundedSender<Inbound>>,
    settings: Option<SerialSettings>,
    written: Arc<Mutex<Vec<u8>>>,
}

type Ports = Arc<Mutex<HashMap<String, PortEntry>>>;

fn lock(ports: &Ports) -> MutexGuard<'_, HashMap<String, PortEntry>> {
    ports.lock().unwrap_or_else(|e| e.into_inner())
}

/// Connector over simulated ports.
#[derive(Clone, Default)]
pub struct ChannelConnector {
    ports: Ports,
}

impl ChannelConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a port and return its control handle.
    pub fn add_port(&self, name: impl Into<String>) -> SimulatedPort {
        let name = name.into();
        lock(&self.ports).entry(name.clone()).or_default();
        SimulatedPort { name, ports: Arc::clone(&self.ports) }
    }

    /// Control handle for an already registered port.
    pub fn port(&self, name: &str) -> Option<SimulatedPort> {
        lock(&self.ports)
            .contains_key(name)
            .then(|| SimulatedPort { name: name.to_string(), ports: Arc::clone(&self.ports) })
    }
}

#[async_trait::async_trait]
impl Connector for ChannelConnector {
    async fn connect(
        &self,
        port: &str,
        settings: &SerialSettings,
    ) -> Result<TransportPair, ConnectionError> {
        let delay = lock(&self.ports).get(port).and_then(|e| e.connect_delay);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut ports = lock(&self.ports);
        let entry = ports.get_mut(port).ok_or_else(|| ConnectionError::PortUnavailable {
            port: port.to_string(),
            reason: "no such port".into(),
        })?;
        if entry.denied {
            return Err(ConnectionError::PermissionDenied { port: port.to_string() });
        }
        if entry.session.as_ref().is_some_and(|s| !s.is_closed()) {
            return Err(ConnectionError::PortUnavailable {
                port: port.to_string(),
                reason: "port in use".into(),
            });
        }

        let (tx, rx) = mpsc::unbounded_channel();
        entry.session = Some(tx);
        entry.settings = Some(settings.clone());
        debug!(port, baud = settings.baud_rate, "Simulated port opened");

        let source = ChannelSource { port: port.to_string(), rx };
        let sink = ChannelSink {
            port: port.to_string(),
            ports: Arc::clone(&self.ports),
            written: Arc::clone(&entry.written),
        };
        Ok(TransportPair::new(source, sink))
    }
}

struct ChannelSource {
    port: String,
    rx: mpsc::UnboundedReceiver<Inbound>,
}

#[async_trait::async_trait]
impl ByteSource for ChannelSource {
    async fn next_chunk(&mut self) -> Result<Option<Vec<u8>>, ConnectionError> {
        match self.rx.recv().await {
            Some(Inbound::Data(bytes)) => {
                trace!(port = %self.port, len = bytes.len(), "Simulated read");
                Ok(Some(bytes))
            }
            Some(Inbound::Fail(err)) => Err(err),
            Some(Inbound::HangUp) | None => Ok(None),
        }
    }
}

struct ChannelSink {
    port: String,
    ports: Ports,
    written: Arc<Mutex<Vec<u8>>>,
}

#[async_trait::async_trait]
impl ByteSink for ChannelSink {
    async fn write_all(&mut self, bytes: &[u8]) -> Result<(), ConnectionError> {
        let (failure, stall) = match lock(&self.ports).get(&self.port) {
            Some(entry) => (entry.write_failure.clone(), entry.stall_writes),
            None => (
                Some(ConnectionError::DeviceRemoved {
                    port: self.port.clone(),
                    reason: "port unplugged".into(),
                }),
                false,
            ),
        };
        if let Some(err) = failure {
            return Err(err);
        }
        if stall {
            std::future::pending::<()>().await;
        }
        self.written.lock().unwrap_or_else(|e| e.into_inner()).extend_from_slice(bytes);
        Ok(())
    }
}

/// Test-side handle of a simulated port.
#[derive(Clone)]
pub struct SimulatedPort {
    name: String,
    ports: Ports,
}

impl SimulatedPort {
    pub fn name(&self) -> &str {
        &self.name
    }

    fn with_entry<R>(&self, f: impl FnOnce(&mut PortEntry) -> R) -> Option<R> {
        lock(&self.ports).get_mut(&self.name).map(f)
    }

    fn send(&self, message: Inbound) -> bool {
        self.with_entry(|e| e.session.as_ref().is_some_and(|s| s.send(message).is_ok()))
            .unwrap_or(false)
    }

    /// Deliver bytes as one read. Returns `false` if the port is not open.
    pub fn feed(&self, bytes: impl Into<Vec<u8>>) -> bool {
        self.send(Inbound::Data(bytes.into()))
    }

    /// Make the next read fail with `err`.
    pub fn fail(&self, err: ConnectionError) -> bool {
        self.send(Inbound::Fail(err))
    }

    /// Close the port from the device side.
    pub fn hang_up(&self) -> bool {
        self.send(Inbound::HangUp)
    }

    /// Remove the device: the open session fails and the port disappears.
    pub fn unplug(&self) {
        let err = ConnectionError::DeviceRemoved {
            port: self.name.clone(),
            reason: "device unplugged".into(),
        };
        self.fail(err);
        lock(&self.ports).remove(&self.name);
    }

    pub fn deny_access(&self, denied: bool) {
        self.with_entry(|e| e.denied = denied);
    }

    pub fn set_connect_delay(&self, delay: Option<Duration>) {
        self.with_entry(|e| e.connect_delay = delay);
    }

    /// Fail every write with `err` until cleared.
    pub fn fail_writes(&self, err: Option<ConnectionError>) {
        self.with_entry(|e| e.write_failure = err);
    }

    /// Make writes hang forever until cleared.
    pub fn stall_writes(&self, stall: bool) {
        self.with_entry(|e| e.stall_writes = stall);
    }

    /// Bytes written to the port so far.
    pub fn written(&self) -> Vec<u8> {
        self.with_entry(|e| e.written.lock().unwrap_or_else(|p| p.into_inner()).clone())
            .unwrap_or_default()
    }

    /// Settings used by the last open.
    pub fn settings(&self) -> Option<SerialSettings> {
        self.with_entry(|e| e.settings.clone()).flatten()
    }

    /// Whether a session is currently attached.
    pub fn is_open(&self) -> bool {
        self.with_entry(|e| e.session.as_ref().is_some_and(|s| !s.is_closed())).unwrap_or(false)
    }
}
