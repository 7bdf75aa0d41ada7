//! Transport traits for byte sources.
//!
//! The orchestrator never touches a serial device directly. A [`Connector`]
//! opens a port and hands back a read half and a write half; the pipeline
//! task owns the read half and a dedicated writer task owns the write half,
//! so sends never stall ingestion.

use crate::config::SerialSettings;
use crate::error::ConnectionError;

/// Read half of an open port.
#[async_trait::async_trait]
pub trait ByteSource: Send + 'static {
    /// Wait for the next run of received bytes.
    ///
    /// Returns:
    /// - `Ok(Some(bytes))` - Bytes received (may be any length)
    /// - `Ok(None)` - The port was closed from the other side
    /// - `Err(e)` - Transport fault; the connection moves to `Error`
    ///
    /// Must be cancel-safe: the pipeline races this against commands and
    /// timers and may drop the future before it completes.
    async fn next_chunk(&mut self) -> Result<Option<Vec<u8>>, ConnectionError>;
}

/// Write half of an open port.
#[async_trait::async_trait]
pub trait ByteSink: Send + 'static {
    /// Write every byte or fail.
    async fn write_all(&mut self, bytes: &[u8]) -> Result<(), ConnectionError>;
}

/// Both halves of an open port.
pub struct TransportPair {
    pub source: Box<dyn ByteSource>,
    pub sink: Box<dyn ByteSink>,
}

impl TransportPair {
    pub fn new(source: impl ByteSource, sink: impl ByteSink) -> Self {
        Self { source: Box::new(source), sink: Box::new(sink) }
    }
}

impl std::fmt::Debug for TransportPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportPair").finish_non_exhaustive()
    }
}

/// Opens ports by name.
///
/// Implementations decide what a port name means: a device path, a
/// simulated port, a recorded capture.
#[async_trait::async_trait]
pub trait Connector: Send + Sync + 'static {
    async fn connect(
        &self,
        port: &str,
        settings: &SerialSettings,
    ) -> Result<TransportPair, ConnectionError>;
}
