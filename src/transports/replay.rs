//! Replay of recorded captures as if they were live ports.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};
use tokio::time::{Duration, Interval, MissedTickBehavior, interval};
use tracing::{debug, info, trace};

use crate::config::SerialSettings;
use crate::error::{ConfigError, ConnectionError};
use crate::transport::{ByteSink, ByteSource, Connector, TransportPair};

/// Default pacing: one chunk every 10 ms.
const DEFAULT_TICK: Duration = Duration::from_millis(10);

/// Connector that plays back recorded byte captures.
///
/// Each recording is cut into `chunk_size` reads delivered once per tick.
/// Writes are accepted and discarded. The port closes when the recording
/// is exhausted.
#[derive(Debug, Clone)]
pub struct ReplayConnector {
    recordings: Arc<Mutex<HashMap<String, Arc<[u8]>>>>,
    chunk_size: usize,
    tick: Duration,
    speed: f64,
}

impl Default for ReplayConnector {
    fn default() -> Self {
        Self {
            recordings: Arc::default(),
            chunk_size: 64,
            tick: DEFAULT_TICK,
            speed: 1.0,
        }
    }
}

impl ReplayConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a capture under a port name.
    pub fn with_recording(self, port: impl Into<String>, bytes: impl Into<Vec<u8>>) -> Self {
        let bytes: Vec<u8> = bytes.into();
        self.recordings
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(port.into(), bytes.into());
        self
    }

    /// Load a raw capture file and register it under `port`.
    pub fn with_file<P: AsRef<Path>>(
        self,
        port: impl Into<String>,
        path: P,
    ) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let bytes = std::fs::read(path)
            .map_err(|source| ConfigError::Io { path: path.to_path_buf(), source })?;
        info!("Loaded capture {} ({} bytes)", path.display(), bytes.len());
        Ok(self.with_recording(port, bytes))
    }

    /// Bytes per simulated read.
    pub fn chunk_size(mut self, size: usize) -> Self {
        self.chunk_size = size.max(1);
        self
    }

    /// Time between reads at 1x speed.
    pub fn tick(mut self, tick: Duration) -> Self {
        self.tick = tick;
        self
    }

    /// Playback speed multiplier.
    pub fn speed(mut self, speed: f64) -> Self {
        self.speed = speed.clamp(0.1, 100.0);
        debug!("Replay speed set to {}x", self.speed);
        self
    }
}

#[async_trait::async_trait]
impl Connector for ReplayConnector {
    async fn connect(
        &self,
        port: &str,
        _settings: &SerialSettings,
    ) -> Result<TransportPair, ConnectionError> {
        let data = self
            .recordings
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(port)
            .cloned()
            .ok_or_else(|| ConnectionError::PortUnavailable {
                port: port.to_string(),
                reason: "no recording for port".into(),
            })?;

        let period = self.tick.div_f64(self.speed).max(Duration::from_micros(1));
        let mut pacing = interval(period);
        pacing.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(port, bytes = data.len(), "Replaying capture");
        let source = ReplaySource { port: port.to_string(), data, position: 0, chunk_size: self.chunk_size, pacing };
        Ok(TransportPair::new(source, DiscardSink))
    }
}

struct ReplaySource {
    port: String,
    data: Arc<[u8]>,
    position: usize,
    chunk_size: usize,
    pacing: Interval,
}

#[async_trait::async_trait]
impl ByteSource for ReplaySource {
    async fn next_chunk(&mut self) -> Result<Option<Vec<u8>>, ConnectionError> {
        if self.position >= self.data.len() {
            debug!(port = %self.port, "Reached end of replay");
            return Ok(None);
        }

        // Interval::tick is cancel-safe, position only moves after it fires
        self.pacing.tick().await;

        let end = (self.position + self.chunk_size).min(self.data.len());
        let chunk = self.data[self.position..end].to_vec();
        trace!(port = %self.port, "Replay {}/{}", end, self.data.len());
        self.position = end;
        Ok(Some(chunk))
    }
}

struct DiscardSink;

#[async_trait::async_trait]
impl ByteSink for DiscardSink {
    async fn write_all(&mut self, _bytes: &[u8]) -> Result<(), ConnectionError> {
        Ok(())
    }
}
