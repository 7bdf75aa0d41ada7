//! Shared helpers for the integration tests.
#![allow(dead_code)]

use futures::StreamExt;
use serialscope::checksum::append_modbus_crc;
use serialscope::config::{ConnectionConfig, OrchestratorConfig};
use serialscope::transports::{ChannelConnector, SimulatedPort};
use serialscope::{ConnectionEvent, ConnectionId, EventStream, Frame, MatchEvent, Orchestrator};
use std::sync::{Arc, Once};
use std::time::Duration;

/// Upper bound for any single wait in these tests.
pub const WAIT: Duration = Duration::from_secs(5);

pub fn init_tracing() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
            )
            .with_test_writer()
            .try_init();
    });
}

pub fn orchestrator_with(config: OrchestratorConfig) -> (Orchestrator, ChannelConnector) {
    init_tracing();
    let connector = ChannelConnector::new();
    let orchestrator = Orchestrator::new(Arc::new(connector.clone()), config);
    (orchestrator, connector)
}

pub fn orchestrator() -> (Orchestrator, ChannelConnector) {
    orchestrator_with(OrchestratorConfig::default())
}

/// Register the port, open it and subscribe before any byte is fed.
pub async fn open(
    orchestrator: &Orchestrator,
    connector: &ChannelConnector,
    config: ConnectionConfig,
) -> (ConnectionId, SimulatedPort, EventStream) {
    let device = connector.add_port(config.port.clone());
    let id = orchestrator.open_connection(config).await.expect("open connection");
    let events = orchestrator.subscribe(id).expect("subscribe");
    (id, device, events)
}

/// Wait for the first event `pick` accepts.
pub async fn wait_for<T>(
    events: &mut EventStream,
    mut pick: impl FnMut(&ConnectionEvent) -> Option<T>,
) -> T {
    let found = tokio::time::timeout(WAIT, async {
        while let Some(event) = events.next().await {
            if let Some(value) = pick(&event) {
                return Some(value);
            }
        }
        None
    })
    .await;
    found.ok().flatten().expect("expected event was not observed")
}

pub async fn next_chunk(events: &mut EventStream) -> serialscope::ByteRange {
    wait_for(events, |e| match e {
        ConnectionEvent::ByteChunkArrived { range, .. } => Some(*range),
        _ => None,
    })
    .await
}

/// Collect events until the chunk ending at `end` has been ingested, plus
/// whatever that chunk produced before the next chunk.
pub async fn until_offset(events: &mut EventStream, end: u64) -> Vec<ConnectionEvent> {
    let mut seen = Vec::new();
    let collected = tokio::time::timeout(WAIT, async {
        while let Some(event) = events.next().await {
            let done = matches!(&event, ConnectionEvent::ByteChunkArrived { range, .. } if range.end >= end);
            seen.push(event);
            if done {
                return true;
            }
        }
        false
    })
    .await;
    assert_eq!(collected, Ok(true), "stream never reached offset {}", end);
    seen
}

/// Everything up to and including the terminal state change.
pub async fn drain(events: EventStream) -> Vec<ConnectionEvent> {
    tokio::time::timeout(WAIT, events.collect::<Vec<_>>()).await.expect("event stream did not end")
}

pub fn frames(events: &[ConnectionEvent]) -> Vec<Frame> {
    events
        .iter()
        .filter_map(|e| match e {
            ConnectionEvent::FrameDetected(frame) => Some(frame.clone()),
            _ => None,
        })
        .collect()
}

pub fn matches(events: &[ConnectionEvent]) -> Vec<MatchEvent> {
    events
        .iter()
        .filter_map(|e| match e {
            ConnectionEvent::MatchFound(m) => Some(m.clone()),
            _ => None,
        })
        .collect()
}

/// Read Holding Registers request with a valid CRC.
pub fn read_request(unit: u8, address: u16, count: u16) -> Vec<u8> {
    let [ah, al] = address.to_be_bytes();
    let [ch, cl] = count.to_be_bytes();
    append_modbus_crc(&[unit, 0x03, ah, al, ch, cl])
}
