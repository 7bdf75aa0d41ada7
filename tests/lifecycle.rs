//! Connection lifecycle, duplex sends and error propagation.

mod common;

use common::*;
use futures::StreamExt;
use serialscope::config::{ConnectionConfig, OrchestratorConfig, RecognizerSpec};
use serialscope::{CloseMode, ConnectionError, ConnectionEvent, ConnectionState, Error, ProtocolTag};
use std::time::Duration;

fn modbus_only(port: &str) -> ConnectionConfig {
    ConnectionConfig::new(port).with_recognizers(vec![RecognizerSpec::modbus_rtu(10)])
}

#[tokio::test]
async fn closing_twice_yields_the_same_state_and_no_events() {
    let (orchestrator, connector) = orchestrator();
    let (id, _device, events) = open(&orchestrator, &connector, ConnectionConfig::new("p0")).await;

    assert_eq!(orchestrator.close_connection(id).await.unwrap(), ConnectionState::Closed);
    let first = drain(events).await;
    assert_eq!(
        first.iter().filter(|e| matches!(e, ConnectionEvent::StateChanged(ConnectionState::Closed))).count(),
        1
    );

    assert_eq!(orchestrator.close_connection(id).await.unwrap(), ConnectionState::Closed);
    assert_eq!(orchestrator.state(id), Some(ConnectionState::Closed));
    assert!(matches!(orchestrator.subscribe(id), Err(ConnectionError::NotOpen { .. })));
}

#[tokio::test]
async fn concurrent_closes_both_report_the_terminal_state() {
    let (orchestrator, connector) = orchestrator();
    let (id, _device, _events) = open(&orchestrator, &connector, ConnectionConfig::new("p0c")).await;

    let (first, second) = tokio::join!(orchestrator.close_connection(id), orchestrator.close_connection(id));
    assert_eq!(first.unwrap(), ConnectionState::Closed);
    assert_eq!(second.unwrap(), ConnectionState::Closed);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn closes_racing_across_threads_agree() {
    let (orchestrator, connector) = orchestrator();
    let orchestrator = std::sync::Arc::new(orchestrator);
    let (id, _device, _events) = open(&orchestrator, &connector, ConnectionConfig::new("p0d")).await;

    let other = tokio::spawn({
        let orchestrator = orchestrator.clone();
        async move { orchestrator.close_connection(id).await }
    });
    let here = orchestrator.close_connection(id).await.unwrap();
    let there = other.await.unwrap().unwrap();
    assert_eq!(here, ConnectionState::Closed);
    assert_eq!(there, ConnectionState::Closed);
}

#[tokio::test]
async fn a_port_can_only_be_open_once() {
    let (orchestrator, connector) = orchestrator();
    let (id, _device, _events) = open(&orchestrator, &connector, ConnectionConfig::new("p1")).await;

    let again = orchestrator.open_connection(ConnectionConfig::new("p1")).await;
    assert!(matches!(
        again,
        Err(Error::Connection(ConnectionError::AlreadyOpen { id: holder, .. })) if holder == id
    ));

    orchestrator.close_connection(id).await.unwrap();
    let reopened = orchestrator.open_connection(ConnectionConfig::new("p1")).await.unwrap();
    assert_ne!(reopened, id);
    assert_eq!(orchestrator.state(reopened), Some(ConnectionState::Open));
}

#[tokio::test]
async fn open_failures_are_classified() {
    let (orchestrator, connector) = orchestrator();

    let missing = orchestrator.open_connection(ConnectionConfig::new("nope")).await;
    assert!(matches!(missing, Err(Error::Connection(ConnectionError::PortUnavailable { .. }))));

    let locked = connector.add_port("locked");
    locked.deny_access(true);
    let denied = orchestrator.open_connection(ConnectionConfig::new("locked")).await;
    assert!(matches!(denied, Err(Error::Connection(ConnectionError::PermissionDenied { .. }))));

    // Failed opens leave nothing behind
    assert!(orchestrator.connections().is_empty());

    let invalid = orchestrator.open_connection(ConnectionConfig::new("locked").with_ceiling(0)).await;
    assert!(matches!(invalid, Err(Error::Config(_))));
}

#[tokio::test(start_paused = true)]
async fn slow_connect_times_out() {
    let config = OrchestratorConfig { connect_timeout_ms: 50, ..OrchestratorConfig::default() };
    let (orchestrator, connector) = orchestrator_with(config);
    connector.add_port("slow").set_connect_delay(Some(Duration::from_secs(10)));

    let result = orchestrator.open_connection(ConnectionConfig::new("slow")).await;
    assert!(matches!(result, Err(Error::Connection(ConnectionError::Timeout { .. }))));
    assert!(orchestrator.connections().is_empty());
}

#[tokio::test]
async fn sends_reach_the_device_while_reads_continue() {
    let (orchestrator, connector) = orchestrator();
    let (id, device, mut events) = open(&orchestrator, &connector, ConnectionConfig::new("duplex")).await;

    let ack = orchestrator.send(id, b"AT\r\n").await.unwrap();
    assert_eq!(ack.bytes_written, 4);
    device.feed(b"OK\r\n".to_vec());
    next_chunk(&mut events).await;
    let ack = orchestrator.send(id, b"ATI\r\n").await.unwrap();
    assert_eq!(ack.bytes_written, 5);
    assert_eq!(device.written(), b"AT\r\nATI\r\n".to_vec());

    orchestrator.close_connection(id).await.unwrap();
    assert!(matches!(
        orchestrator.send(id, b"late").await,
        Err(ConnectionError::NotOpen { .. })
    ));
}

#[tokio::test(start_paused = true)]
async fn stalled_send_times_out_without_closing() {
    let config = OrchestratorConfig { send_timeout_ms: 50, ..OrchestratorConfig::default() };
    let (orchestrator, connector) = orchestrator_with(config);
    let (id, device, _events) = open(&orchestrator, &connector, ConnectionConfig::new("stall")).await;

    device.stall_writes(true);
    let result = orchestrator.send(id, b"ping").await;
    assert!(matches!(result, Err(ConnectionError::Timeout { .. })));
    assert_eq!(orchestrator.state(id), Some(ConnectionState::Open));

    device.stall_writes(false);
    assert_eq!(orchestrator.send(id, b"ping").await.unwrap().bytes_written, 4);
}

#[tokio::test]
async fn write_fault_moves_connection_to_error() {
    let (orchestrator, connector) = orchestrator();
    let (id, device, events) = open(&orchestrator, &connector, ConnectionConfig::new("wf")).await;

    let removed = ConnectionError::DeviceRemoved { port: "wf".into(), reason: "gone".into() };
    device.fail_writes(Some(removed.clone()));
    assert_eq!(orchestrator.send(id, b"x").await, Err(removed.clone()));

    let state = orchestrator.wait_terminal(id, WAIT).await;
    assert_eq!(state, Some(ConnectionState::Error(removed.clone())));
    let seen = drain(events).await;
    assert_eq!(seen.last(), Some(&ConnectionEvent::StateChanged(ConnectionState::Error(removed))));
}

#[tokio::test]
async fn device_removal_only_affects_its_own_connection() {
    let (orchestrator, connector) = orchestrator();
    let (gone, unplugged, gone_events) =
        open(&orchestrator, &connector, ConnectionConfig::new("usb0")).await;
    let (alive, sibling, mut alive_events) =
        open(&orchestrator, &connector, ConnectionConfig::new("usb1")).await;

    unplugged.unplug();
    let seen = drain(gone_events).await;
    assert!(matches!(
        seen.last(),
        Some(ConnectionEvent::StateChanged(ConnectionState::Error(ConnectionError::DeviceRemoved { .. })))
    ));
    assert!(matches!(orchestrator.state(gone), Some(ConnectionState::Error(_))));

    sibling.feed(b"still here\n".to_vec());
    next_chunk(&mut alive_events).await;
    assert_eq!(orchestrator.state(alive), Some(ConnectionState::Open));

    // Closing an errored connection keeps its error state
    assert!(matches!(orchestrator.close_connection(gone).await, Ok(ConnectionState::Error(_))));
}

#[tokio::test]
async fn device_hang_up_closes_the_connection() {
    let (orchestrator, connector) = orchestrator();
    let (id, device, events) = open(&orchestrator, &connector, modbus_only("hup")).await;

    device.feed(vec![0x01, 0x03, 0x00]);
    device.hang_up();
    let seen = drain(events).await;

    let partial = frames(&seen);
    assert_eq!(partial.len(), 1);
    assert_eq!(partial[0].protocol, ProtocolTag::Unknown);
    assert!(!partial[0].valid);
    assert_eq!(seen.last(), Some(&ConnectionEvent::StateChanged(ConnectionState::Closed)));
    assert_eq!(orchestrator.wait_terminal(id, WAIT).await, Some(ConnectionState::Closed));
}

#[tokio::test]
async fn graceful_close_emits_the_partial_frame() {
    let (orchestrator, connector) = orchestrator();
    let (id, device, mut events) = open(&orchestrator, &connector, modbus_only("gc")).await;

    device.feed(vec![0x01, 0x03, 0x00]);
    let mut all = until_offset(&mut events, 3).await;
    orchestrator.close_connection_with(id, CloseMode::Graceful).await.unwrap();
    all.extend(drain(events).await);

    let partial = frames(&all);
    assert_eq!(partial.len(), 1);
    assert_eq!(partial[0].range, serialscope::ByteRange::new(0, 3));
    assert_eq!(partial[0].protocol, ProtocolTag::Unknown);
}

#[tokio::test]
async fn forced_close_discards_pending_bytes() {
    let (orchestrator, connector) = orchestrator();
    let (id, device, mut events) = open(&orchestrator, &connector, modbus_only("fc")).await;

    device.feed(vec![0x01, 0x03, 0x00]);
    let mut all = until_offset(&mut events, 3).await;
    let state = orchestrator.close_connection_with(id, CloseMode::Forced).await.unwrap();
    all.extend(drain(events).await);

    assert_eq!(state, ConnectionState::Closed);
    assert!(frames(&all).is_empty());
}

#[tokio::test]
async fn close_all_closes_every_live_connection() {
    let (orchestrator, connector) = orchestrator();
    let (a, _da, _ea) = open(&orchestrator, &connector, ConnectionConfig::new("a")).await;
    let (b, _db, _eb) = open(&orchestrator, &connector, ConnectionConfig::new("b")).await;

    let mut closed = orchestrator.close_all().await;
    closed.sort_by_key(|(id, _)| *id);
    assert_eq!(closed, vec![(a, ConnectionState::Closed), (b, ConnectionState::Closed)]);
    assert!(orchestrator.connections().iter().all(|c| c.state == ConnectionState::Closed));
}

#[tokio::test]
async fn unknown_ids_are_rejected() {
    let (orchestrator, _connector) = orchestrator();
    let ghost = serialscope::ConnectionId::new(999);
    assert!(matches!(
        orchestrator.close_connection(ghost).await,
        Err(ConnectionError::UnknownConnection(_))
    ));
    assert!(matches!(orchestrator.subscribe(ghost), Err(ConnectionError::UnknownConnection(_))));
    assert!(orchestrator.state(ghost).is_none());
}

#[tokio::test]
async fn late_subscribers_only_see_new_events() {
    let (orchestrator, connector) = orchestrator();
    let (id, device, mut early) = open(&orchestrator, &connector, modbus_only("late")).await;

    device.feed(b"first".to_vec());
    next_chunk(&mut early).await;

    let mut late = orchestrator.subscribe(id).unwrap();
    device.feed(b"second".to_vec());
    let range = next_chunk(&mut late).await;
    assert_eq!(range, serialscope::ByteRange::new(5, 11));

    orchestrator.close_connection(id).await.unwrap();
    assert!(late.any(|e| async move { matches!(e, ConnectionEvent::StateChanged(ConnectionState::Closed)) }).await);
}
