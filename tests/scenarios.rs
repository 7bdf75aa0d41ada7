//! End-to-end pipeline behaviour through the orchestrator and simulated ports.

mod common;

use common::*;
use serialscope::config::{ConnectionConfig, FilterSpec, RecognizerSpec};
use serialscope::{ByteRange, ConnectionEvent, ConnectionState, Error, ProtocolTag, ReadError};

#[tokio::test]
async fn modbus_request_split_mid_frame_is_one_valid_frame() {
    let (orchestrator, connector) = orchestrator();
    let (id, device, mut events) =
        open(&orchestrator, &connector, ConnectionConfig::new("bus0")).await;

    let request = read_request(0x01, 0x0000, 0x0002);
    assert!(device.feed(request[..3].to_vec()));
    assert!(device.feed(request[3..].to_vec()));

    let frame = wait_for(&mut events, |e| match e {
        ConnectionEvent::FrameDetected(frame) => Some(frame.clone()),
        _ => None,
    })
    .await;
    assert_eq!(frame.protocol, ProtocolTag::ModbusRtu);
    assert!(frame.valid);
    assert_eq!(&frame.payload[..], &request[..]);
    assert_eq!(frame.range, ByteRange::new(0, 8));

    assert_eq!(orchestrator.close_connection(id).await.unwrap(), ConnectionState::Closed);
    let rest = drain(events).await;
    assert!(frames(&rest).is_empty(), "no further frames expected, got {:?}", frames(&rest));
    assert_eq!(rest.last(), Some(&ConnectionEvent::StateChanged(ConnectionState::Closed)));
}

#[tokio::test]
async fn literal_split_across_three_chunks_matches_once() {
    let text = b"...OK...ERROR...OK...";
    let splits: [(usize, usize); 5] = [(9, 11), (8, 13), (1, 20), (10, 12), (5, 15)];

    for (a, b) in splits {
        let (orchestrator, connector) = orchestrator();
        let config = ConnectionConfig::new("tty0").with_filter(FilterSpec::literal("err", "ERROR"));
        let (id, device, mut events) = open(&orchestrator, &connector, config).await;

        device.feed(text[..a].to_vec());
        device.feed(text[a..b].to_vec());
        device.feed(text[b..].to_vec());

        let mut all = until_offset(&mut events, text.len() as u64).await;
        orchestrator.close_connection(id).await.unwrap();
        all.extend(drain(events).await);
        let mut seen = matches(&all);
        seen.retain(|m| &*m.filter_id == "err");

        assert_eq!(seen.len(), 1, "split at {} and {}", a, b);
        assert_eq!(seen[0].range, ByteRange::new(8, 13));
        assert_eq!(&seen[0].bytes[..], b"ERROR");
    }
}

#[tokio::test]
async fn resident_bytes_never_exceed_the_ceiling() {
    let (orchestrator, connector) = orchestrator();
    let config = ConnectionConfig::new("tty1").with_ceiling(100);
    let (id, device, mut events) = open(&orchestrator, &connector, config).await;

    let data: Vec<u8> = (0u8..150).collect();
    for (i, part) in data.chunks(30).enumerate() {
        device.feed(part.to_vec());
        assert_eq!(next_chunk(&mut events).await, ByteRange::at(i as u64 * 30, 30));

        let stats = orchestrator.stats(id).await.unwrap();
        let total = (i as u64 + 1) * 30;
        assert!(stats.buffer.resident_bytes <= 100);
        assert_eq!(stats.buffer.total_bytes, total);
        assert_eq!(stats.buffer.evicted_bytes, total.saturating_sub(100));
    }

    // The newest 100 bytes survive, exactly
    let resident = orchestrator.read(id, ByteRange::new(50, 150)).await.unwrap();
    assert_eq!(resident, data[50..].to_vec());
    assert!(matches!(
        orchestrator.read(id, ByteRange::new(40, 60)).await,
        Err(Error::Read(ReadError::RangeEvicted { .. }))
    ));
    assert!(matches!(
        orchestrator.read(id, ByteRange::new(140, 160)).await,
        Err(Error::Read(ReadError::NotYetReceived { next_offset: 150, .. }))
    ));
}

#[tokio::test]
async fn every_byte_lands_in_exactly_one_frame() {
    let (orchestrator, connector) = orchestrator();
    let (id, device, mut events) =
        open(&orchestrator, &connector, ConnectionConfig::new("mix")).await;

    let mut capture = read_request(0x01, 0x0010, 0x0004);
    capture.extend_from_slice(b"\x00\xff\x13 boot banner\n");
    capture.extend(read_request(0x02, 0x0000, 0x0001));
    capture.extend_from_slice(b"trailing partial");
    for part in capture.chunks(5) {
        device.feed(part.to_vec());
    }

    let mut all = until_offset(&mut events, capture.len() as u64).await;
    orchestrator.close_connection(id).await.unwrap();
    all.extend(drain(events).await);
    let detected = frames(&all);

    let mut cursor = 0;
    for frame in &detected {
        assert_eq!(frame.range.start, cursor, "gap or overlap before {:?}", frame);
        assert_eq!(frame.range.len(), frame.payload.len() as u64);
        cursor = frame.range.end;
    }
    assert_eq!(cursor, capture.len() as u64);

    let modbus: Vec<_> = detected.iter().filter(|f| f.protocol == ProtocolTag::ModbusRtu).collect();
    assert_eq!(modbus.len(), 2);
    assert!(modbus.iter().all(|f| f.valid));
}

#[tokio::test]
async fn match_offsets_survive_eviction() {
    let (orchestrator, connector) = orchestrator();
    let config = ConnectionConfig::new("tty2")
        .with_ceiling(16)
        .with_recognizers(vec![RecognizerSpec::modbus_rtu(0)])
        .with_filter(FilterSpec::literal("err", "ERROR"));
    let (id, device, mut events) = open(&orchestrator, &connector, config).await;

    device.feed(vec![b'.'; 40]);
    device.feed(b"ERROR".to_vec());
    let found = wait_for(&mut events, |e| match e {
        ConnectionEvent::MatchFound(m) => Some(m.clone()),
        _ => None,
    })
    .await;
    assert_eq!(found.range, ByteRange::new(40, 45));
    assert_eq!(orchestrator.read(id, found.range).await.unwrap(), b"ERROR".to_vec());

    device.feed(vec![b'.'; 32]);
    next_chunk(&mut events).await;
    assert!(matches!(
        orchestrator.read(id, found.range).await,
        Err(Error::Read(ReadError::RangeEvicted { range })) if range == found.range
    ));
}
