//! Test utilities for building serial traffic fixtures
//!
//! Shared by unit tests and benchmarks. Everything here is deterministic so
//! benchmark inputs and test expectations stay stable between runs.

#![cfg(any(test, feature = "benchmark"))]

use std::sync::Once;
use std::time::SystemTime;

use crate::checksum::append_modbus_crc;
use crate::types::ByteChunk;

/// Read Holding Registers request with a valid CRC.
pub fn modbus_read_request(unit: u8, address: u16, count: u16) -> Vec<u8> {
    let [ah, al] = address.to_be_bytes();
    let [ch, cl] = count.to_be_bytes();
    append_modbus_crc(&[unit, 0x03, ah, al, ch, cl])
}

/// Read Holding Registers response carrying `registers`.
pub fn modbus_read_response(unit: u8, registers: &[u16]) -> Vec<u8> {
    let mut body = vec![unit, 0x03, (registers.len() * 2) as u8];
    for reg in registers {
        body.extend_from_slice(&reg.to_be_bytes());
    }
    append_modbus_crc(&body)
}

/// Exception response for `function`.
pub fn modbus_exception(unit: u8, function: u8, code: u8) -> Vec<u8> {
    append_modbus_crc(&[unit, function | 0x80, code])
}

/// Same frame with the last CRC byte flipped.
pub fn corrupt_crc(mut frame: Vec<u8>) -> Vec<u8> {
    if let Some(last) = frame.last_mut() {
        *last ^= 0xFF;
    }
    frame
}

/// Cut `bytes` at the given positions. Positions past the end are ignored.
pub fn split_at_positions(bytes: &[u8], cuts: &[usize]) -> Vec<Vec<u8>> {
    let mut cuts: Vec<usize> = cuts.iter().copied().filter(|c| *c > 0 && *c < bytes.len()).collect();
    cuts.sort_unstable();
    cuts.dedup();

    let mut parts = Vec::with_capacity(cuts.len() + 1);
    let mut from = 0;
    for cut in cuts {
        parts.push(bytes[from..cut].to_vec());
        from = cut;
    }
    parts.push(bytes[from..].to_vec());
    parts
}

/// Turn raw parts into consecutive chunks starting at `offset`.
pub fn chunks_from(parts: &[Vec<u8>], offset: u64) -> Vec<ByteChunk> {
    let mut next = offset;
    parts
        .iter()
        .enumerate()
        .map(|(seq, part)| {
            let chunk = ByteChunk::new(seq as u64, next, part.clone(), SystemTime::UNIX_EPOCH);
            next += part.len() as u64;
            chunk
        })
        .collect()
}

/// Fixed-size chunking of a capture.
pub fn chunked(bytes: &[u8], size: usize) -> Vec<ByteChunk> {
    let parts: Vec<Vec<u8>> = bytes.chunks(size.max(1)).map(<[u8]>::to_vec).collect();
    chunks_from(&parts, 0)
}

/// Synthetic bus capture: `cycles` request/response pairs with a log line
/// and a little line noise in between.
pub fn mixed_capture(cycles: usize) -> Vec<u8> {
    let mut capture = Vec::new();
    for i in 0..cycles {
        let unit = (i % 8) as u8 + 1;
        let count = (i % 4) as u16 + 1;
        capture.extend(modbus_read_request(unit, 0x0100 + i as u16, count));
        let registers: Vec<u16> = (0..count).map(|r| (i as u16).wrapping_mul(31).wrapping_add(r)).collect();
        capture.extend(modbus_read_response(unit, &registers));
        if i % 5 == 0 {
            capture.extend_from_slice(format!("[{:06}] poll ERROR timeout unit {}\n", i, unit).as_bytes());
        } else {
            capture.extend_from_slice(format!("[{:06}] poll ok\n", i).as_bytes());
        }
    }
    capture
}

/// Install a test subscriber once. Respects `RUST_LOG`.
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
