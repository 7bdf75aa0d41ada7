//! Modbus RTU framing.
//!
//! RTU frames carry no length header, so the frame end is inferred from the
//! function code: each code has one or two plausible lengths (request and
//! response shapes), and the CRC-16 decides which one is real.

use super::recognizer::Verdict;
use crate::checksum::crc16_modbus;

/// Highest unicast address; 0 is broadcast.
const MAX_UNIT: u8 = 247;

/// Minimal decoded view of a Modbus RTU frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModbusSummary {
    pub unit_id: u8,
    pub function_code: u8,
    /// Exception code, when the function code has the error bit set
    pub exception: Option<u8>,
    /// Bytes between the function code and the CRC
    pub data: Vec<u8>,
}

impl ModbusSummary {
    pub fn is_exception(&self) -> bool {
        self.exception.is_some()
    }
}

/// Decode the header of a complete RTU frame (CRC included).
pub fn summarize(frame: &[u8]) -> Option<ModbusSummary> {
    if frame.len() < 4 {
        return None;
    }
    let function_code = frame[1];
    let data = frame[2..frame.len() - 2].to_vec();
    let exception = (function_code & 0x80 != 0).then(|| data.first().copied()).flatten();
    Some(ModbusSummary { unit_id: frame[0], function_code, exception, data })
}

enum Lengths {
    /// Function code is not one we frame
    Unknown,
    /// More header bytes are needed to know the candidates
    NeedHeader,
    Known(Vec<usize>),
}

/// Plausible total frame lengths for the frame starting at `buf[0]`.
fn candidate_lengths(buf: &[u8]) -> Lengths {
    let fc = buf[1];
    let byte_at = |i: usize| buf.get(i).map(|&b| b as usize);

    if fc & 0x80 != 0 {
        return if fc & 0x7F == 0 { Lengths::Unknown } else { Lengths::Known(vec![5]) };
    }

    let mut lengths = match fc {
        // Reads: 8-byte request, byte-counted response
        1..=4 => match byte_at(2) {
            Some(count) => vec![8, 5 + count],
            None => return Lengths::NeedHeader,
        },
        // Single writes and diagnostics echo the request
        5 | 6 | 8 => vec![8],
        // Read exception status
        7 => vec![4, 5],
        // Get comm event counter
        11 => vec![4, 8],
        // Get comm event log, report server id
        12 | 17 => match byte_at(2) {
            Some(count) => vec![4, 5 + count],
            None => return Lengths::NeedHeader,
        },
        // Multiple writes: byte-counted request, 8-byte response
        15 | 16 => match byte_at(6) {
            Some(count) => vec![8, 9 + count],
            None => return Lengths::NeedHeader,
        },
        // Mask write register
        22 => vec![10],
        _ => return Lengths::Unknown,
    };
    lengths.sort_unstable();
    lengths.dedup();
    Lengths::Known(lengths)
}

fn crc_matches(frame: &[u8]) -> bool {
    let (body, wire) = frame.split_at(frame.len() - 2);
    crc16_modbus(body) == u16::from_le_bytes([wire[0], wire[1]])
}

fn mismatch(frame: &[u8]) -> (u16, u16) {
    let (body, wire) = frame.split_at(frame.len() - 2);
    (crc16_modbus(body), u16::from_le_bytes([wire[0], wire[1]]))
}

/// Modbus RTU recognizer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModbusRtu {
    unit: Option<u8>,
}

impl ModbusRtu {
    pub fn new(unit: Option<u8>) -> Self {
        Self { unit }
    }

    pub(crate) fn examine(&self, buf: &[u8], closing: bool) -> Verdict {
        let Some(&address) = buf.first() else { return Verdict::NoMatch };
        if address > MAX_UNIT || self.unit.is_some_and(|u| u != address) {
            return Verdict::NoMatch;
        }
        if buf.len() < 2 {
            return if closing { Verdict::NoMatch } else { Verdict::NeedMore };
        }

        let lengths = match candidate_lengths(buf) {
            Lengths::Unknown => return Verdict::NoMatch,
            Lengths::NeedHeader if closing => return Verdict::NoMatch,
            Lengths::NeedHeader => return Verdict::NeedMore,
            Lengths::Known(lengths) => lengths,
        };

        if let Some(&len) = lengths.iter().find(|&&len| len <= buf.len() && crc_matches(&buf[..len]))
        {
            return Verdict::Complete { len, mismatch: None };
        }
        if closing {
            // Silence ended the frame: a buffer of exactly a plausible length
            // is a corrupted frame rather than noise.
            if lengths.contains(&buf.len()) {
                return Verdict::Complete { len: buf.len(), mismatch: Some(mismatch(buf)) };
            }
            return Verdict::NoMatch;
        }
        // A buffer that ends exactly at the longest candidate may be a
        // corrupted frame; hold it until the next byte or a gap decides.
        match lengths.last() {
            Some(&longest) if longest >= buf.len() => Verdict::NeedMore,
            _ => Verdict::NoMatch,
        }
    }
}
