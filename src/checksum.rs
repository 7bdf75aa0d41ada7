//! Checksums used by the bundled recognizers.
//!
//! Modbus RTU uses CRC-16/MODBUS transmitted low byte first. Custom framings
//! may pick any [`ChecksumKind`].

use serde::{Deserialize, Serialize};

/// Checksum algorithm appended to a custom frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChecksumKind {
    /// XOR of all bytes (parity byte)
    Xor8,
    /// Modulo-256 sum
    Sum8,
    /// CRC-16/MODBUS, little-endian on the wire
    Crc16Modbus,
    /// CRC-16/CCITT-FALSE, big-endian on the wire
    Crc16Ccitt,
}

impl ChecksumKind {
    /// Number of checksum bytes on the wire.
    pub fn width(self) -> usize {
        match self {
            ChecksumKind::Xor8 | ChecksumKind::Sum8 => 1,
            ChecksumKind::Crc16Modbus | ChecksumKind::Crc16Ccitt => 2,
        }
    }

    /// Compute the checksum over `data`.
    pub fn compute(self, data: &[u8]) -> u16 {
        match self {
            ChecksumKind::Xor8 => xor8(data) as u16,
            ChecksumKind::Sum8 => sum8(data) as u16,
            ChecksumKind::Crc16Modbus => crc16_modbus(data),
            ChecksumKind::Crc16Ccitt => crc16_ccitt(data),
        }
    }

    /// Read the transmitted checksum from its wire bytes.
    ///
    /// Returns `None` if `wire` is not exactly [`width`](Self::width) bytes.
    pub fn read(self, wire: &[u8]) -> Option<u16> {
        if wire.len() != self.width() {
            return None;
        }
        Some(match self {
            ChecksumKind::Xor8 | ChecksumKind::Sum8 => wire[0] as u16,
            ChecksumKind::Crc16Modbus => u16::from_le_bytes([wire[0], wire[1]]),
            ChecksumKind::Crc16Ccitt => u16::from_be_bytes([wire[0], wire[1]]),
        })
    }

    /// Encode a checksum value the way it is transmitted.
    pub fn encode(self, value: u16) -> Vec<u8> {
        match self {
            ChecksumKind::Xor8 | ChecksumKind::Sum8 => vec![value as u8],
            ChecksumKind::Crc16Modbus => value.to_le_bytes().to_vec(),
            ChecksumKind::Crc16Ccitt => value.to_be_bytes().to_vec(),
        }
    }
}

/// XOR of all bytes.
pub fn xor8(data: &[u8]) -> u8 {
    data.iter().fold(0, |acc, &b| acc ^ b)
}

/// Modulo-256 sum of all bytes.
pub fn sum8(data: &[u8]) -> u8 {
    data.iter().fold(0u8, |acc, &b| acc.wrapping_add(b))
}

/// CRC-16/MODBUS: polynomial 0x8005 reflected (0xA001), init 0xFFFF.
pub fn crc16_modbus(data: &[u8]) -> u16 {
    let mut crc: u16 = 0xFFFF;
    for &byte in data {
        crc ^= byte as u16;
        for _ in 0..8 {
            if crc & 0x0001 != 0 {
                crc = (crc >> 1) ^ 0xA001;
            } else {
                crc >>= 1;
            }
        }
    }
    crc
}

/// CRC-16/CCITT-FALSE: polynomial 0x1021, init 0xFFFF, not reflected.
pub fn crc16_ccitt(data: &[u8]) -> u16 {
    let mut crc: u16 = 0xFFFF;
    for &byte in data {
        crc ^= (byte as u16) << 8;
        for _ in 0..8 {
            if crc & 0x8000 != 0 {
                crc = (crc << 1) ^ 0x1021;
            } else {
                crc <<= 1;
            }
        }
    }
    crc
}

/// Append a CRC-16/MODBUS (low byte first) to `data`.
pub fn append_modbus_crc(data: &[u8]) -> Vec<u8> {
    let mut framed = Vec::with_capacity(data.len() + 2);
    framed.extend_from_slice(data);
    framed.extend_from_slice(&crc16_modbus(data).to_le_bytes());
    framed
}
