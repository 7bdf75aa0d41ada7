//! Recognized protocol frames

use std::fmt;
use std::sync::Arc;
use std::time::SystemTime;

use super::ByteRange;
use crate::detector::modbus::{self, ModbusSummary};

/// Protocol a frame was attributed to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ProtocolTag {
    ModbusRtu,
    Custom(String),
    Generic,
    Unknown,
}

impl fmt::Display for ProtocolTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProtocolTag::ModbusRtu => f.write_str("ModbusRTU"),
            ProtocolTag::Custom(name) => write!(f, "Custom:{}", name),
            ProtocolTag::Generic => f.write_str("Generic"),
            ProtocolTag::Unknown => f.write_str("Unknown"),
        }
    }
}

/// A complete unit extracted from the byte stream. Immutable once emitted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub protocol: ProtocolTag,

    /// Logical range of the raw bytes
    pub range: ByteRange,

    /// Raw frame bytes, including headers and checksums
    pub payload: Arc<[u8]>,

    /// Checksum outcome; `true` for protocols that define none
    pub valid: bool,

    pub detected_at: SystemTime,
}

impl Frame {
    pub fn new(protocol: ProtocolTag, start: u64, payload: Vec<u8>, valid: bool) -> Self {
        Self {
            protocol,
            range: ByteRange::at(start, payload.len()),
            payload: payload.into(),
            valid,
            detected_at: SystemTime::now(),
        }
    }

    /// Decode the Modbus RTU header of a `ModbusRTU` frame.
    pub fn modbus_summary(&self) -> Option<ModbusSummary> {
        match self.protocol {
            ProtocolTag::ModbusRtu => modbus::summarize(&self.payload),
            _ => None,
        }
    }
}
