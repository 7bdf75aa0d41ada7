//! Error types for the ingestion pipeline.
//!
//! Errors are grouped by the component that raises them and by how far they
//! are allowed to propagate:
//!
//! - **Connection Errors**: transport faults. They terminate only the affected
//!   connection, which moves to [`ConnectionState::Error`].
//! - **Frame Errors**: checksum mismatches and malformed headers. Never fatal;
//!   the detector resynchronises and keeps scanning.
//! - **Filter Errors**: rejected at registration time, previously active
//!   filters stay untouched.
//! - **Archive Errors**: cold storage failures. Logged and reported on the
//!   archive status channel, never through the append path.
//! - **Read Errors**: the requested range is no longer (or not yet) resident.
//!
//! ## Recovery
//!
//! ```rust
//! use serialscope::ConnectionError;
//!
//! let error = ConnectionError::PortUnavailable { port: "/dev/ttyUSB0".into(), reason: "busy".into() };
//! if error.is_retryable() {
//!     for suggestion in error.recovery_suggestions() {
//!         println!("  - {}", suggestion);
//!     }
//! }
//! ```
//!
//! The core never reconnects on its own: retrying means calling
//! `open_connection` again from outside.

use std::io;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

use crate::types::{ByteRange, ConnectionId, ConnectionState};

/// Result type alias for pipeline operations.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Transport and connection lifecycle errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum ConnectionError {
    #[error("Port {port} is unavailable: {reason}")]
    PortUnavailable { port: String, reason: String },

    #[error("Permission denied opening {port}")]
    PermissionDenied { port: String },

    #[error("Device behind {port} was removed: {reason}")]
    DeviceRemoved { port: String, reason: String },

    #[error("{operation} timed out after {duration:?}")]
    Timeout { operation: String, duration: Duration },

    #[error("Port {port} is already open as {id}")]
    AlreadyOpen { port: String, id: ConnectionId },

    #[error("Connection {id} is not open (state: {state})")]
    NotOpen { id: ConnectionId, state: Box<ConnectionState> },

    #[error("Unknown connection {0}")]
    UnknownConnection(ConnectionId),
}

impl ConnectionError {
    /// Classify an io error raised by a transport into the taxonomy.
    pub fn from_io(port: &str, err: &io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::PermissionDenied => {
                ConnectionError::PermissionDenied { port: port.to_string() }
            }
            io::ErrorKind::TimedOut => ConnectionError::Timeout {
                operation: format!("I/O on {}", port),
                duration: Duration::ZERO,
            },
            io::ErrorKind::BrokenPipe
            | io::ErrorKind::UnexpectedEof
            | io::ErrorKind::NotConnected
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted => ConnectionError::DeviceRemoved {
                port: port.to_string(),
                reason: err.to_string(),
            },
            io::ErrorKind::NotFound => ConnectionError::PortUnavailable {
                port: port.to_string(),
                reason: "no such device".to_string(),
            },
            _ => ConnectionError::PortUnavailable {
                port: port.to_string(),
                reason: err.to_string(),
            },
        }
    }

    /// Helper constructor for timeouts.
    pub fn timeout(operation: impl Into<String>, duration: Duration) -> Self {
        ConnectionError::Timeout { operation: operation.into(), duration }
    }

    /// Returns whether an explicit re-open may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            ConnectionError::PortUnavailable { .. } => true,
            ConnectionError::Timeout { .. } => true,
            ConnectionError::DeviceRemoved { .. } => true,
            ConnectionError::PermissionDenied { .. } => false,
            ConnectionError::AlreadyOpen { .. } => false,
            ConnectionError::NotOpen { .. } => false,
            ConnectionError::UnknownConnection(_) => false,
        }
    }

    /// Returns suggested recovery actions for this error.
    pub fn recovery_suggestions(&self) -> Vec<&'static str> {
        match self {
            ConnectionError::PortUnavailable { .. } => vec![
                "Check that the device is plugged in",
                "Close other programs holding the port",
                "Verify the port name",
            ],
            ConnectionError::PermissionDenied { .. } => vec![
                "Add the user to the dialout/uucp group",
                "Check device node permissions",
            ],
            ConnectionError::DeviceRemoved { .. } => {
                vec!["Reconnect the device", "Re-open the connection"]
            }
            ConnectionError::Timeout { .. } => vec![
                "Increase the configured timeout",
                "Check baud rate and flow control settings",
            ],
            ConnectionError::AlreadyOpen { .. } => {
                vec!["Close the existing connection first", "Reuse the existing connection id"]
            }
            ConnectionError::NotOpen { .. } => vec!["Open the connection before sending"],
            ConnectionError::UnknownConnection(_) => vec!["Use an id returned by open_connection"],
        }
    }
}

/// Frame-level errors. Both variants are non-fatal.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum FrameError {
    #[error("{protocol} checksum mismatch over {range}: expected {expected:#06x}, found {found:#06x}")]
    ChecksumMismatch { protocol: String, range: ByteRange, expected: u16, found: u16 },

    #[error("{protocol} malformed header at offset {offset}: {details}")]
    MalformedHeader { protocol: String, offset: u64, details: String },
}

/// Filter registration errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum FilterError {
    #[error("Invalid pattern for filter '{id}': {details}")]
    InvalidPattern { id: String, details: String },

    #[error("Unsupported filter mode '{mode}'{}", for_filter(.id))]
    UnsupportedMode { id: Option<String>, mode: String },
}

fn for_filter(id: &Option<String>) -> String {
    id.as_deref().map(|id| format!(" for filter '{}'", id)).unwrap_or_default()
}

/// Cold storage errors. Always non-fatal to the live pipeline.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum ArchiveError {
    #[error("Archive write failed for {connection} {range}: {reason}")]
    WriteFailed { connection: ConnectionId, range: ByteRange, reason: String },

    #[error("Archive unavailable: {reason}")]
    Unavailable { reason: String },
}

/// Outcome of reading a logical range that is not resident in memory.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum ReadError {
    #[error("Range {range} was evicted and is not archived")]
    RangeEvicted { range: ByteRange },

    #[error("Range {} is archived", .0.range)]
    RangeArchived(crate::buffer::ArchiveHandle),

    #[error("Range {range} extends past the received stream (next offset {next_offset})")]
    NotYetReceived { range: ByteRange, next_offset: u64 },
}

/// Configuration loading errors.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum ConfigError {
    #[error("Failed to read config file {path}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Failed to parse YAML config")]
    Yaml(#[from] serde_yaml_ng::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),

    #[error("Invalid filter in configuration")]
    Filter(#[from] FilterError),
}

/// Umbrella error for the public API.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum Error {
    #[error(transparent)]
    Connection(#[from] ConnectionError),

    #[error(transparent)]
    Frame(#[from] FrameError),

    #[error(transparent)]
    Filter(#[from] FilterError),

    #[error(transparent)]
    Archive(#[from] ArchiveError),

    #[error(transparent)]
    Read(#[from] ReadError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn io_errors_are_classified() {
        let denied = io::Error::new(io::ErrorKind::PermissionDenied, "nope");
        assert!(matches!(
            ConnectionError::from_io("COM3", &denied),
            ConnectionError::PermissionDenied { .. }
        ));

        let gone = io::Error::new(io::ErrorKind::BrokenPipe, "unplugged");
        assert!(matches!(
            ConnectionError::from_io("COM3", &gone),
            ConnectionError::DeviceRemoved { .. }
        ));

        let missing = io::Error::new(io::ErrorKind::NotFound, "missing");
        assert!(matches!(
            ConnectionError::from_io("COM3", &missing),
            ConnectionError::PortUnavailable { .. }
        ));

        let slow = io::Error::new(io::ErrorKind::TimedOut, "slow");
        assert!(matches!(ConnectionError::from_io("COM3", &slow), ConnectionError::Timeout { .. }));
    }

    #[test]
    fn only_transient_faults_are_retryable() {
        assert!(ConnectionError::timeout("connect", Duration::from_secs(1)).is_retryable());
        assert!(!ConnectionError::PermissionDenied { port: "COM1".into() }.is_retryable());
        assert!(
            !ConnectionError::AlreadyOpen { port: "COM1".into(), id: ConnectionId::new(1) }
                .is_retryable()
        );
    }

    #[test]
    fn umbrella_error_wraps_components() {
        let err: Error = FilterError::InvalidPattern { id: "f".into(), details: "bad".into() }.into();
        assert!(matches!(err, Error::Filter(_)));
        assert!(err.to_string().contains("bad"));
    }

    proptest! {
        #[test]
        fn error_messages_carry_their_context(
            port in "[A-Za-z0-9/]{1,16}",
            reason in "[a-z ]{1,32}",
            offset in 0u64..1_000_000,
        ) {
            let unavailable = ConnectionError::PortUnavailable { port: port.clone(), reason: reason.clone() };
            let msg = unavailable.to_string();
            prop_assert!(msg.contains(&port));
            prop_assert!(msg.contains(&reason));

            let malformed = FrameError::MalformedHeader {
                protocol: "Custom:x".into(),
                offset,
                details: reason.clone(),
            };
            prop_assert!(malformed.to_string().contains(&offset.to_string()));

            prop_assert!(!unavailable.recovery_suggestions().is_empty());
        }
    }
}
