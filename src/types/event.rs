//! Event feed types

use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::SystemTime;

use super::{ByteRange, Frame};
use crate::error::{ConnectionError, FilterError, FrameError};

/// Presentation hint carried by a filter. Modes never remove bytes from the
/// store; every match is reported regardless of mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum FilterMode {
    #[default]
    Highlight,
    IncludeOnly,
    Exclude,
}

impl FilterMode {
    /// Parse a mode name on behalf of filter `id`.
    pub fn parse_for(id: &str, name: &str) -> Result<Self, FilterError> {
        name.parse::<Self>().map_err(|_| FilterError::UnsupportedMode {
            id: Some(id.to_string()),
            mode: name.to_string(),
        })
    }

    pub fn as_str(self) -> &'static str {
        match self {
            FilterMode::Highlight => "highlight",
            FilterMode::IncludeOnly => "include",
            FilterMode::Exclude => "exclude",
        }
    }
}

impl FromStr for FilterMode {
    type Err = FilterError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "highlight" => Ok(FilterMode::Highlight),
            "include" | "include_only" | "include-only" => Ok(FilterMode::IncludeOnly),
            "exclude" => Ok(FilterMode::Exclude),
            _ => Err(FilterError::UnsupportedMode { id: None, mode: s.to_string() }),
        }
    }
}

impl TryFrom<String> for FilterMode {
    type Error = FilterError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<FilterMode> for String {
    fn from(mode: FilterMode) -> Self {
        mode.as_str().to_string()
    }
}

/// One filter hit in the logical stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MatchEvent {
    pub filter_id: Arc<str>,
    pub mode: FilterMode,
    pub range: ByteRange,
    pub bytes: Arc<[u8]>,
    pub timestamp: SystemTime,
}

impl MatchEvent {
    /// Matched bytes decoded as text, replacing invalid UTF-8.
    pub fn text(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.bytes)
    }
}

/// Lifecycle state of a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Open,
    Error(ConnectionError),
    Closed,
}

impl ConnectionState {
    /// Whether no further events will follow this state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, ConnectionState::Error(_) | ConnectionState::Closed)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Connecting => f.write_str("connecting"),
            ConnectionState::Open => f.write_str("open"),
            ConnectionState::Error(e) => write!(f, "error: {}", e),
            ConnectionState::Closed => f.write_str("closed"),
        }
    }
}

/// Ordered per-connection event feed item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    ByteChunkArrived { seq: u64, range: ByteRange, timestamp: SystemTime },
    FrameDetected(Frame),
    MatchFound(MatchEvent),
    FrameError(FrameError),
    StateChanged(ConnectionState),
    /// The subscriber fell behind and `missed` events were dropped for it.
    Lagged { missed: u64 },
}
