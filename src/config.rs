//! Configuration records.
//!
//! Everything here is plain data: serde-deserializable, loadable from YAML,
//! and validated once before a connection is opened.
//!
//! ```rust
//! use serialscope::config::ConnectionConfig;
//!
//! let config = ConnectionConfig::from_yaml_str(r#"
//! port: /dev/ttyUSB0
//! settings:
//!   baud_rate: 19200
//!   parity: even
//! buffer:
//!   ceiling_bytes: 65536
//! detector:
//!   recognizers:
//!     - name: modbus
//!       priority: 10
//!       kind: modbus_rtu
//! filters:
//!   - id: errors
//!     type: literal
//!     text: ERROR
//!     mode: highlight
//! "#).unwrap();
//!
//! assert_eq!(config.settings.baud_rate, 19200);
//! assert_eq!(config.buffer.effective_ceiling(), 65536);
//! ```

use serde::{Deserialize, Serialize};
use serde_yaml_ng::Value;
use std::path::Path;
use std::time::Duration;

use crate::checksum::ChecksumKind;
use crate::error::ConfigError;
use crate::types::FilterMode;

/// Ring buffer ceiling used when a connection does not set one.
pub const DEFAULT_CEILING_BYTES: usize = 1024 * 1024;

/// Inactivity gap closing a generic frame when none is configured.
pub const DEFAULT_GENERIC_QUIET_MS: u64 = 100;

/// Longest regex match the filter engine looks back for across chunks.
pub const DEFAULT_MAX_MATCH_LEN: usize = 256;

/// Quiet time after which regex matches held back near the data tail are
/// released.
pub const DEFAULT_MATCH_FLUSH_MS: u64 = 100;

/// Residue bytes held before they are flushed as an `Unknown` frame.
pub const DEFAULT_MAX_RESIDUE: usize = 256;

fn read_file(path: &Path) -> Result<String, ConfigError> {
    std::fs::read_to_string(path)
        .map_err(|source| ConfigError::Io { path: path.to_path_buf(), source })
}

/// Orchestrator-wide timeouts and channel sizes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    pub connect_timeout_ms: u64,
    pub send_timeout_ms: u64,
    /// Grace period for draining on close before the pipeline is cancelled
    pub close_timeout_ms: u64,
    /// Broadcast capacity of each connection's event feed
    pub event_capacity: usize,
    pub command_capacity: usize,
    /// Pending archive writes per connection before new ones are dropped
    pub archive_queue: usize,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 5_000,
            send_timeout_ms: 2_000,
            close_timeout_ms: 1_000,
            event_capacity: 1024,
            command_capacity: 64,
            archive_queue: 256,
        }
    }
}

impl OrchestratorConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn send_timeout(&self) -> Duration {
        Duration::from_millis(self.send_timeout_ms)
    }

    pub fn close_timeout(&self) -> Duration {
        Duration::from_millis(self.close_timeout_ms)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.event_capacity == 0 || self.command_capacity == 0 || self.archive_queue == 0 {
            return Err(ConfigError::Invalid("channel capacities must be non-zero".into()));
        }
        Ok(())
    }

    pub fn from_yaml_str(yaml: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_yaml_ng::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        Self::from_yaml_str(&read_file(path.as_ref())?)
    }
}

/// Parity setting. Opaque to the core.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Parity {
    #[default]
    None,
    Even,
    Odd,
    Mark,
    Space,
}

/// Flow control setting. Opaque to the core.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlowControl {
    #[default]
    None,
    Software,
    Hardware,
}

/// Line parameters handed to the transport as-is.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SerialSettings {
    pub baud_rate: u32,
    pub data_bits: u8,
    pub stop_bits: u8,
    pub parity: Parity,
    pub flow_control: FlowControl,
}

impl Default for SerialSettings {
    fn default() -> Self {
        Self {
            baud_rate: 9600,
            data_bits: 8,
            stop_bits: 1,
            parity: Parity::None,
            flow_control: FlowControl::None,
        }
    }
}

/// Ring buffer limits.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BufferConfig {
    /// Resident byte ceiling; falls back to [`DEFAULT_CEILING_BYTES`]
    pub ceiling_bytes: Option<usize>,
    /// Send evicted ranges to the orchestrator's archive
    pub archive: bool,
}

impl BufferConfig {
    pub fn effective_ceiling(&self) -> usize {
        self.ceiling_bytes.unwrap_or(DEFAULT_CEILING_BYTES)
    }
}

/// Framing strategy of one recognizer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RecognizerKind {
    /// Modbus RTU, delimited by CRC-16
    ModbusRtu {
        /// Only recognise frames addressed to this unit
        #[serde(default)]
        unit: Option<u8>,
    },
    /// Start marker, payload, optional checksum, end marker (STX/ETX style)
    Markers {
        start: Vec<u8>,
        end: Vec<u8>,
        #[serde(default)]
        checksum: Option<ChecksumKind>,
        #[serde(default = "default_max_length")]
        max_length: usize,
    },
    /// Sync bytes, length field, payload, optional checksum
    LengthPrefixed {
        sync: Vec<u8>,
        #[serde(default = "default_width")]
        width: u8,
        #[serde(default)]
        big_endian: bool,
        #[serde(default)]
        checksum: Option<ChecksumKind>,
        #[serde(default = "default_max_length")]
        max_payload: usize,
    },
    /// Delimiter or quiet-gap framing for plain serial text
    Generic {
        #[serde(default)]
        delimiter: Option<Vec<u8>>,
        #[serde(default = "default_max_length")]
        max_length: usize,
    },
}

fn default_max_length() -> usize {
    1024
}

fn default_width() -> u8 {
    1
}

/// A recognizer registration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecognizerSpec {
    /// Used as the tag of custom framings (`Custom:<name>`)
    pub name: String,
    /// Higher wins ties; equal priorities fall back to registration order
    #[serde(default)]
    pub priority: i32,
    /// Inactivity gap after which a partial frame is closed
    #[serde(default)]
    pub quiet_ms: Option<u64>,
    #[serde(flatten)]
    pub kind: RecognizerKind,
}

impl RecognizerSpec {
    pub fn new(name: impl Into<String>, priority: i32, kind: RecognizerKind) -> Self {
        Self { name: name.into(), priority, quiet_ms: None, kind }
    }

    pub fn modbus_rtu(priority: i32) -> Self {
        Self::new("modbus", priority, RecognizerKind::ModbusRtu { unit: None })
    }

    pub fn generic_lines(priority: i32) -> Self {
        Self::new(
            "lines",
            priority,
            RecognizerKind::Generic { delimiter: Some(b"\n".to_vec()), max_length: 1024 },
        )
    }

    pub fn with_quiet(mut self, quiet: Duration) -> Self {
        self.quiet_ms = Some(quiet.as_millis() as u64);
        self
    }

    /// Effective inactivity gap, if this recognizer closes frames on silence.
    pub fn quiet(&self) -> Option<Duration> {
        match (&self.kind, self.quiet_ms) {
            (_, Some(ms)) => Some(Duration::from_millis(ms)),
            (RecognizerKind::Generic { .. }, None) => {
                Some(Duration::from_millis(DEFAULT_GENERIC_QUIET_MS))
            }
            _ => None,
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: &str| Err(ConfigError::Invalid(format!("{}: {}", self.name, msg)));
        match &self.kind {
            RecognizerKind::ModbusRtu { unit: Some(unit) } if *unit > 247 => {
                invalid("modbus unit must be 0..=247")
            }
            RecognizerKind::Markers { start, end, max_length, checksum } => {
                let overhead = start.len() + end.len() + checksum.map_or(0, |c| c.width());
                if start.is_empty() || end.is_empty() {
                    invalid("start and end markers must be non-empty")
                } else if *max_length <= overhead {
                    invalid("max_length must exceed marker and checksum overhead")
                } else {
                    Ok(())
                }
            }
            RecognizerKind::LengthPrefixed { sync, width, .. } => {
                if sync.is_empty() {
                    invalid("sync must be non-empty")
                } else if !matches!(width, 1 | 2) {
                    invalid("length width must be 1 or 2")
                } else {
                    Ok(())
                }
            }
            RecognizerKind::Generic { delimiter, max_length } => {
                if delimiter.as_ref().is_some_and(|d| d.is_empty()) {
                    invalid("delimiter must be non-empty when set")
                } else if *max_length == 0 {
                    invalid("max_length must be non-zero")
                } else {
                    Ok(())
                }
            }
            _ => Ok(()),
        }
    }
}

/// Frame detector setup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectorConfig {
    pub recognizers: Vec<RecognizerSpec>,
    pub max_residue: usize,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            recognizers: vec![RecognizerSpec::modbus_rtu(10), RecognizerSpec::generic_lines(0)],
            max_residue: DEFAULT_MAX_RESIDUE,
        }
    }
}

/// What a filter looks for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PatternSpec {
    /// Text literal
    Literal {
        text: String,
        #[serde(default)]
        case_insensitive: bool,
    },
    /// Raw byte literal
    Bytes { bytes: Vec<u8> },
    /// Hex bytes with `?` wildcard nibbles, e.g. `01 ?3 ?? FF`
    Hex { pattern: String },
    /// Regular expression over the stream decoded as text
    Regex { expr: String },
}

/// A filter registration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilterSpec {
    pub id: String,
    #[serde(flatten)]
    pub pattern: PatternSpec,
    #[serde(default)]
    pub mode: FilterMode,
    /// Upper bound on regex match length used for cross-chunk lookback
    #[serde(default)]
    pub max_match_len: Option<usize>,
}

impl FilterSpec {
    pub fn new(id: impl Into<String>, pattern: PatternSpec) -> Self {
        Self { id: id.into(), pattern, mode: FilterMode::Highlight, max_match_len: None }
    }

    pub fn literal(id: impl Into<String>, text: impl Into<String>) -> Self {
        Self::new(id, PatternSpec::Literal { text: text.into(), case_insensitive: false })
    }

    pub fn hex(id: impl Into<String>, pattern: impl Into<String>) -> Self {
        Self::new(id, PatternSpec::Hex { pattern: pattern.into() })
    }

    pub fn regex(id: impl Into<String>, expr: impl Into<String>) -> Self {
        Self::new(id, PatternSpec::Regex { expr: expr.into() })
    }

    pub fn with_mode(mut self, mode: FilterMode) -> Self {
        self.mode = mode;
        self
    }
}

/// Everything needed to open and run one connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionConfig {
    pub port: String,
    #[serde(default)]
    pub settings: SerialSettings,
    #[serde(default)]
    pub buffer: BufferConfig,
    #[serde(default)]
    pub detector: DetectorConfig,
    #[serde(default)]
    pub filters: Vec<FilterSpec>,
    #[serde(default = "default_match_flush_ms")]
    pub match_flush_ms: u64,
}

fn default_match_flush_ms() -> u64 {
    DEFAULT_MATCH_FLUSH_MS
}

impl ConnectionConfig {
    pub fn new(port: impl Into<String>) -> Self {
        Self {
            port: port.into(),
            settings: SerialSettings::default(),
            buffer: BufferConfig::default(),
            detector: DetectorConfig::default(),
            filters: Vec::new(),
            match_flush_ms: DEFAULT_MATCH_FLUSH_MS,
        }
    }

    pub fn match_flush(&self) -> Duration {
        Duration::from_millis(self.match_flush_ms)
    }

    pub fn with_ceiling(mut self, bytes: usize) -> Self {
        self.buffer.ceiling_bytes = Some(bytes);
        self
    }

    pub fn with_archive(mut self) -> Self {
        self.buffer.archive = true;
        self
    }

    pub fn with_recognizers(mut self, recognizers: Vec<RecognizerSpec>) -> Self {
        self.detector.recognizers = recognizers;
        self
    }

    pub fn with_filter(mut self, filter: FilterSpec) -> Self {
        self.filters.push(filter);
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.port.is_empty() {
            return Err(ConfigError::Invalid("port must be set".into()));
        }
        if self.buffer.ceiling_bytes == Some(0) {
            return Err(ConfigError::Invalid("ceiling_bytes must be non-zero".into()));
        }
        if self.detector.max_residue == 0 {
            return Err(ConfigError::Invalid("max_residue must be non-zero".into()));
        }
        if self.match_flush_ms == 0 {
            return Err(ConfigError::Invalid("match_flush_ms must be non-zero".into()));
        }
        for spec in &self.detector.recognizers {
            spec.validate()?;
        }
        Ok(())
    }

    pub fn from_yaml_str(yaml: &str) -> Result<Self, ConfigError> {
        let value: Value = serde_yaml_ng::from_str(yaml)?;
        check_filter_modes(&value)?;
        let config: Self = serde_yaml_ng::from_value(value)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        Self::from_yaml_str(&read_file(path.as_ref())?)
    }
}

/// A whole session file: orchestrator settings plus connections to open.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ScopeConfig {
    pub orchestrator: OrchestratorConfig,
    pub connections: Vec<ConnectionConfig>,
}

impl ScopeConfig {
    pub fn from_yaml_str(yaml: &str) -> Result<Self, ConfigError> {
        let value: Value = serde_yaml_ng::from_str(yaml)?;
        if let Some(connections) = value.get("connections").and_then(Value::as_sequence) {
            for connection in connections {
                check_filter_modes(connection)?;
            }
        }
        let config: Self = serde_yaml_ng::from_value(value)?;
        config.orchestrator.validate()?;
        for connection in &config.connections {
            connection.validate()?;
        }
        Ok(config)
    }

    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        Self::from_yaml_str(&read_file(path.as_ref())?)
    }
}

/// Reject unknown filter modes with the id of the filter that named them.
fn check_filter_modes(connection: &Value) -> Result<(), ConfigError> {
    let Some(filters) = connection.get("filters").and_then(Value::as_sequence) else {
        return Ok(());
    };
    for filter in filters {
        if let Some(mode) = filter.get("mode").and_then(Value::as_str) {
            let id = filter.get("id").and_then(Value::as_str).unwrap_or_default();
            FilterMode::parse_for(id, mode)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FilterError;
    use std::error::Error as _;

    #[test]
    fn unset_ceiling_is_bounded() {
        let config = BufferConfig::default();
        assert_eq!(config.effective_ceiling(), DEFAULT_CEILING_BYTES);
    }

    #[test]
    fn zero_ceiling_is_rejected() {
        let config = ConnectionConfig::new("COM1").with_ceiling(0);
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn recognizers_parse_from_yaml() {
        let config = ConnectionConfig::from_yaml_str(
            r#"
port: COM7
detector:
  recognizers:
    - name: stx
      priority: 5
      kind: markers
      start: [2]
      end: [3]
      checksum: xor8
    - name: sync
      kind: length_prefixed
      sync: [170, 85]
      width: 2
      big_endian: true
      checksum: crc16_ccitt
    - name: text
      quiet_ms: 20
      kind: generic
      delimiter: [13, 10]
"#,
        )
        .expect("valid config");

        let recognizers = &config.detector.recognizers;
        assert_eq!(recognizers.len(), 3);
        assert!(matches!(
            recognizers[0].kind,
            RecognizerKind::Markers { checksum: Some(ChecksumKind::Xor8), max_length: 1024, .. }
        ));
        assert_eq!(recognizers[1].priority, 0);
        assert_eq!(recognizers[2].quiet(), Some(Duration::from_millis(20)));
    }

    #[test]
    fn generic_recognizer_defaults_to_bounded_quiet_gap() {
        let spec = RecognizerSpec::generic_lines(0);
        assert_eq!(spec.quiet(), Some(Duration::from_millis(DEFAULT_GENERIC_QUIET_MS)));
        assert_eq!(RecognizerSpec::modbus_rtu(0).quiet(), None);
    }

    #[test]
    fn invalid_length_width_is_rejected() {
        let spec = RecognizerSpec::new(
            "bad",
            0,
            RecognizerKind::LengthPrefixed {
                sync: vec![0x7E],
                width: 3,
                big_endian: false,
                checksum: None,
                max_payload: 64,
            },
        );
        assert!(spec.validate().is_err());
    }

    #[test]
    fn unknown_filter_mode_names_the_filter() {
        let result = ConnectionConfig::from_yaml_str(
            r#"
port: COM1
filters:
  - id: ok
    type: literal
    text: y
    mode: include
  - id: f
    type: literal
    text: x
    mode: sparkle
"#,
        );
        match result {
            Err(ConfigError::Filter(FilterError::UnsupportedMode { id, mode })) => {
                assert_eq!(id.as_deref(), Some("f"));
                assert_eq!(mode, "sparkle");
            }
            other => panic!("expected UnsupportedMode, got {:?}", other),
        }
    }

    #[test]
    fn unknown_filter_mode_in_a_scope_file_names_the_filter() {
        let result = ScopeConfig::from_yaml_str(
            r#"
connections:
  - port: COM1
  - port: COM2
    filters:
      - id: blinker
        type: literal
        text: x
        mode: blink
"#,
        );
        let err = result.expect_err("mode must be rejected");
        assert!(matches!(
            &err,
            ConfigError::Filter(FilterError::UnsupportedMode { id: Some(id), .. }) if id == "blinker"
        ));
        assert!(err.source().is_some_and(|e| e.to_string().contains("for filter 'blinker'")));
    }

    #[test]
    fn scope_config_loads_orchestrator_and_connections() {
        let scope = ScopeConfig::from_yaml_str(
            r#"
orchestrator:
  send_timeout_ms: 250
connections:
  - port: COM1
  - port: COM2
    buffer:
      ceiling_bytes: 4096
      archive: true
"#,
        )
        .expect("valid scope");
        assert_eq!(scope.orchestrator.send_timeout(), Duration::from_millis(250));
        assert_eq!(scope.orchestrator.connect_timeout_ms, 5_000);
        assert_eq!(scope.connections.len(), 2);
        assert!(scope.connections[1].buffer.archive);
    }
}
