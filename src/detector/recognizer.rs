//! Recognizer registry.

use std::time::Duration;

use super::custom::{LengthPrefixed, MarkerFraming};
use super::generic::GenericFraming;
use super::modbus::ModbusRtu;
use crate::config::{RecognizerKind, RecognizerSpec};
use crate::error::ConfigError;
use crate::types::ProtocolTag;

/// What a recognizer makes of the bytes at the head of the pending buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Verdict {
    /// A frame of `len` bytes. `mismatch` holds `(expected, found)` when the
    /// checksum disagrees.
    Complete { len: usize, mismatch: Option<(u16, u16)> },
    /// Could still become a frame
    NeedMore,
    /// Not this protocol
    NoMatch,
    /// Looks like this protocol but the header is unusable
    Malformed(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Framing {
    ModbusRtu(ModbusRtu),
    Markers(MarkerFraming),
    LengthPrefixed(LengthPrefixed),
    Generic(GenericFraming),
}

/// One registered recognizer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Recognizer {
    name: String,
    priority: i32,
    quiet: Option<Duration>,
    tag: ProtocolTag,
    framing: Framing,
}

impl Recognizer {
    pub fn from_spec(spec: &RecognizerSpec) -> Result<Self, ConfigError> {
        spec.validate()?;
        let (tag, framing) = match &spec.kind {
            RecognizerKind::ModbusRtu { unit } => {
                (ProtocolTag::ModbusRtu, Framing::ModbusRtu(ModbusRtu::new(*unit)))
            }
            RecognizerKind::Markers { start, end, checksum, max_length } => (
                ProtocolTag::Custom(spec.name.clone()),
                Framing::Markers(MarkerFraming {
                    start: start.clone(),
                    end: end.clone(),
                    checksum: *checksum,
                    max_length: *max_length,
                }),
            ),
            RecognizerKind::LengthPrefixed { sync, width, big_endian, checksum, max_payload } => (
                ProtocolTag::Custom(spec.name.clone()),
                Framing::LengthPrefixed(LengthPrefixed {
                    sync: sync.clone(),
                    width: *width,
                    big_endian: *big_endian,
                    checksum: *checksum,
                    max_payload: *max_payload,
                }),
            ),
            RecognizerKind::Generic { delimiter, max_length } => (
                ProtocolTag::Generic,
                Framing::Generic(GenericFraming {
                    delimiter: delimiter.clone(),
                    max_length: *max_length,
                }),
            ),
        };
        Ok(Self { name: spec.name.clone(), priority: spec.priority, quiet: spec.quiet(), tag, framing })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn priority(&self) -> i32 {
        self.priority
    }

    pub fn tag(&self) -> &ProtocolTag {
        &self.tag
    }

    /// Generic framing only guesses frame ends, so it yields to framed
    /// protocols at the same position.
    pub fn is_heuristic(&self) -> bool {
        matches!(self.framing, Framing::Generic(_))
    }

    pub(crate) fn examine(&self, buf: &[u8], closing: bool) -> Verdict {
        match &self.framing {
            Framing::ModbusRtu(f) => f.examine(buf, closing),
            Framing::Markers(f) => f.examine(buf, closing),
            Framing::LengthPrefixed(f) => f.examine(buf, closing),
            Framing::Generic(f) => f.examine(buf, closing),
        }
    }
}

/// Ordered set of recognizers, highest priority first.
///
/// Equal priorities keep registration order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecognizerRegistry {
    recognizers: Vec<Recognizer>,
}

impl RecognizerRegistry {
    pub fn from_specs(specs: &[RecognizerSpec]) -> Result<Self, ConfigError> {
        let mut recognizers =
            specs.iter().map(Recognizer::from_spec).collect::<Result<Vec<_>, _>>()?;
        // Stable sort keeps registration order among equals
        recognizers.sort_by_key(|r| std::cmp::Reverse(r.priority));
        Ok(Self { recognizers })
    }

    pub fn iter(&self) -> impl Iterator<Item = &Recognizer> {
        self.recognizers.iter()
    }

    pub fn len(&self) -> usize {
        self.recognizers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.recognizers.is_empty()
    }

    /// Shortest inactivity gap among the registered recognizers.
    pub fn quiet(&self) -> Option<Duration> {
        self.recognizers.iter().filter_map(|r| r.quiet).min()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_orders_by_priority_then_registration() {
        let specs = vec![
            RecognizerSpec::generic_lines(0),
            RecognizerSpec::new("first", 5, RecognizerKind::ModbusRtu { unit: None }),
            RecognizerSpec::new("second", 5, RecognizerKind::ModbusRtu { unit: Some(2) }),
            RecognizerSpec::modbus_rtu(9),
        ];
        let registry = RecognizerRegistry::from_specs(&specs).unwrap();
        let names: Vec<_> = registry.iter().map(Recognizer::name).collect();
        assert_eq!(names, vec!["modbus", "first", "second", "lines"]);
        assert_eq!(registry.quiet(), Some(Duration::from_millis(100)));
    }

    #[test]
    fn custom_framings_are_tagged_by_name() {
        let spec = RecognizerSpec::new(
            "stx",
            1,
            RecognizerKind::Markers { start: vec![2], end: vec![3], checksum: None, max_length: 32 },
        );
        let recognizer = Recognizer::from_spec(&spec).unwrap();
        assert_eq!(recognizer.tag().to_string(), "Custom:stx");
    }

    #[test]
    fn invalid_specs_are_rejected() {
        let spec = RecognizerSpec::new(
            "bad",
            0,
            RecognizerKind::Generic { delimiter: Some(Vec::new()), max_length: 10 },
        );
        assert!(RecognizerRegistry::from_specs(&[spec]).is_err());
    }
}
