//! User-configured framings: marker-delimited and length-prefixed.

use super::recognizer::Verdict;
use crate::checksum::ChecksumKind;

/// Outcome of matching a fixed prefix against the start of the buffer.
enum Prefix {
    Matches,
    Partial,
    Differs,
}

fn match_prefix(buf: &[u8], prefix: &[u8]) -> Prefix {
    if buf.len() >= prefix.len() {
        if &buf[..prefix.len()] == prefix { Prefix::Matches } else { Prefix::Differs }
    } else if prefix.starts_with(buf) {
        Prefix::Partial
    } else {
        Prefix::Differs
    }
}

fn verify(checksum: Option<ChecksumKind>, covered: &[u8], wire: &[u8]) -> Option<(u16, u16)> {
    let kind = checksum?;
    let expected = kind.compute(covered);
    let found = kind.read(wire)?;
    (expected != found).then_some((expected, found))
}

/// `start | payload | checksum? | end`, STX/ETX style.
///
/// The checksum covers the payload only and sits right before the end marker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MarkerFraming {
    pub start: Vec<u8>,
    pub end: Vec<u8>,
    pub checksum: Option<ChecksumKind>,
    pub max_length: usize,
}

impl MarkerFraming {
    pub(crate) fn examine(&self, buf: &[u8], closing: bool) -> Verdict {
        match match_prefix(buf, &self.start) {
            Prefix::Differs => return Verdict::NoMatch,
            Prefix::Partial if closing => return Verdict::NoMatch,
            Prefix::Partial => return Verdict::NeedMore,
            Prefix::Matches => {}
        }

        let ck = self.checksum.map_or(0, ChecksumKind::width);
        let body_from = self.start.len() + ck;
        let limit = buf.len().min(self.max_length);
        let end_at = (body_from..=limit.saturating_sub(self.end.len()))
            .find(|&i| buf[i..].starts_with(&self.end));

        match end_at {
            Some(i) => {
                let payload = &buf[self.start.len()..i - ck];
                let wire = &buf[i - ck..i];
                Verdict::Complete { len: i + self.end.len(), mismatch: verify(self.checksum, payload, wire) }
            }
            None if buf.len() >= self.max_length => {
                Verdict::Malformed(format!("no end marker within {} bytes", self.max_length))
            }
            None if closing => Verdict::Malformed("frame truncated before end marker".into()),
            None => Verdict::NeedMore,
        }
    }
}

/// `sync | length | payload | checksum?`
///
/// The length field counts payload bytes only. The checksum covers the
/// length field and the payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LengthPrefixed {
    pub sync: Vec<u8>,
    pub width: u8,
    pub big_endian: bool,
    pub checksum: Option<ChecksumKind>,
    pub max_payload: usize,
}

impl LengthPrefixed {
    fn declared_length(&self, field: &[u8]) -> usize {
        match (field, self.big_endian) {
            ([b], _) => *b as usize,
            ([hi, lo], true) => u16::from_be_bytes([*hi, *lo]) as usize,
            ([lo, hi], false) => u16::from_le_bytes([*lo, *hi]) as usize,
            _ => 0,
        }
    }

    pub(crate) fn examine(&self, buf: &[u8], closing: bool) -> Verdict {
        match match_prefix(buf, &self.sync) {
            Prefix::Differs => return Verdict::NoMatch,
            Prefix::Partial if closing => return Verdict::NoMatch,
            Prefix::Partial => return Verdict::NeedMore,
            Prefix::Matches => {}
        }

        let header = self.sync.len() + self.width as usize;
        if buf.len() < header {
            return if closing { Verdict::NoMatch } else { Verdict::NeedMore };
        }
        let length = self.declared_length(&buf[self.sync.len()..header]);
        if length > self.max_payload {
            return Verdict::Malformed(format!(
                "declared length {} exceeds maximum {}",
                length, self.max_payload
            ));
        }

        let ck = self.checksum.map_or(0, ChecksumKind::width);
        let total = header + length + ck;
        if buf.len() < total {
            return if closing {
                Verdict::Malformed(format!("frame truncated at {} of {} bytes", buf.len(), total))
            } else {
                Verdict::NeedMore
            };
        }

        let covered = &buf[self.sync.len()..header + length];
        let wire = &buf[header + length..total];
        Verdict::Complete { len: total, mismatch: verify(self.checksum, covered, wire) }
    }
}
