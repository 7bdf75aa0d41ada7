//! Pattern compilation.
//!
//! Every pattern kind is lowered to a `regex::bytes::Regex` so one search
//! routine serves literals, hex byte patterns and user regexes alike.

use regex::bytes::{Regex, RegexBuilder};
use std::fmt::Write as _;
use std::sync::Arc;
use std::time::SystemTime;

use crate::config::{DEFAULT_MAX_MATCH_LEN, FilterSpec, PatternSpec};
use crate::error::FilterError;
use crate::types::{ByteRange, FilterMode, MatchEvent};

const REGEX_SIZE_LIMIT: usize = 1 << 20;

/// How long a match of a pattern can be.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchWidth {
    /// Every match has exactly this many bytes
    Fixed(usize),
    /// Matches are at most this long; longer matches may be missed across
    /// chunk boundaries
    Bounded(usize),
}

impl MatchWidth {
    pub fn max(self) -> usize {
        match self {
            MatchWidth::Fixed(n) | MatchWidth::Bounded(n) => n,
        }
    }

    /// First index of a `len`-byte window at which a match could still
    /// change once more bytes arrive.
    ///
    /// A fixed-width match is complete as soon as its last byte is present.
    /// A bounded match also needs the byte after it, for `\b` and `$`.
    pub fn open_from(self, len: usize) -> usize {
        match self {
            MatchWidth::Fixed(n) => len.saturating_sub(n.saturating_sub(1)),
            MatchWidth::Bounded(n) => len.saturating_sub(n),
        }
    }
}

/// A validated, ready-to-run filter.
#[derive(Debug, Clone)]
pub struct CompiledFilter {
    id: Arc<str>,
    mode: FilterMode,
    regex: Regex,
    width: MatchWidth,
    spec: FilterSpec,
}

impl CompiledFilter {
    /// Compile a filter definition, rejecting anything that cannot run.
    pub fn compile(spec: &FilterSpec) -> Result<Self, FilterError> {
        let invalid = |details: String| FilterError::InvalidPattern { id: spec.id.clone(), details };

        if spec.id.is_empty() {
            return Err(invalid("filter id must not be empty".into()));
        }
        if spec.max_match_len == Some(0) {
            return Err(invalid("max_match_len must be non-zero".into()));
        }

        let (regex, width) = match &spec.pattern {
            PatternSpec::Literal { text, case_insensitive } => {
                if text.is_empty() {
                    return Err(invalid("literal must not be empty".into()));
                }
                // ASCII folding keeps match length equal to the literal length
                let ascii = text.is_ascii();
                let regex = RegexBuilder::new(&regex::escape(text))
                    .case_insensitive(*case_insensitive)
                    .unicode(!ascii)
                    .size_limit(REGEX_SIZE_LIMIT)
                    .build()
                    .map_err(|e| invalid(e.to_string()))?;
                let width = if *case_insensitive && !ascii {
                    MatchWidth::Bounded(text.chars().count() * 4)
                } else {
                    MatchWidth::Fixed(text.len())
                };
                (regex, width)
            }
            PatternSpec::Bytes { bytes } => {
                if bytes.is_empty() {
                    return Err(invalid("byte pattern must not be empty".into()));
                }
                let mut expr = String::with_capacity(bytes.len() * 4);
                for b in bytes {
                    let _ = write!(expr, "\\x{:02X}", b);
                }
                (build_bytes(&expr).map_err(invalid)?, MatchWidth::Fixed(bytes.len()))
            }
            PatternSpec::Hex { pattern } => {
                let (expr, len) = hex_to_regex(pattern).map_err(invalid)?;
                (build_bytes(&expr).map_err(invalid)?, MatchWidth::Fixed(len))
            }
            PatternSpec::Regex { expr } => {
                let regex = RegexBuilder::new(expr)
                    .size_limit(REGEX_SIZE_LIMIT)
                    .build()
                    .map_err(|e| invalid(e.to_string()))?;
                let width = MatchWidth::Bounded(spec.max_match_len.unwrap_or(DEFAULT_MAX_MATCH_LEN));
                (regex, width)
            }
        };

        Ok(Self { id: spec.id.as_str().into(), mode: spec.mode, regex, width, spec: spec.clone() })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn mode(&self) -> FilterMode {
        self.mode
    }

    pub fn width(&self) -> MatchWidth {
        self.width
    }

    pub fn spec(&self) -> &FilterSpec {
        &self.spec
    }

    /// Leftmost non-empty match starting at or after `from`.
    pub(crate) fn find_at(&self, haystack: &[u8], mut from: usize) -> Option<(usize, usize)> {
        while from <= haystack.len() {
            let m = self.regex.find_at(haystack, from)?;
            if m.start() < m.end() {
                return Some((m.start(), m.end()));
            }
            from = m.end() + 1;
        }
        None
    }

    pub(crate) fn event(&self, base: u64, bytes: &[u8], timestamp: SystemTime) -> MatchEvent {
        MatchEvent {
            filter_id: Arc::clone(&self.id),
            mode: self.mode,
            range: ByteRange::at(base, bytes.len()),
            bytes: bytes.into(),
            timestamp,
        }
    }

    /// Every non-overlapping match in `haystack`, which starts at logical
    /// offset `base`.
    pub fn find_all(&self, base: u64, haystack: &[u8], timestamp: SystemTime) -> Vec<MatchEvent> {
        let mut out = Vec::new();
        let mut pos = 0;
        while let Some((start, end)) = self.find_at(haystack, pos) {
            out.push(self.event(base + start as u64, &haystack[start..end], timestamp));
            pos = end;
        }
        out
    }
}

fn build_bytes(expr: &str) -> Result<Regex, String> {
    RegexBuilder::new(expr)
        .unicode(false)
        .dot_matches_new_line(true)
        .size_limit(REGEX_SIZE_LIMIT)
        .build()
        .map_err(|e| e.to_string())
}

fn nibble(c: char) -> Result<Option<u8>, String> {
    match c {
        '?' | 'x' | 'X' => Ok(None),
        _ => c
            .to_digit(16)
            .map(|d| Some(d as u8))
            .ok_or_else(|| format!("'{}' is not a hex digit or wildcard", c)),
    }
}

/// Translate `"01 03 ?? 0?"` style patterns into a byte regex.
///
/// Whitespace is ignored. `?` (or `x`) stands for any nibble. Returns the
/// expression and the number of bytes it matches.
pub(crate) fn hex_to_regex(pattern: &str) -> Result<(String, usize), String> {
    let digits: Vec<char> = pattern.chars().filter(|c| !c.is_whitespace()).collect();
    if digits.is_empty() {
        return Err("hex pattern must not be empty".into());
    }
    if digits.len() % 2 != 0 {
        return Err(format!("hex pattern has an odd number of nibbles ({})", digits.len()));
    }

    let mut expr = String::new();
    for pair in digits.chunks(2) {
        match (nibble(pair[0])?, nibble(pair[1])?) {
            (Some(hi), Some(lo)) => {
                let _ = write!(expr, "\\x{:02X}", (hi << 4) | lo);
            }
            (Some(hi), None) => {
                let _ = write!(expr, "[\\x{:02X}-\\x{:02X}]", hi << 4, (hi << 4) | 0x0F);
            }
            (None, Some(lo)) => {
                expr.push('[');
                for hi in 0..16u8 {
                    let _ = write!(expr, "\\x{:02X}", (hi << 4) | lo);
                }
                expr.push(']');
            }
            (None, None) => expr.push('.'),
        }
    }
    Ok((expr, digits.len() / 2))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn matches(spec: FilterSpec, haystack: &[u8]) -> Vec<(u64, Vec<u8>)> {
        let filter = CompiledFilter::compile(&spec).unwrap();
        filter
            .find_all(0, haystack, SystemTime::now())
            .into_iter()
            .map(|m| (m.range.start, m.bytes.to_vec()))
            .collect()
    }

    #[test]
    fn literal_matches_are_non_overlapping() {
        let found = matches(FilterSpec::literal("aa", "aa"), b"aaaaa");
        assert_eq!(found, vec![(0, b"aa".to_vec()), (2, b"aa".to_vec())]);
    }

    #[test]
    fn literal_escapes_regex_syntax() {
        let found = matches(FilterSpec::literal("p", "a.b"), b"axb a.b");
        assert_eq!(found, vec![(4, b"a.b".to_vec())]);
    }

    #[test]
    fn case_insensitive_literal() {
        let spec = FilterSpec::new(
            "err",
            PatternSpec::Literal { text: "error".into(), case_insensitive: true },
        );
        let filter = CompiledFilter::compile(&spec).unwrap();
        assert_eq!(filter.width(), MatchWidth::Fixed(5));
        assert_eq!(filter.find_all(10, b"an ERROR here", SystemTime::now())[0].range, ByteRange::new(13, 18));
    }

    #[test]
    fn hex_wildcards_match_nibbles() {
        let found = matches(FilterSpec::hex("h", "01 ?3 0? ??"), &[0x01, 0xA3, 0x0F, 0xFF, 0x01, 0x13]);
        assert_eq!(found, vec![(0, vec![0x01, 0xA3, 0x0F, 0xFF])]);

        let none = matches(FilterSpec::hex("h", "01 ?3"), &[0x01, 0x34]);
        assert!(none.is_empty());
    }

    #[test]
    fn hex_wildcard_matches_newline_bytes() {
        let found = matches(FilterSpec::hex("h", "AA ?? BB"), &[0xAA, b'\n', 0xBB]);
        assert_eq!(found.len(), 1);
    }

    #[test]
    fn malformed_patterns_are_rejected() {
        for spec in [
            FilterSpec::hex("odd", "0"),
            FilterSpec::hex("bad", "ZZ"),
            FilterSpec::regex("re", "(unclosed"),
            FilterSpec::literal("empty", ""),
        ] {
            assert!(
                matches!(CompiledFilter::compile(&spec), Err(FilterError::InvalidPattern { .. })),
                "{:?} should be rejected",
                spec
            );
        }
    }

    #[test]
    fn empty_regex_matches_are_skipped() {
        let found = matches(FilterSpec::regex("digits", "[0-9]*"), b"ab12c3");
        assert_eq!(found, vec![(2, b"12".to_vec()), (5, b"3".to_vec())]);
    }
}
