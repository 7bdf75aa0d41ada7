//! Incremental pattern search over the live stream.
//!
//! The [`FilterEngine`] sees every chunk exactly once and reports matches as
//! [`MatchEvent`]s, including matches that straddle chunk boundaries. Each
//! filter keeps a cursor at the first position whose outcome could still
//! change with more data, and the window keeps everything from one byte
//! before the lowest cursor. That is at most the longest pattern plus one
//! byte, and the extra byte gives `\b` its real left neighbour.
//!
//! Variable-length (regex) matches starting within `max_match_len` of the
//! end of the data seen so far are held back, since later bytes may extend
//! or replace them. Held matches are released once enough bytes follow, or
//! by [`FilterEngine::finish`] when the stream goes quiet or ends. Results
//! do not depend on where the stream was split into chunks.
//!
//! Filter sets are replaced atomically between chunks: unchanged filters
//! keep their cursor, new ones only see bytes that arrive afterwards.

mod pattern;

pub use pattern::{CompiledFilter, MatchWidth};

use std::sync::Arc;
use std::time::SystemTime;
use tracing::{debug, trace};

use crate::config::FilterSpec;
use crate::error::FilterError;
use crate::types::{ByteChunk, MatchEvent};

/// Immutable set of compiled filters, swapped as a whole.
#[derive(Debug, Clone, Default)]
pub struct FilterSet {
    filters: Vec<Arc<CompiledFilter>>,
}

impl FilterSet {
    /// Compile all specs. One bad filter rejects the whole set.
    pub fn compile(specs: &[FilterSpec]) -> Result<Self, FilterError> {
        let mut set = FilterSet::default();
        for spec in specs {
            set = set.with(CompiledFilter::compile(spec)?);
        }
        Ok(set)
    }

    /// Copy of this set with `filter` added, replacing any filter with the same id.
    pub fn with(&self, filter: CompiledFilter) -> Self {
        let mut filters = self.filters.clone();
        let filter = Arc::new(filter);
        match filters.iter_mut().find(|f| f.id() == filter.id()) {
            Some(slot) => *slot = filter,
            None => filters.push(filter),
        }
        Self { filters }
    }

    /// Copy of this set without the filter `id`.
    pub fn without(&self, id: &str) -> Self {
        Self { filters: self.filters.iter().filter(|f| f.id() != id).cloned().collect() }
    }

    pub fn contains(&self, id: &str) -> bool {
        self.filters.iter().any(|f| f.id() == id)
    }

    pub fn len(&self) -> usize {
        self.filters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.filters.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<CompiledFilter>> {
        self.filters.iter()
    }

    /// Bytes that must be kept from previous chunks.
    pub fn lookback(&self) -> usize {
        self.filters.iter().map(|f| f.width().max().saturating_sub(1)).max().unwrap_or(0)
    }
}

#[derive(Debug)]
struct ActiveFilter {
    filter: Arc<CompiledFilter>,
    /// Logical offset where the next search starts
    resume_at: u64,
    /// A match near the data tail is waiting for more bytes
    deferred: bool,
}

/// Streaming matcher for one connection.
#[derive(Debug)]
pub struct FilterEngine {
    filters: Vec<ActiveFilter>,
    window: Vec<u8>,
    window_start: u64,
}

impl FilterEngine {
    /// Start matching at logical offset `start`.
    pub fn new(set: &FilterSet, start: u64) -> Self {
        let filters = set
            .iter()
            .map(|f| ActiveFilter { filter: Arc::clone(f), resume_at: start, deferred: false })
            .collect();
        Self { filters, window: Vec::new(), window_start: start }
    }

    fn window_end(&self) -> u64 {
        self.window_start + self.window.len() as u64
    }

    /// Swap in a new filter set.
    ///
    /// Filters whose definition is unchanged keep their position; everything
    /// else starts at the current end of the stream.
    pub fn replace(&mut self, set: &FilterSet) {
        let end = self.window_end();
        let previous = std::mem::take(&mut self.filters);
        self.filters = set
            .iter()
            .map(|f| {
                match previous.iter().find(|p| p.filter.id() == f.id() && p.filter.spec() == f.spec())
                {
                    Some(p) => ActiveFilter {
                        filter: Arc::clone(f),
                        resume_at: p.resume_at,
                        deferred: p.deferred,
                    },
                    None => ActiveFilter { filter: Arc::clone(f), resume_at: end, deferred: false },
                }
            })
            .collect();
        self.trim();
        debug!(filters = self.filters.len(), lookback = set.lookback(), "Filter set replaced");
    }

    /// Scan a newly appended chunk.
    ///
    /// Chunks must be fed in stream order without gaps.
    pub fn scan(&mut self, chunk: &ByteChunk) -> Vec<MatchEvent> {
        if chunk.is_empty() {
            return Vec::new();
        }
        if self.filters.is_empty() {
            self.window.clear();
            self.window_start = chunk.range().end;
            return Vec::new();
        }

        debug_assert_eq!(chunk.offset, self.window_end());
        self.window.extend_from_slice(&chunk.data);
        let out = self.run(false, chunk.timestamp);
        self.trim();
        out
    }

    /// Whether a match is held back waiting for more bytes.
    pub fn has_deferred(&self) -> bool {
        self.filters.iter().any(|f| f.deferred)
    }

    /// Release matches held back for more data. Called when the stream goes
    /// quiet or ends.
    pub fn finish(&mut self) -> Vec<MatchEvent> {
        if !self.has_deferred() {
            return Vec::new();
        }
        let out = self.run(true, SystemTime::now());
        self.trim();
        out
    }

    fn run(&mut self, final_pass: bool, timestamp: SystemTime) -> Vec<MatchEvent> {
        let mut out = Vec::new();
        let base = self.window_start;
        let window = &self.window;

        for active in &mut self.filters {
            let filter = &active.filter;
            // Matches starting here or later may still change with more data
            let open = if final_pass { window.len() } else { filter.width().open_from(window.len()) };
            let mut pos = (active.resume_at.max(base) - base) as usize;
            active.deferred = false;

            while let Some((start, end)) = filter.find_at(window, pos) {
                if start >= open {
                    active.deferred = true;
                    trace!(filter = filter.id(), at = base + start as u64, "Deferring open match");
                    break;
                }
                out.push(filter.event(base + start as u64, &window[start..end], timestamp));
                pos = end;
            }
            active.resume_at = base + pos.max(open) as u64;
        }

        // Emit in stream order across filters
        out.sort_by_key(|m| (m.range.start, m.range.end));
        out
    }

    fn trim(&mut self) {
        // One byte before each cursor stays as look-behind context
        let keep_from = self
            .filters
            .iter()
            .map(|f| f.resume_at.saturating_sub(1))
            .min()
            .unwrap_or_else(|| self.window_end())
            .max(self.window_start);
        let drop = ((keep_from - self.window_start) as usize).min(self.window.len());
        if drop > 0 {
            self.window.drain(..drop);
            self.window_start += drop as u64;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PatternSpec;
    use crate::types::ByteRange;
    use proptest::prelude::*;

    fn feed(engine: &mut FilterEngine, parts: &[&[u8]]) -> Vec<MatchEvent> {
        let mut offset = engine.window_end();
        let mut out = Vec::new();
        for (seq, part) in parts.iter().enumerate() {
            let chunk = ByteChunk::new(seq as u64, offset, part.to_vec(), SystemTime::now());
            offset += part.len() as u64;
            out.extend(engine.scan(&chunk));
        }
        out
    }

    #[test]
    fn match_split_across_three_chunks_is_reported_once() {
        let set = FilterSet::compile(&[FilterSpec::literal("err", "ERROR")]).unwrap();
        let mut engine = FilterEngine::new(&set, 0);

        let found = feed(&mut engine, &[b"xxER", b"R", b"ORyy ERROR"]);
        let ranges: Vec<_> = found.iter().map(|m| m.range).collect();
        assert_eq!(ranges, vec![ByteRange::new(2, 7), ByteRange::new(10, 15)]);
        assert!(found.iter().all(|m| m.text() == "ERROR"));
    }

    #[test]
    fn window_is_bounded_by_longest_pattern() {
        let set = FilterSet::compile(&[
            FilterSpec::literal("a", "abc"),
            FilterSpec::hex("b", "01 02 03 04 05"),
        ])
        .unwrap();
        assert_eq!(set.lookback(), 4);
        let mut engine = FilterEngine::new(&set, 0);
        feed(&mut engine, &[&[0u8; 100]]);
        // Lookback plus one byte of left context
        assert_eq!(engine.window.len(), 5);
    }

    #[test]
    fn open_regex_match_waits_for_more_data() {
        let spec = FilterSpec { max_match_len: Some(4), ..FilterSpec::regex("num", "[0-9]+") };
        let set = FilterSet::compile(&[spec]).unwrap();
        let mut engine = FilterEngine::new(&set, 0);

        assert!(feed(&mut engine, &[b"id=12"]).is_empty());
        assert!(engine.has_deferred());
        let second = feed(&mut engine, &[b"34; next"]);
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].text(), "1234");
        assert_eq!(second[0].range, ByteRange::new(3, 7));
        assert!(!engine.has_deferred());
    }

    fn scan_to_end(set: &FilterSet, parts: &[&[u8]]) -> Vec<(String, u64, u64)> {
        let mut engine = FilterEngine::new(set, 0);
        let mut found = feed(&mut engine, parts);
        found.extend(engine.finish());
        found.iter().map(|m| (m.text().into_owned(), m.range.start, m.range.end)).collect()
    }

    #[test]
    fn alternation_is_not_settled_before_the_longer_branch_arrives() {
        let set = FilterSet::compile(&[FilterSpec::regex("e", "ERROR|ERR")]).unwrap();

        let whole = scan_to_end(&set, &[b"xx ERROR yy"]);
        assert_eq!(whole, vec![("ERROR".to_string(), 3, 8)]);
        assert_eq!(scan_to_end(&set, &[b"xx ERRO", b"R yy"]), whole);
        assert_eq!(scan_to_end(&set, &[b"xx ERR", b"O", b"R yy"]), whole);
    }

    #[test]
    fn word_boundary_sees_bytes_before_the_window() {
        let spec = FilterSpec { max_match_len: Some(3), ..FilterSpec::regex("w", r"\bERR") };
        let set = FilterSet::compile(&[spec]).unwrap();

        // The cursor lands on 'E' and everything before 'x' is trimmed
        assert!(scan_to_end(&set, &[b"aaaaxE", b"RR"]).is_empty());
        assert!(scan_to_end(&set, &[b"aaaaxERR"]).is_empty());
        assert_eq!(scan_to_end(&set, &[b"aaaa E", b"RR"]), vec![("ERR".to_string(), 5, 8)]);

        let mut long = b"xERR".to_vec();
        long.extend(std::iter::repeat_n(b'b', 252));
        assert!(scan_to_end(&set, &[&long, b"c"]).is_empty());
    }

    #[test]
    fn finish_releases_deferred_matches() {
        let set = FilterSet::compile(&[FilterSpec::regex("num", "[0-9]+")]).unwrap();
        let mut engine = FilterEngine::new(&set, 0);
        assert!(feed(&mut engine, &[b"v=99"]).is_empty());
        let released = engine.finish();
        assert_eq!(released.len(), 1);
        assert_eq!(released[0].text(), "99");
        assert!(engine.finish().is_empty());
    }

    #[test]
    fn replaced_filters_start_at_stream_end() {
        let keep = FilterSpec::literal("keep", "AB");
        let set = FilterSet::compile(&[keep.clone()]).unwrap();
        let mut engine = FilterEngine::new(&set, 0);
        assert!(feed(&mut engine, &[b"xA"]).is_empty());

        let next = set.with(CompiledFilter::compile(&FilterSpec::literal("new", "AB")).unwrap());
        engine.replace(&next);
        let found = feed(&mut engine, &[b"B AB"]);

        let keep_hits: Vec<_> =
            found.iter().filter(|m| &*m.filter_id == "keep").map(|m| m.range).collect();
        let new_hits: Vec<_> =
            found.iter().filter(|m| &*m.filter_id == "new").map(|m| m.range).collect();
        assert_eq!(keep_hits, vec![ByteRange::new(1, 3), ByteRange::new(4, 6)]);
        assert_eq!(new_hits, vec![ByteRange::new(4, 6)]);
    }

    #[test]
    fn removing_a_filter_stops_its_matches() {
        let set = FilterSet::compile(&[
            FilterSpec::literal("a", "A"),
            FilterSpec::new("b", PatternSpec::Bytes { bytes: vec![b'B'] }),
        ])
        .unwrap();
        let mut engine = FilterEngine::new(&set, 0);
        engine.replace(&set.without("a"));
        let found = feed(&mut engine, &[b"AB"]);
        assert_eq!(found.len(), 1);
        assert_eq!(&*found[0].filter_id, "b");
    }

    proptest! {
        #[test]
        fn chunking_does_not_change_fixed_width_matches(
            data in prop::collection::vec(prop::sample::select(vec![b'E', b'R', b'O', b'x']), 0..200),
            cuts in prop::collection::vec(0usize..200, 0..12),
        ) {
            let set = FilterSet::compile(&[
                FilterSpec::literal("err", "ERROR"),
                FilterSpec::hex("rr", "52 52"),
            ]).unwrap();

            let mut whole = FilterEngine::new(&set, 0);
            let expected = feed(&mut whole, &[&data]);

            let mut cuts: Vec<usize> = cuts.into_iter().map(|c| c.min(data.len())).collect();
            cuts.sort_unstable();
            let mut parts: Vec<&[u8]> = Vec::new();
            let mut prev = 0;
            for cut in cuts.into_iter().chain(std::iter::once(data.len())) {
                parts.push(&data[prev..cut]);
                prev = cut;
            }
            let mut split = FilterEngine::new(&set, 0);
            let actual = feed(&mut split, &parts);

            let key = |m: &MatchEvent| (m.filter_id.to_string(), m.range.start, m.range.end);
            let mut expected: Vec<_> = expected.iter().map(key).collect();
            let mut actual: Vec<_> = actual.iter().map(key).collect();
            expected.sort();
            actual.sort();
            prop_assert_eq!(expected, actual);
        }

        #[test]
        fn chunking_does_not_change_regex_matches(
            data in prop::collection::vec(prop::sample::select(vec![b'E', b'R', b'O', b'x', b' ']), 0..120),
            cuts in prop::collection::vec(0usize..120, 0..10),
        ) {
            let bounded = |id: &str, expr: &str| FilterSpec { max_match_len: Some(8), ..FilterSpec::regex(id, expr) };
            let set = FilterSet::compile(&[
                bounded("alt", "ERROR|ERR"),
                bounded("word", r"\bRO?\b"),
            ]).unwrap();

            let mut cuts: Vec<usize> = cuts.into_iter().map(|c| c.min(data.len())).collect();
            cuts.sort_unstable();
            let mut parts: Vec<&[u8]> = Vec::new();
            let mut prev = 0;
            for cut in cuts.into_iter().chain(std::iter::once(data.len())) {
                parts.push(&data[prev..cut]);
                prev = cut;
            }

            let mut expected = scan_to_end(&set, &[&data]);
            let mut actual = scan_to_end(&set, &parts);
            expected.sort();
            actual.sort();
            prop_assert_eq!(expected, actual);
        }
    }
}
