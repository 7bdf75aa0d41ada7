//! Frame detection over the live byte stream.
//!
//! The [`FrameDetector`] is a per-connection state machine fed one chunk at
//! a time. Frame boundaries may fall anywhere, including across chunks.
//!
//! ## Resolution
//!
//! Every registered recognizer is tried at the head of the pending bytes,
//! in priority order. Framed protocols (Modbus RTU, marker and
//! length-prefixed framings) race first: the valid candidate that ends
//! earliest wins, ties going to the earlier entry in the registry. While a
//! framed recognizer still needs bytes the detector waits. A framed
//! candidate with a bad checksum is emitted as `valid = false` together with
//! a [`FrameError::ChecksumMismatch`] only when nothing better is possible.
//! Generic recognizers are consulted last.
//!
//! Bytes no recognizer claims accumulate as an `Unknown` frame, which is
//! emitted before the next recognized frame, once it reaches the residue
//! limit, at a quiet gap, or when the stream ends. Every ingested byte ends
//! up in exactly one emitted frame or is still pending.
//!
//! ## Timing
//!
//! [`FrameDetector::deadline`] reports when the shortest configured quiet gap
//! expires. The pipeline calls [`FrameDetector::expire`] at that instant,
//! which closes partial frames as if the stream had ended.

mod custom;
mod generic;
pub mod modbus;
mod recognizer;

pub use custom::{LengthPrefixed, MarkerFraming};
pub use generic::GenericFraming;
pub use modbus::{ModbusRtu, ModbusSummary};
pub use recognizer::{Recognizer, RecognizerRegistry};

use recognizer::Verdict;
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use crate::error::FrameError;
use crate::types::{ByteChunk, ByteRange, Frame, ProtocolTag};

/// Where the detector is in the frame it is currently working on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DetectorState {
    /// No partial frame
    Idle,
    /// A recognizer claimed the bytes from `since` and is waiting for more
    Accumulating { candidate: ProtocolTag, since: u64 },
    /// Checking a complete candidate
    Validating,
}

/// Output of the detector, in stream order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DetectorEvent {
    Frame(Frame),
    Error(FrameError),
}

#[derive(Default)]
struct Candidates {
    valid: Option<(usize, usize)>,
    invalid: Option<(usize, usize, (u16, u16))>,
    waiting: Option<usize>,
}

impl Candidates {
    fn offer(&mut self, idx: usize, verdict: &Verdict) {
        match *verdict {
            Verdict::Complete { len, mismatch: None } => {
                if self.valid.is_none_or(|(_, best)| len < best) {
                    self.valid = Some((idx, len));
                }
            }
            Verdict::Complete { len, mismatch: Some(m) } => {
                if self.invalid.is_none_or(|(_, best, _)| len < best) {
                    self.invalid = Some((idx, len, m));
                }
            }
            Verdict::NeedMore => {
                self.waiting.get_or_insert(idx);
            }
            Verdict::NoMatch | Verdict::Malformed(_) => {}
        }
    }
}

enum Decision {
    Emit { idx: usize, len: usize, mismatch: Option<(u16, u16)> },
    Wait(usize),
    Skip,
}

/// Streaming frame detector for one connection.
#[derive(Debug)]
pub struct FrameDetector {
    registry: Arc<RecognizerRegistry>,
    staged: Option<Arc<RecognizerRegistry>>,
    state: DetectorState,
    /// Unclaimed bytes, emitted as an `Unknown` frame
    residue: Vec<u8>,
    residue_start: u64,
    /// Bytes under consideration, directly after the residue
    pending: Vec<u8>,
    max_residue: usize,
    last_arrival: Option<Instant>,
    /// Recognizers that already reported a malformed header at a position
    malformed: Option<(u64, Vec<usize>)>,
}

impl FrameDetector {
    /// Create a detector whose first byte will be at logical offset `start`.
    pub fn new(registry: Arc<RecognizerRegistry>, start: u64, max_residue: usize) -> Self {
        Self {
            registry,
            staged: None,
            state: DetectorState::Idle,
            residue: Vec::new(),
            residue_start: start,
            pending: Vec::new(),
            max_residue: max_residue.max(1),
            last_arrival: None,
            malformed: None,
        }
    }

    pub fn state(&self) -> &DetectorState {
        &self.state
    }

    pub fn registry(&self) -> &Arc<RecognizerRegistry> {
        &self.registry
    }

    fn pending_start(&self) -> u64 {
        self.residue_start + self.residue.len() as u64
    }

    /// Logical range of bytes not yet emitted in any frame.
    pub fn unresolved(&self) -> ByteRange {
        ByteRange::at(self.residue_start, self.residue.len() + self.pending.len())
    }

    /// Replace the recognizer registry once no frame is in progress.
    pub fn stage_registry(&mut self, registry: Arc<RecognizerRegistry>) {
        self.staged = Some(registry);
        self.apply_staged();
    }

    fn apply_staged(&mut self) {
        if self.pending.is_empty()
            && let Some(registry) = self.staged.take()
        {
            debug!(recognizers = registry.len(), "Recognizer registry swapped");
            self.registry = registry;
            self.malformed = None;
        }
    }

    /// Feed the next chunk of the stream.
    pub fn feed(&mut self, chunk: &ByteChunk, now: Instant) -> Vec<DetectorEvent> {
        let mut out = Vec::new();
        if chunk.is_empty() {
            return out;
        }
        debug_assert_eq!(chunk.offset, self.pending_start() + self.pending.len() as u64);

        self.apply_staged();
        self.pending.extend_from_slice(&chunk.data);
        self.last_arrival = Some(now);
        self.resolve(false, &mut out);
        out
    }

    /// When the quiet gap of the current partial data expires.
    pub fn deadline(&self) -> Option<Instant> {
        if self.pending.is_empty() && self.residue.is_empty() {
            return None;
        }
        Some(self.last_arrival? + self.registry.quiet()?)
    }

    /// Close partial frames if the quiet gap has elapsed at `now`.
    pub fn expire(&mut self, now: Instant) -> Vec<DetectorEvent> {
        match self.deadline() {
            Some(deadline) if now >= deadline => {
                trace!(range = %self.unresolved(), "Quiet gap elapsed");
                self.finish()
            }
            _ => Vec::new(),
        }
    }

    /// Resolve everything pending as if the stream ended here.
    ///
    /// Incomplete frames come out as `Generic` when a generic recognizer
    /// takes them, otherwise as `Unknown`.
    pub fn finish(&mut self) -> Vec<DetectorEvent> {
        let mut out = Vec::new();
        self.resolve(true, &mut out);
        self.flush_residue(&mut out);
        self.state = DetectorState::Idle;
        self.apply_staged();
        out
    }

    /// Drop all pending bytes without emitting them. Used by forced close.
    pub fn discard(&mut self) -> ByteRange {
        let dropped = self.unresolved();
        self.residue_start = dropped.end;
        self.residue.clear();
        self.pending.clear();
        self.state = DetectorState::Idle;
        self.apply_staged();
        dropped
    }

    fn resolve(&mut self, closing: bool, out: &mut Vec<DetectorEvent>) {
        let registry = Arc::clone(&self.registry);
        loop {
            if self.pending.is_empty() {
                self.state = DetectorState::Idle;
                self.apply_staged();
                break;
            }

            let head = self.pending_start();
            let mut framed = Candidates::default();
            let mut fallback = Candidates::default();
            for (idx, recognizer) in registry.iter().enumerate() {
                let verdict = recognizer.examine(&self.pending, closing);
                if let Verdict::Malformed(details) = &verdict {
                    self.report_malformed(idx, recognizer, head, details, out);
                }
                if recognizer.is_heuristic() {
                    fallback.offer(idx, &verdict);
                } else {
                    framed.offer(idx, &verdict);
                }
            }

            let decision = if let Some((idx, len)) = framed.valid {
                Decision::Emit { idx, len, mismatch: None }
            } else if let Some(idx) = framed.waiting {
                Decision::Wait(idx)
            } else if let Some((idx, len, mismatch)) = framed.invalid {
                Decision::Emit { idx, len, mismatch: Some(mismatch) }
            } else if let Some((idx, len)) = fallback.valid {
                Decision::Emit { idx, len, mismatch: None }
            } else if let Some(idx) = fallback.waiting {
                Decision::Wait(idx)
            } else {
                Decision::Skip
            };

            match decision {
                Decision::Emit { idx, len, mismatch } => {
                    self.state = DetectorState::Validating;
                    if let Some(recognizer) = registry.iter().nth(idx) {
                        self.emit(recognizer, len, mismatch, out);
                    }
                }
                Decision::Wait(idx) => {
                    let candidate = registry
                        .iter()
                        .nth(idx)
                        .map_or(ProtocolTag::Unknown, |r| r.tag().clone());
                    self.state = DetectorState::Accumulating { candidate, since: head };
                    break;
                }
                Decision::Skip => self.skip_byte(out),
            }
        }
    }

    fn report_malformed(
        &mut self,
        idx: usize,
        recognizer: &Recognizer,
        offset: u64,
        details: &str,
        out: &mut Vec<DetectorEvent>,
    ) {
        if self.malformed.as_ref().is_none_or(|(at, _)| *at != offset) {
            self.malformed = Some((offset, Vec::new()));
        }
        let Some((_, seen)) = self.malformed.as_mut() else { return };
        if seen.contains(&idx) {
            return;
        }
        seen.push(idx);

        debug!(recognizer = recognizer.name(), offset, "Malformed header: {}", details);
        out.push(DetectorEvent::Error(FrameError::MalformedHeader {
            protocol: recognizer.tag().to_string(),
            offset,
            details: details.to_string(),
        }));
    }

    fn emit(
        &mut self,
        recognizer: &Recognizer,
        len: usize,
        mismatch: Option<(u16, u16)>,
        out: &mut Vec<DetectorEvent>,
    ) {
        self.flush_residue(out);
        let bytes: Vec<u8> = self.pending.drain(..len).collect();
        let frame = Frame::new(recognizer.tag().clone(), self.residue_start, bytes, mismatch.is_none());
        self.residue_start += len as u64;
        let range = frame.range;
        out.push(DetectorEvent::Frame(frame));

        if let Some((expected, found)) = mismatch {
            warn!(protocol = %recognizer.tag(), %range, "Checksum mismatch");
            out.push(DetectorEvent::Error(FrameError::ChecksumMismatch {
                protocol: recognizer.tag().to_string(),
                range,
                expected,
                found,
            }));
        } else {
            trace!(protocol = %recognizer.tag(), %range, "Frame detected");
        }
    }

    fn skip_byte(&mut self, out: &mut Vec<DetectorEvent>) {
        let byte = self.pending.remove(0);
        self.residue.push(byte);
        if self.residue.len() >= self.max_residue {
            self.flush_residue(out);
        }
    }

    fn flush_residue(&mut self, out: &mut Vec<DetectorEvent>) {
        if self.residue.is_empty() {
            return;
        }
        let bytes = std::mem::take(&mut self.residue);
        let len = bytes.len();
        let frame = Frame::new(ProtocolTag::Unknown, self.residue_start, bytes, false);
        trace!(range = %frame.range, "Unrecognized bytes");
        self.residue_start += len as u64;
        out.push(DetectorEvent::Frame(frame));
    }
}
