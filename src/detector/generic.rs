//! Delimiter and quiet-gap framing for plain serial traffic.

use super::recognizer::Verdict;

/// Frames end at a delimiter (kept in the frame), at `max_length`, or when
/// the line goes quiet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenericFraming {
    pub delimiter: Option<Vec<u8>>,
    pub max_length: usize,
}

impl GenericFraming {
    pub(crate) fn examine(&self, buf: &[u8], closing: bool) -> Verdict {
        if buf.is_empty() {
            return Verdict::NoMatch;
        }
        let window = &buf[..buf.len().min(self.max_length)];
        if let Some(delimiter) = &self.delimiter
            && let Some(at) = window.windows(delimiter.len()).position(|w| w == delimiter.as_slice())
        {
            return Verdict::Complete { len: at + delimiter.len(), mismatch: None };
        }
        if buf.len() >= self.max_length {
            Verdict::Complete { len: self.max_length, mismatch: None }
        } else if closing {
            Verdict::Complete { len: buf.len(), mismatch: None }
        } else {
            Verdict::NeedMore
        }
    }
}
