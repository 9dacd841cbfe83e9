//! Incremental sentence segmentation of streamed answer text.

use crate::pipeline::messages::SentenceUnit;

/// Default minimum sentence length in characters.
pub const DEFAULT_MIN_SENTENCE_CHARS: usize = 20;

/// Splits a growing text buffer into sentences as they complete.
///
/// A sentence ends at `.`, `!` or `?` followed by whitespace or the end of
/// the buffered text, but only once the candidate is at least
/// `min_chars` characters long; shorter candidates keep growing into the
/// next sentence. Nothing is trimmed, so every character fed in comes back
/// out exactly once across [`feed`](Self::feed) and [`flush`](Self::flush).
#[derive(Debug, Clone)]
pub struct SentenceSegmenter {
    remainder: String,
    min_chars: usize,
    next_sequence: u64,
}

impl Default for SentenceSegmenter {
    fn default() -> Self {
        Self::new(DEFAULT_MIN_SENTENCE_CHARS)
    }
}

impl SentenceSegmenter {
    pub fn new(min_chars: usize) -> Self {
        Self {
            remainder: String::new(),
            min_chars,
            next_sequence: 0,
        }
    }

    /// Append a delta and return every sentence it completed.
    pub fn feed(&mut self, delta: &str) -> Vec<SentenceUnit> {
        self.remainder.push_str(delta);
        let mut units = Vec::new();
        while let Some(end) = find_sentence_end(&self.remainder, self.min_chars) {
            let rest = self.remainder.split_off(end);
            let text = std::mem::replace(&mut self.remainder, rest);
            units.push(self.unit(text));
        }
        units
    }

    /// Return whatever is left as the final sentence.
    pub fn flush(&mut self) -> Option<SentenceUnit> {
        if self.remainder.is_empty() {
            return None;
        }
        let text = std::mem::take(&mut self.remainder);
        Some(self.unit(text))
    }

    /// Text buffered but not yet emitted.
    pub fn remainder(&self) -> &str {
        &self.remainder
    }

    fn unit(&mut self, text: String) -> SentenceUnit {
        let sequence = self.next_sequence;
        self.next_sequence += 1;
        SentenceUnit { text, sequence }
    }
}

/// Byte index just past the shortest qualifying sentence, if any.
fn find_sentence_end(text: &str, min_chars: usize) -> Option<usize> {
    let mut chars_seen = 0usize;
    for (i, c) in text.char_indices() {
        chars_seen += 1;
        if !matches!(c, '.' | '!' | '?') {
            continue;
        }
        let end = i + c.len_utf8();
        let rest = &text[end..];
        let at_boundary = rest.chars().next().is_none_or(char::is_whitespace);
        if at_boundary && chars_seen >= min_chars {
            return Some(end);
        }
    }
    None
}
