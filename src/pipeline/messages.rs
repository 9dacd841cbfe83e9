//! Message types passed between pipeline stages.

use std::time::Duration;

/// A complete sentence extracted from the streaming answer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentenceUnit {
    /// Exact answer text of this sentence, surrounding whitespace included.
    pub text: String,
    /// Position in the answer, starting at 0.
    pub sequence: u64,
}

impl SentenceUnit {
    /// Text to hand to a speech backend.
    pub fn speakable(&self) -> &str {
        self.text.trim()
    }
}

/// Result of one sentence's trip through a speech backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SentenceOutcome {
    /// Audio was produced and handed to the sink.
    Spoken {
        bytes: usize,
        /// Time from request to first audio byte.
        first_byte: Duration,
    },
    /// The backend had nothing to say (204/404/empty body, blank text).
    NoAudio,
    /// Transport or backend failure; the sentence stays silent.
    Failed(String),
    /// The bounded wait for this sentence expired.
    TimedOut,
}
