//! Error types for the focus-voice pipeline.

/// Top-level error type for the spoken-response pipeline.
#[derive(Debug, thiserror::Error)]
pub enum FocusError {
    /// Transport-level HTTP failure (connect, TLS, body read).
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// The backend answered with a status the caller cannot use.
    #[error("unexpected status {status} from {endpoint}")]
    Status {
        /// Endpoint path that was called.
        endpoint: String,
        /// HTTP status code returned.
        status: u16,
    },

    /// A response payload could not be decoded.
    #[error("decode error: {0}")]
    Decode(String),

    /// Speech-to-text failed or produced nothing usable.
    #[error("transcription error: {0}")]
    Transcription(String),

    /// The answer stream could not be opened or broke mid-way.
    #[error("answer stream error: {0}")]
    Stream(String),

    /// Per-sentence speech synthesis failed.
    #[error("synthesis error: {0}")]
    Synthesis(String),

    /// Turn, session or audio persistence failed.
    #[error("persistence error: {0}")]
    Persistence(String),

    /// Audio device or sink error.
    #[error("playback error: {0}")]
    Playback(String),

    /// Configuration error.
    #[error("config error: {0}")]
    Config(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Convenience result type.
pub type Result<T> = std::result::Result<T, FocusError>;

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

    use super::*;

    #[test]
    fn status_display_names_endpoint() {
        let err = FocusError::Status {
            endpoint: "/tts_stream".into(),
            status: 502,
        };
        assert_eq!(err.to_string(), "unexpected status 502 from /tts_stream");
    }
}
