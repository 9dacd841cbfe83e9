//! The per-turn choice of speech backend.

use crate::audio::sink::{AudioChunkSink, PlaybackState};
use crate::pipeline::messages::SentenceUnit;
use crate::pipeline::queue::SentenceQueue;
use crate::tts::fallback::SpeechSynthesisFallback;
use std::sync::Arc;
use tracing::debug;

/// Where a turn's sentences are spoken. Exactly one variant per turn.
#[derive(Debug, Clone)]
pub enum SpeechPath {
    /// Remote synthesis, serialized by the queue into the turn's sink.
    Remote {
        queue: Arc<SentenceQueue>,
        sink: AudioChunkSink,
    },
    /// Platform speech on this machine.
    OnDevice(Arc<SpeechSynthesisFallback>),
}

impl SpeechPath {
    pub fn is_remote(&self) -> bool {
        matches!(self, Self::Remote { .. })
    }

    /// Hand a completed sentence to the backend. Blank sentences are skipped.
    pub fn speak(&self, unit: SentenceUnit) {
        if unit.speakable().is_empty() {
            debug!(sequence = unit.sequence, "skipping blank sentence");
            return;
        }
        match self {
            Self::Remote { queue, .. } => queue.enqueue(unit),
            Self::OnDevice(fallback) => fallback.speak(&unit.text),
        }
    }

    /// Wait for every sentence to be spoken.
    ///
    /// On the remote path this drains the queue, closes the sink and waits
    /// for playback to end; the final playback state is returned.
    pub async fn finish(&self) -> Option<PlaybackState> {
        match self {
            Self::Remote { queue, sink } => {
                queue.drained().await;
                sink.close();
                Some(sink.wait_terminal().await)
            }
            Self::OnDevice(fallback) => {
                fallback.idle().await;
                None
            }
        }
    }

    /// Abandon everything still queued or playing.
    pub fn stop(&self) {
        match self {
            Self::Remote { queue, sink } => {
                queue.stop_all();
                sink.stop();
            }
            Self::OnDevice(fallback) => fallback.stop_all(),
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

    use super::*;
    use crate::audio::memory::MemoryOutput;
    use crate::error::Result;
    use crate::tts::fallback::Utterer;
    use crate::tts::worker::{FirstAudioSignal, SentenceAudioWorker};
    use crate::tts::{AudioByteStream, SpeechSynthesizer};
    use async_trait::async_trait;
    use bytes::Bytes;
    use std::sync::Mutex;
    use std::time::Duration;

    struct EchoSynth;

    #[async_trait]
    impl SpeechSynthesizer for EchoSynth {
        async fn synthesize(&self, text: &str) -> Result<Option<AudioByteStream>> {
            let body = Bytes::from(text.to_owned());
            Ok(Some(Box::pin(futures_util::stream::iter(vec![Ok(body)]))))
        }
    }

    #[derive(Default)]
    struct Transcript(Mutex<Vec<String>>);

    #[async_trait]
    impl Utterer for Transcript {
        async fn utter(&self, text: &str) -> Result<()> {
            self.0.lock().unwrap().push(text.to_owned());
            Ok(())
        }
    }

    fn remote(output: &MemoryOutput) -> SpeechPath {
        let sink = AudioChunkSink::new(Arc::new(output.clone()), 4096);
        let worker = SentenceAudioWorker::new(
            Arc::new(EchoSynth),
            sink.clone(),
            FirstAudioSignal::noop(),
            Duration::from_secs(15),
        );
        SpeechPath::Remote {
            queue: Arc::new(SentenceQueue::new(worker)),
            sink,
        }
    }

    fn unit(text: &str, sequence: u64) -> SentenceUnit {
        SentenceUnit {
            text: text.to_owned(),
            sequence,
        }
    }

    #[tokio::test]
    async fn remote_path_plays_and_ends() {
        let output = MemoryOutput::new();
        let path = remote(&output);
        assert!(path.is_remote());
        path.speak(unit("It is three o'clock.", 0));
        path.speak(unit("  ", 1));
        assert_eq!(path.finish().await, Some(PlaybackState::Ended));

        let stream = output.last_stream().unwrap();
        assert_eq!(stream.bytes(), b"It is three o'clock.");
        assert!(stream.started && stream.finished);
    }

    #[tokio::test]
    async fn remote_path_without_sentences_ends_silently() {
        let output = MemoryOutput::new();
        let path = remote(&output);
        assert_eq!(path.finish().await, Some(PlaybackState::Ended));
        assert!(output.streams().is_empty());
    }

    #[tokio::test]
    async fn on_device_path_never_touches_the_sink() {
        let transcript = Arc::new(Transcript::default());
        let path = SpeechPath::OnDevice(Arc::new(SpeechSynthesisFallback::new(transcript.clone())));
        assert!(!path.is_remote());
        path.speak(unit("Hello there.", 0));
        path.speak(unit(" How are you?", 1));
        assert_eq!(path.finish().await, None);
        assert_eq!(
            transcript.0.lock().unwrap().as_slice(),
            ["Hello there.", "How are you?"]
        );
    }

    #[tokio::test]
    async fn stop_releases_remote_resources() {
        let output = MemoryOutput::new();
        let path = remote(&output);
        path.speak(unit("It is three o'clock.", 0));
        path.stop();
        if let SpeechPath::Remote { sink, queue } = &path {
            assert_eq!(sink.state(), PlaybackState::Ended);
            assert_eq!(queue.pending(), 0);
        }
    }
}
