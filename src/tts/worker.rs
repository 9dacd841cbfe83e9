//! Per-sentence remote synthesis into the turn's audio sink.

use crate::audio::sink::AudioChunkSink;
use crate::error::Result;
use crate::pipeline::messages::{SentenceOutcome, SentenceUnit};
use crate::runtime::{RuntimeEvent, emit};
use crate::tts::SpeechSynthesizer;
use futures_util::StreamExt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Fires a callback exactly once, on the first real audio byte of a turn.
#[derive(Clone)]
pub struct FirstAudioSignal {
    fired: Arc<AtomicBool>,
    on_first: Arc<dyn Fn() + Send + Sync>,
}

impl std::fmt::Debug for FirstAudioSignal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FirstAudioSignal")
            .field("fired", &self.has_fired())
            .finish()
    }
}

impl FirstAudioSignal {
    pub fn new(on_first: impl Fn() + Send + Sync + 'static) -> Self {
        Self {
            fired: Arc::new(AtomicBool::new(false)),
            on_first: Arc::new(on_first),
        }
    }

    pub fn noop() -> Self {
        Self::new(|| {})
    }

    /// Run the callback if this is the first call. Returns whether it ran.
    pub fn fire(&self) -> bool {
        if self.fired.swap(true, Ordering::SeqCst) {
            return false;
        }
        (self.on_first)();
        true
    }

    pub fn has_fired(&self) -> bool {
        self.fired.load(Ordering::SeqCst)
    }
}

/// Fetches one sentence's audio and streams it into the sink.
#[derive(Clone)]
pub struct SentenceAudioWorker {
    synthesizer: Arc<dyn SpeechSynthesizer>,
    sink: AudioChunkSink,
    first_audio: FirstAudioSignal,
    timeout: Duration,
    events: Option<broadcast::Sender<RuntimeEvent>>,
}

impl SentenceAudioWorker {
    pub fn new(
        synthesizer: Arc<dyn SpeechSynthesizer>,
        sink: AudioChunkSink,
        first_audio: FirstAudioSignal,
        timeout: Duration,
    ) -> Self {
        Self {
            synthesizer,
            sink,
            first_audio,
            timeout,
            events: None,
        }
    }

    pub fn with_events(mut self, events: broadcast::Sender<RuntimeEvent>) -> Self {
        self.events = Some(events);
        self
    }

    /// Synthesize `unit` and append its audio, bounded by the sentence timeout.
    ///
    /// Never fails: every problem becomes a [`SentenceOutcome`] so the
    /// caller can move on to the next sentence.
    pub async fn run(&self, unit: &SentenceUnit) -> SentenceOutcome {
        let text = unit.speakable();
        if text.is_empty() {
            return SentenceOutcome::NoAudio;
        }

        let started = Instant::now();
        let outcome = match tokio::time::timeout(
            self.timeout,
            self.fetch_and_append(unit.sequence, text, started),
        )
        .await
        {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(e)) => {
                warn!(sequence = unit.sequence, "sentence synthesis failed: {e}");
                SentenceOutcome::Failed(e.to_string())
            }
            Err(_) => {
                warn!(
                    sequence = unit.sequence,
                    timeout_ms = self.timeout.as_millis() as u64,
                    "sentence synthesis timed out"
                );
                SentenceOutcome::TimedOut
            }
        };

        emit(
            &self.events,
            RuntimeEvent::SentenceAudio {
                sequence: unit.sequence,
                outcome: outcome.clone(),
            },
        );
        outcome
    }

    async fn fetch_and_append(
        &self,
        sequence: u64,
        text: &str,
        started: Instant,
    ) -> Result<SentenceOutcome> {
        let Some(mut stream) = self.synthesizer.synthesize(text).await? else {
            debug!(sequence, "no audio for sentence");
            return Ok(SentenceOutcome::NoAudio);
        };

        let mut bytes = 0usize;
        let mut first_byte = None;
        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            if chunk.is_empty() {
                continue;
            }
            if first_byte.is_none() {
                let elapsed = started.elapsed();
                first_byte = Some(elapsed);
                let latency_ms = elapsed.as_millis() as u64;
                info!(sequence, latency_ms, "first audio byte");
                self.first_audio.fire();
                emit(
                    &self.events,
                    RuntimeEvent::FirstAudio {
                        sequence,
                        latency_ms,
                    },
                );
            }
            bytes += chunk.len();
            self.sink.append(chunk)?;
        }

        Ok(match first_byte {
            Some(first_byte) => SentenceOutcome::Spoken { bytes, first_byte },
            None => SentenceOutcome::NoAudio,
        })
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

    use super::*;
    use crate::audio::memory::MemoryOutput;
    use crate::error::FocusError;
    use crate::tts::AudioByteStream;
    use async_trait::async_trait;
    use bytes::Bytes;
    use std::sync::Mutex;
    use std::sync::atomic::AtomicUsize;

    enum Reply {
        Chunks(Vec<&'static str>),
        Nothing,
        BreakAfterFirst,
        Hang,
    }

    struct FakeSynth {
        reply: Reply,
        calls: Mutex<Vec<String>>,
    }

    impl FakeSynth {
        fn new(reply: Reply) -> Arc<Self> {
            Arc::new(Self {
                reply,
                calls: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl SpeechSynthesizer for FakeSynth {
        async fn synthesize(&self, text: &str) -> Result<Option<AudioByteStream>> {
            self.calls.lock().unwrap().push(text.to_owned());
            let items: Vec<Result<Bytes>> = match &self.reply {
                Reply::Chunks(chunks) => chunks
                    .iter()
                    .copied()
                    .map(|c| Ok(Bytes::from_static(c.as_bytes())))
                    .collect(),
                Reply::Nothing => return Ok(None),
                Reply::BreakAfterFirst => vec![
                    Ok(Bytes::from_static(b"part")),
                    Err(FocusError::Synthesis("connection reset".into())),
                ],
                Reply::Hang => {
                    std::future::pending::<()>().await;
                    Vec::new()
                }
            };
            Ok(Some(Box::pin(futures_util::stream::iter(items))))
        }
    }

    fn unit(text: &str, sequence: u64) -> SentenceUnit {
        SentenceUnit {
            text: text.to_owned(),
            sequence,
        }
    }

    fn worker(
        synth: Arc<FakeSynth>,
        output: &MemoryOutput,
        signal: FirstAudioSignal,
    ) -> SentenceAudioWorker {
        let sink = AudioChunkSink::new(Arc::new(output.clone()), 1);
        SentenceAudioWorker::new(synth, sink, signal, Duration::from_secs(15))
    }

    #[tokio::test]
    async fn appends_chunks_in_network_order() {
        let synth = FakeSynth::new(Reply::Chunks(vec!["ab", "", "cd"]));
        let output = MemoryOutput::new();
        let w = worker(synth.clone(), &output, FirstAudioSignal::noop());
        let outcome = w.run(&unit(" It is three o'clock. ", 0)).await;
        assert!(matches!(outcome, SentenceOutcome::Spoken { bytes: 4, .. }));
        assert_eq!(output.last_stream().unwrap().bytes(), b"abcd");
        assert_eq!(synth.calls.lock().unwrap().as_slice(), ["It is three o'clock."]);
    }

    #[tokio::test]
    async fn blank_sentence_makes_no_request() {
        let synth = FakeSynth::new(Reply::Chunks(vec!["ab"]));
        let output = MemoryOutput::new();
        let w = worker(synth.clone(), &output, FirstAudioSignal::noop());
        assert_eq!(w.run(&unit("  \n", 3)).await, SentenceOutcome::NoAudio);
        assert!(synth.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn no_content_is_no_audio() {
        let output = MemoryOutput::new();
        let w = worker(FakeSynth::new(Reply::Nothing), &output, FirstAudioSignal::noop());
        assert_eq!(w.run(&unit("Hello there.", 0)).await, SentenceOutcome::NoAudio);
        assert!(output.streams().is_empty());
    }

    #[tokio::test]
    async fn broken_stream_fails_sentence_keeping_partial_audio() {
        let output = MemoryOutput::new();
        let w = worker(FakeSynth::new(Reply::BreakAfterFirst), &output, FirstAudioSignal::noop());
        let outcome = w.run(&unit("Hello there.", 1)).await;
        assert!(matches!(outcome, SentenceOutcome::Failed(_)));
        assert_eq!(output.last_stream().unwrap().bytes(), b"part");
    }

    #[tokio::test(start_paused = true)]
    async fn slow_synthesis_times_out() {
        let output = MemoryOutput::new();
        let w = worker(FakeSynth::new(Reply::Hang), &output, FirstAudioSignal::noop());
        assert_eq!(w.run(&unit("Hello there.", 0)).await, SentenceOutcome::TimedOut);
    }

    #[tokio::test]
    async fn first_audio_fires_once_before_first_append() {
        let output = MemoryOutput::new();
        let fired = Arc::new(AtomicUsize::new(0));
        let bytes_at_fire = Arc::new(Mutex::new(None));
        let sink = AudioChunkSink::new(Arc::new(output.clone()), 1);

        let signal = FirstAudioSignal::new({
            let fired = fired.clone();
            let bytes_at_fire = bytes_at_fire.clone();
            let sink = sink.clone();
            move || {
                fired.fetch_add(1, Ordering::SeqCst);
                *bytes_at_fire.lock().unwrap() = Some(sink.bytes_written());
            }
        });
        let w = SentenceAudioWorker::new(
            FakeSynth::new(Reply::Chunks(vec!["one", "two"])),
            sink,
            signal.clone(),
            Duration::from_secs(15),
        );

        w.run(&unit("First sentence here.", 0)).await;
        w.run(&unit("Second sentence here.", 1)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert_eq!(*bytes_at_fire.lock().unwrap(), Some(0));
        assert!(signal.has_fired());
    }
}
