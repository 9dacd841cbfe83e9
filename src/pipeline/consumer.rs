//! Drives one answer stream through transcript, segmenter and speech path.

use crate::api::AnswerStream;
use crate::api::types::AnswerEvent;
use crate::error::FocusError;
use crate::pipeline::messages::SentenceUnit;
use crate::pipeline::segmenter::SentenceSegmenter;
use crate::pipeline::speech::SpeechPath;
use crate::runtime::{RuntimeEvent, emit};
use crate::session::types::{ConversationTurn, TurnKey};
use crate::session::{self, SharedSession};
use futures_util::StreamExt;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

/// How an answer stream ended.
#[derive(Debug)]
pub enum StreamOutcome {
    /// The `done` event arrived. `None` if the turn's session is no longer active.
    Completed(Option<ConversationTurn>),
    /// The stream failed or ended early; the turn keeps the text received so far.
    Broken {
        turn: Option<ConversationTurn>,
        error: FocusError,
    },
}

/// Applies answer events to one turn, in arrival order.
pub struct TextStreamConsumer {
    key: TurnKey,
    session: SharedSession,
    segmenter: SentenceSegmenter,
    speech: SpeechPath,
    events: Option<broadcast::Sender<RuntimeEvent>>,
    answer: String,
    chunks: usize,
}

impl TextStreamConsumer {
    pub fn new(
        key: TurnKey,
        session: SharedSession,
        min_sentence_chars: usize,
        speech: SpeechPath,
    ) -> Self {
        Self {
            key,
            session,
            segmenter: SentenceSegmenter::new(min_sentence_chars),
            speech,
            events: None,
            answer: String::new(),
            chunks: 0,
        }
    }

    pub fn with_events(mut self, events: broadcast::Sender<RuntimeEvent>) -> Self {
        self.events = Some(events);
        self
    }

    /// Apply one text delta: transcript first, then the segmenter, then speech.
    pub fn on_chunk(&mut self, text: &str) {
        if text.is_empty() {
            return;
        }
        self.chunks += 1;
        self.answer.push_str(text);
        if !session::lock(&self.session).append_answer(&self.key, text) {
            debug!("answer delta for inactive turn");
        }
        emit(
            &self.events,
            RuntimeEvent::AnswerDelta {
                key: self.key.clone(),
                text: text.to_owned(),
            },
        );
        for unit in self.segmenter.feed(text) {
            self.dispatch(unit);
        }
    }

    /// Flush the segmenter and mark the turn complete.
    pub fn on_done(&mut self, full_text: &str) -> Option<ConversationTurn> {
        if self.chunks == 0 {
            self.on_chunk(full_text);
        } else if !full_text.is_empty() && full_text != self.answer {
            warn!(
                streamed = self.answer.len(),
                reported = full_text.len(),
                "final answer text differs from streamed text; keeping streamed text"
            );
        }
        let turn = self.finalize();
        info!(
            chars = self.answer.chars().count(),
            chunks = self.chunks,
            "answer stream complete"
        );
        turn
    }

    /// Finalize after a failure, keeping whatever arrived.
    pub fn on_broken(&mut self) -> Option<ConversationTurn> {
        self.finalize()
    }

    /// Consume `stream` to its end.
    pub async fn consume(mut self, mut stream: AnswerStream) -> StreamOutcome {
        while let Some(event) = stream.next().await {
            match event {
                Ok(AnswerEvent::Chunk(text)) => self.on_chunk(&text),
                Ok(AnswerEvent::Done { full_text }) => {
                    return StreamOutcome::Completed(self.on_done(&full_text));
                }
                Err(error) => {
                    warn!("answer stream broke: {error}");
                    return StreamOutcome::Broken {
                        turn: self.on_broken(),
                        error,
                    };
                }
            }
        }
        warn!("answer stream ended without completion");
        StreamOutcome::Broken {
            turn: self.on_broken(),
            error: FocusError::Stream("answer stream ended before completion".into()),
        }
    }

    fn dispatch(&mut self, unit: SentenceUnit) {
        emit(
            &self.events,
            RuntimeEvent::SentenceReady {
                key: self.key.clone(),
                sequence: unit.sequence,
                text: unit.text.clone(),
            },
        );
        self.speech.speak(unit);
    }

    fn finalize(&mut self) -> Option<ConversationTurn> {
        if let Some(unit) = self.segmenter.flush() {
            self.dispatch(unit);
        }
        let turn = session::lock(&self.session).finish_turn(&self.key);
        emit(
            &self.events,
            RuntimeEvent::TurnFinished {
                key: self.key.clone(),
                answer: self.answer.clone(),
            },
        );
        turn
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

    use super::*;
    use crate::error::Result;
    use crate::session::SessionStateManager;
    use crate::session::types::SessionMode;
    use crate::tts::fallback::{SpeechSynthesisFallback, Utterer};
    use async_trait::async_trait;
    use std::sync::{Arc, Mutex};

    #[derive(Default)]
    struct Transcript(Mutex<Vec<String>>);

    #[async_trait]
    impl Utterer for Transcript {
        async fn utter(&self, text: &str) -> Result<()> {
            self.0.lock().unwrap().push(text.to_owned());
            Ok(())
        }
    }

    struct Harness {
        session: SharedSession,
        transcript: Arc<Transcript>,
        speech: SpeechPath,
        consumer: TextStreamConsumer,
    }

    fn harness(min_chars: usize) -> Harness {
        let session = SessionStateManager::shared(SessionMode::Question);
        let (key, _) = session::lock(&session).begin_turn("What time is it?");
        let transcript = Arc::new(Transcript::default());
        let speech =
            SpeechPath::OnDevice(Arc::new(SpeechSynthesisFallback::new(transcript.clone())));
        let consumer = TextStreamConsumer::new(key, session.clone(), min_chars, speech.clone());
        Harness {
            session,
            transcript,
            speech,
            consumer,
        }
    }

    fn stream(events: Vec<Result<AnswerEvent>>) -> AnswerStream {
        Box::pin(futures_util::stream::iter(events))
    }

    fn chunk(text: &str) -> Result<AnswerEvent> {
        Ok(AnswerEvent::Chunk(text.to_owned()))
    }

    #[tokio::test]
    async fn chunks_reach_transcript_and_speech_in_order() {
        let h = harness(20);
        let outcome = h
            .consumer
            .consume(stream(vec![
                chunk("It is"),
                chunk(" three o'clock. The"),
                chunk(" sun is still up, barely."),
                Ok(AnswerEvent::Done {
                    full_text: "It is three o'clock. The sun is still up, barely.".into(),
                }),
            ]))
            .await;

        let StreamOutcome::Completed(Some(turn)) = outcome else {
            panic!("expected completed turn");
        };
        assert_eq!(turn.answer, "It is three o'clock. The sun is still up, barely.");
        assert!(!turn.is_streaming);

        h.speech.finish().await;
        assert_eq!(
            h.transcript.0.lock().unwrap().as_slice(),
            ["It is three o'clock.", "The sun is still up, barely."]
        );
        let stored = session::lock(&h.session).snapshot().unwrap();
        assert_eq!(stored.turns[0].answer, turn.answer);
    }

    #[tokio::test]
    async fn full_text_used_when_no_chunks_arrived() {
        let h = harness(20);
        let outcome = h
            .consumer
            .consume(stream(vec![Ok(AnswerEvent::Done {
                full_text: "Only the final text arrived.".into(),
            })]))
            .await;
        let StreamOutcome::Completed(Some(turn)) = outcome else {
            panic!("expected completed turn");
        };
        assert_eq!(turn.answer, "Only the final text arrived.");
    }

    #[tokio::test]
    async fn streamed_text_wins_over_mismatched_full_text() {
        let mut h = harness(20);
        h.consumer.on_chunk("Streamed answer text.");
        let turn = h.consumer.on_done("Something else entirely.").unwrap();
        assert_eq!(turn.answer, "Streamed answer text.");
    }

    #[tokio::test]
    async fn broken_stream_keeps_partial_text() {
        let h = harness(20);
        let outcome = h
            .consumer
            .consume(stream(vec![
                chunk("Partial answer that"),
                Err(FocusError::Stream("connection reset".into())),
            ]))
            .await;
        let StreamOutcome::Broken { turn, error } = outcome else {
            panic!("expected broken stream");
        };
        let turn = turn.unwrap();
        assert_eq!(turn.answer, "Partial answer that");
        assert!(!turn.is_streaming);
        assert!(matches!(error, FocusError::Stream(_)));
    }

    #[tokio::test]
    async fn stream_ending_without_done_is_broken() {
        let h = harness(20);
        let outcome = h.consumer.consume(stream(vec![chunk("Hello")])).await;
        assert!(matches!(outcome, StreamOutcome::Broken { .. }));
    }

    #[tokio::test]
    async fn updates_after_new_chat_are_discarded() {
        let mut h = harness(5);
        h.consumer.on_chunk("Before.");
        session::lock(&h.session).new_chat();
        h.consumer.on_chunk(" After.");
        assert!(h.consumer.on_done("").is_none());
        assert!(session::lock(&h.session).snapshot().is_none());
    }
}
