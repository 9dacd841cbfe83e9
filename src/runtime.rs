//! Runtime events emitted by the pipeline for UI and observability.
//!
//! Events are cheap to clone and sent over a `tokio::sync::broadcast`
//! channel; a lagging or absent subscriber never blocks the pipeline.

use crate::audio::sink::PlaybackState;
use crate::pipeline::messages::SentenceOutcome;
use crate::session::types::TurnKey;
use tokio::sync::broadcast;

/// Broadcast capacity for runtime events.
pub const RUNTIME_EVENT_CAPACITY: usize = 256;

/// Coarse assistant state shown to the user.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssistantState {
    Idle,
    /// Ready for the next utterance.
    Listening,
    Transcribing,
    /// Waiting for or streaming the answer.
    Thinking,
    /// Answer text is complete; audio may still be playing.
    Speaking,
}

/// Events that describe what the pipeline is doing "right now".
#[derive(Debug, Clone)]
pub enum RuntimeEvent {
    State(AssistantState),
    /// A fresh conversation session was created locally.
    SessionStarted { session_id: String },
    /// The backend assigned a title to a session.
    SessionTitle { session_id: String, title: String },
    /// A question was submitted.
    TurnStarted {
        key: TurnKey,
        question: String,
        persona: Option<String>,
    },
    /// Answer text appended to the visible transcript.
    AnswerDelta { key: TurnKey, text: String },
    /// A sentence was handed to the speech path.
    SentenceReady {
        key: TurnKey,
        sequence: u64,
        text: String,
    },
    /// First synthesized byte of a sentence reached the sink.
    FirstAudio { sequence: u64, latency_ms: u64 },
    /// A sentence finished its trip through the speech path.
    SentenceAudio {
        sequence: u64,
        outcome: SentenceOutcome,
    },
    FillerStarted,
    FillerStopped,
    /// The turn's audio playback changed state.
    Playback { state: PlaybackState },
    /// The answer stream completed and the turn is no longer streaming.
    TurnFinished { key: TurnKey, answer: String },
    /// Turn persistence returned a message id.
    MessageSaved { key: TurnKey, message_id: String },
    /// The saved audio reference was attached to a turn.
    AudioAttached { key: TurnKey, audio_file: String },
    /// Short user-facing status line (transient errors, degraded paths).
    Status { message: String },
}

/// Best-effort send: no subscribers is not an error.
pub(crate) fn emit(tx: &Option<broadcast::Sender<RuntimeEvent>>, event: RuntimeEvent) {
    if let Some(tx) = tx {
        let _ = tx.send(event);
    }
}
