//! focus-voice: incremental spoken responses for a voice assistant.
//!
//! Answer text streams in from the backend and is spoken sentence by
//! sentence while it is still arriving:
//! Answer stream → Segmenter → Sentence queue → Synthesis → Audio sink → Speaker
//!
//! # Architecture
//!
//! - **API**: HTTP client for transcription, the SSE answer stream, per-sentence
//!   synthesis, filler clips and persistence (`reqwest`)
//! - **Pipeline**: sentence segmentation, the serial synthesis queue, the
//!   per-turn speech path and the turn coordinator
//! - **Audio**: order-preserving sink over a playback device, filler clips,
//!   streaming decode (`symphonia`) and speaker output (`cpal`, optional)
//! - **TTS**: remote sentence worker and the on-device fallback
//! - **Session**: conversation identity, turns and fire-and-forget persistence

pub mod api;
pub mod audio;
pub mod config;
pub mod error;
pub mod pipeline;
pub mod preferences;
pub mod runtime;
pub mod session;
pub mod tts;

pub use api::FocusClient;
pub use config::FocusConfig;
pub use error::{FocusError, Result};
pub use pipeline::coordinator::{TurnCoordinator, TurnReport};
pub use preferences::{Preferences, SpeechBackend};
pub use runtime::{AssistantState, RuntimeEvent};
