//! Text-to-speech: remote per-sentence synthesis and the on-device fallback.

pub mod fallback;
pub mod worker;

use crate::error::Result;
use async_trait::async_trait;
use bytes::Bytes;
use futures_util::Stream;
use std::pin::Pin;

pub use fallback::{SpeechSynthesisFallback, SystemVoice, Utterer};
pub use worker::{FirstAudioSignal, SentenceAudioWorker};

/// Encoded audio bytes as the synthesizer produces them.
pub type AudioByteStream = Pin<Box<dyn Stream<Item = Result<Bytes>> + Send>>;

/// Turns one sentence into streamed audio.
#[async_trait]
pub trait SpeechSynthesizer: Send + Sync {
    /// `Ok(None)` means the synthesizer has no audio for this text.
    async fn synthesize(&self, text: &str) -> Result<Option<AudioByteStream>>;
}
