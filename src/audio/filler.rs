//! Short filler clip played while the first real sentence is synthesized.

use crate::audio::device::{AudioOutput, PlaybackDevice};
use crate::error::Result;
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Where filler clips come from.
#[async_trait]
pub trait FillerSource: Send + Sync {
    /// Fetch one clip; `Ok(None)` means the source has nothing to offer.
    async fn fetch_filler(&self) -> Result<Option<Bytes>>;
}

/// Result of [`FillerAudioController::play_filler`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FillerOutcome {
    Playing,
    /// The source returned no clip.
    NoFiller,
    /// Real audio arrived first; nothing was played.
    Skipped,
    Failed(String),
}

#[derive(Default)]
struct FillerSlot {
    stopped: bool,
    device: Option<Box<dyn PlaybackDevice>>,
}

/// Plays at most one filler clip per turn, on its own device stream.
///
/// `stop` may be called any number of times, before or after the clip has
/// started; once stopped, a clip still being fetched is discarded.
pub struct FillerAudioController {
    source: Arc<dyn FillerSource>,
    output: Arc<dyn AudioOutput>,
    slot: Mutex<FillerSlot>,
}

impl std::fmt::Debug for FillerAudioController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let slot = self.slot();
        f.debug_struct("FillerAudioController")
            .field("stopped", &slot.stopped)
            .field("playing", &slot.device.is_some())
            .finish()
    }
}

impl FillerAudioController {
    pub fn new(source: Arc<dyn FillerSource>, output: Arc<dyn AudioOutput>) -> Self {
        Self {
            source,
            output,
            slot: Mutex::new(FillerSlot::default()),
        }
    }

    fn slot(&self) -> MutexGuard<'_, FillerSlot> {
        self.slot
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Fetch a clip and play it, unless stopped in the meantime.
    pub async fn play_filler(&self) -> FillerOutcome {
        if self.slot().stopped {
            return FillerOutcome::Skipped;
        }

        let clip = match self.source.fetch_filler().await {
            Ok(Some(clip)) if !clip.is_empty() => clip,
            Ok(_) => {
                debug!("no filler clip available");
                return FillerOutcome::NoFiller;
            }
            Err(e) => {
                warn!("filler fetch failed: {e}");
                return FillerOutcome::Failed(e.to_string());
            }
        };

        let mut slot = self.slot();
        if slot.stopped {
            debug!("filler arrived after real audio; discarding");
            return FillerOutcome::Skipped;
        }

        // Device events are not interesting for a clip nobody waits on.
        let (events, _) = mpsc::unbounded_channel();
        let mut device = match self.output.open(events) {
            Ok(device) => device,
            Err(e) => {
                warn!("filler device open failed: {e}");
                return FillerOutcome::Failed(e.to_string());
            }
        };
        let played = device
            .write(&clip)
            .and_then(|()| device.start())
            .and_then(|()| device.finish());
        if let Err(e) = played {
            warn!("filler playback failed: {e}");
            device.stop();
            return FillerOutcome::Failed(e.to_string());
        }
        info!(bytes = clip.len(), "filler playing");
        slot.device = Some(device);
        FillerOutcome::Playing
    }

    /// Stop the filler. Returns `true` if a clip was audible and got cut.
    pub fn stop(&self) -> bool {
        let mut slot = self.slot();
        slot.stopped = true;
        match slot.device.take() {
            Some(mut device) => {
                device.stop();
                debug!("filler stopped");
                true
            }
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

    use super::*;
    use crate::audio::memory::MemoryOutput;
    use crate::error::FocusError;
    use std::time::Duration;
    use tokio::sync::Notify;

    struct StaticFiller(Option<&'static [u8]>);

    #[async_trait]
    impl FillerSource for StaticFiller {
        async fn fetch_filler(&self) -> Result<Option<Bytes>> {
            Ok(self.0.map(Bytes::from_static))
        }
    }

    struct BrokenFiller;

    #[async_trait]
    impl FillerSource for BrokenFiller {
        async fn fetch_filler(&self) -> Result<Option<Bytes>> {
            Err(FocusError::Status {
                endpoint: "filler".into(),
                status: 500,
            })
        }
    }

    struct GatedFiller {
        gate: Arc<Notify>,
    }

    #[async_trait]
    impl FillerSource for GatedFiller {
        async fn fetch_filler(&self) -> Result<Option<Bytes>> {
            self.gate.notified().await;
            Ok(Some(Bytes::from_static(b"umm")))
        }
    }

    fn controller(
        source: impl FillerSource + 'static,
        output: &MemoryOutput,
    ) -> FillerAudioController {
        FillerAudioController::new(Arc::new(source), Arc::new(output.clone()))
    }

    #[tokio::test]
    async fn plays_clip_then_stops() {
        let output = MemoryOutput::new();
        let filler = controller(StaticFiller(Some(b"hmm")), &output);
        assert_eq!(filler.play_filler().await, FillerOutcome::Playing);
        let stream = output.last_stream().unwrap();
        assert_eq!(stream.bytes(), b"hmm");
        assert!(stream.started);

        assert!(filler.stop());
        assert!(output.last_stream().unwrap().stopped);
        assert!(!filler.stop());
    }

    #[tokio::test]
    async fn stop_before_play_skips() {
        let output = MemoryOutput::new();
        let filler = controller(StaticFiller(Some(b"hmm")), &output);
        assert!(!filler.stop());
        assert_eq!(filler.play_filler().await, FillerOutcome::Skipped);
        assert!(output.streams().is_empty());
    }

    #[tokio::test]
    async fn clip_arriving_after_stop_is_discarded() {
        let output = MemoryOutput::new();
        let gate = Arc::new(Notify::new());
        let filler = Arc::new(controller(GatedFiller { gate: gate.clone() }, &output));

        let task = tokio::spawn({
            let filler = filler.clone();
            async move { filler.play_filler().await }
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        filler.stop();
        gate.notify_one();

        assert_eq!(task.await.unwrap(), FillerOutcome::Skipped);
        assert!(output.streams().is_empty());
    }

    #[tokio::test]
    async fn missing_or_failed_clip_is_silent() {
        let output = MemoryOutput::new();
        let none = controller(StaticFiller(None), &output);
        assert_eq!(none.play_filler().await, FillerOutcome::NoFiller);
        let broken = controller(BrokenFiller, &output);
        assert!(matches!(broken.play_filler().await, FillerOutcome::Failed(_)));
        assert!(output.streams().is_empty());
    }
}
