//! Order-preserving audio sink feeding one continuous playback stream.
//!
//! [`AudioChunkSink`] is owned by a single conversation turn. Sentence
//! workers append synthesized bytes in sentence order; the sink writes them
//! to the device in exactly that order, holding them back while the device
//! is busy, and starts audible playback once enough bytes are buffered to
//! avoid stutter.
//!
//! State machine:
//!
//! ```text
//! Idle ──filler──▶ FillerPlaying
//!   │                  │
//!   └──────open────────┴──▶ Buffering ──min bytes / close──▶ Playing ──end──▶ Ended
//!                               │                               │
//!                               └──── start or device failure ──┴──▶ Errored
//! ```
//!
//! `Ended` and `Errored` are terminal; a new turn creates a new sink.

use crate::audio::device::{AudioOutput, DeviceEvent, PlaybackDevice};
use crate::error::{FocusError, Result};
use bytes::Bytes;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

/// Playback state of one turn's audio.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybackState {
    Idle,
    FillerPlaying,
    Buffering,
    Playing,
    Ended,
    Errored,
}

impl PlaybackState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Ended | Self::Errored)
    }
}

struct SinkInner {
    output: Arc<dyn AudioOutput>,
    device: Option<Box<dyn PlaybackDevice>>,
    pending: VecDeque<Bytes>,
    written: usize,
    min_start_bytes: usize,
    close_requested: bool,
    finished: bool,
    state_tx: watch::Sender<PlaybackState>,
}

impl SinkInner {
    fn state(&self) -> PlaybackState {
        *self.state_tx.borrow()
    }

    fn set_state(&mut self, next: PlaybackState) {
        let current = self.state();
        if current.is_terminal() || current == next {
            return;
        }
        debug!(from = ?current, to = ?next, "playback state");
        self.state_tx.send_replace(next);
    }

    fn fail(&mut self, reason: &str) {
        warn!("audio sink failed: {reason}");
        self.pending.clear();
        if let Some(mut device) = self.device.take() {
            device.stop();
        }
        self.set_state(PlaybackState::Errored);
    }

    fn ensure_open(&mut self, this: Weak<Mutex<SinkInner>>) -> Result<()> {
        let state = self.state();
        if state.is_terminal() {
            return Err(FocusError::Playback(format!("sink is {state:?}")));
        }
        if self.device.is_some() {
            return Ok(());
        }
        let (tx, rx) = mpsc::unbounded_channel();
        match self.output.open(tx) {
            Ok(device) => self.device = Some(device),
            Err(e) => {
                self.fail(&e.to_string());
                return Err(e);
            }
        }
        self.set_state(PlaybackState::Buffering);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(pump_device_events(this, rx));
            }
            Err(_) => warn!("no async runtime; device events will not be observed"),
        }
        Ok(())
    }

    /// Write queued chunks while the device accepts them, then advance the
    /// state machine.
    fn flush(&mut self) -> Result<()> {
        while let Some(device) = self.device.as_mut() {
            if !device.is_ready() {
                break;
            }
            let Some(chunk) = self.pending.pop_front() else {
                break;
            };
            if let Err(e) = device.write(&chunk) {
                self.fail(&e.to_string());
                return Err(e);
            }
            self.written += chunk.len();
        }
        if self.state() == PlaybackState::Buffering
            && self.written > 0
            && self.written >= self.min_start_bytes
        {
            self.start_device()?;
        }
        self.finish_if_requested()
    }

    fn start_device(&mut self) -> Result<()> {
        let Some(device) = self.device.as_mut() else {
            return Ok(());
        };
        match device.start() {
            Ok(()) => {
                info!(buffered = self.written, "audio playback started");
                self.set_state(PlaybackState::Playing);
                Ok(())
            }
            Err(e) => {
                self.fail(&format!("playback start failed: {e}"));
                Err(e)
            }
        }
    }

    fn finish_if_requested(&mut self) -> Result<()> {
        if !self.close_requested || self.finished || !self.pending.is_empty() {
            return Ok(());
        }
        if self.written == 0 {
            self.finished = true;
            if let Some(mut device) = self.device.take() {
                device.stop();
            }
            self.set_state(PlaybackState::Ended);
            return Ok(());
        }
        if self.state() == PlaybackState::Buffering {
            self.start_device()?;
        }
        if let Some(device) = self.device.as_mut() {
            if let Err(e) = device.finish() {
                self.fail(&e.to_string());
                return Err(e);
            }
            self.finished = true;
        }
        Ok(())
    }

    fn handle_event(&mut self, event: DeviceEvent) {
        match event {
            DeviceEvent::WriteComplete => {
                if let Err(e) = self.flush() {
                    debug!("flush after write completion failed: {e}");
                }
            }
            DeviceEvent::Ended => {
                self.device = None;
                self.set_state(PlaybackState::Ended);
            }
            DeviceEvent::Error(reason) => self.fail(&reason),
        }
    }
}

async fn pump_device_events(
    inner: Weak<Mutex<SinkInner>>,
    mut rx: mpsc::UnboundedReceiver<DeviceEvent>,
) {
    while let Some(event) = rx.recv().await {
        let Some(inner) = inner.upgrade() else {
            break;
        };
        let mut guard = inner.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        guard.handle_event(event);
        if guard.state().is_terminal() {
            break;
        }
    }
}

/// Append-only, order-preserving sink for one turn's synthesized audio.
///
/// Cloning yields another handle to the same sink.
#[derive(Clone)]
pub struct AudioChunkSink {
    inner: Arc<Mutex<SinkInner>>,
    state_rx: watch::Receiver<PlaybackState>,
}

impl std::fmt::Debug for AudioChunkSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AudioChunkSink")
            .field("state", &self.state())
            .finish()
    }
}

impl AudioChunkSink {
    pub fn new(output: Arc<dyn AudioOutput>, min_start_bytes: usize) -> Self {
        let (state_tx, state_rx) = watch::channel(PlaybackState::Idle);
        Self {
            inner: Arc::new(Mutex::new(SinkInner {
                output,
                device: None,
                pending: VecDeque::new(),
                written: 0,
                min_start_bytes,
                close_requested: false,
                finished: false,
                state_tx,
            })),
            state_rx,
        }
    }

    fn lock(&self) -> MutexGuard<'_, SinkInner> {
        self.inner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    pub fn state(&self) -> PlaybackState {
        *self.state_rx.borrow()
    }

    /// Watch state transitions.
    pub fn subscribe(&self) -> watch::Receiver<PlaybackState> {
        self.state_rx.clone()
    }

    /// Bytes handed to the device so far.
    pub fn bytes_written(&self) -> usize {
        self.lock().written
    }

    /// Record that the filler clip is covering the wait for real audio.
    pub fn note_filler_playing(&self) {
        let mut inner = self.lock();
        if inner.state() == PlaybackState::Idle {
            inner.set_state(PlaybackState::FillerPlaying);
        }
    }

    /// Create the device stream if it does not exist yet.
    ///
    /// # Errors
    ///
    /// Returns an error if the sink is terminal or the device cannot be opened.
    pub fn open(&self) -> Result<()> {
        let weak = Arc::downgrade(&self.inner);
        self.lock().ensure_open(weak)
    }

    /// Append the next chunk of audio.
    ///
    /// # Errors
    ///
    /// Returns an error if the sink was closed, stopped or has failed.
    pub fn append(&self, bytes: Bytes) -> Result<()> {
        if bytes.is_empty() {
            return Ok(());
        }
        let weak = Arc::downgrade(&self.inner);
        let mut inner = self.lock();
        if inner.close_requested {
            return Err(FocusError::Playback("append after close".to_owned()));
        }
        inner.ensure_open(weak)?;
        inner.pending.push_back(bytes);
        inner.flush()
    }

    /// Signal that no more audio is coming.
    ///
    /// Chunks still waiting for the device are written first; the device is
    /// finished only once they are out.
    pub fn close(&self) {
        let mut inner = self.lock();
        if inner.state().is_terminal() || inner.close_requested {
            return;
        }
        inner.close_requested = true;
        if let Err(e) = inner.flush() {
            debug!("closing sink failed: {e}");
        }
    }

    /// Halt playback and release the device now.
    pub fn stop(&self) {
        let mut inner = self.lock();
        inner.pending.clear();
        inner.close_requested = true;
        inner.finished = true;
        if let Some(mut device) = inner.device.take() {
            device.stop();
        }
        inner.set_state(PlaybackState::Ended);
    }

    /// Wait until the sink reaches `Ended` or `Errored`.
    pub async fn wait_terminal(&self) -> PlaybackState {
        let mut rx = self.state_rx.clone();
        match rx.wait_for(|s| s.is_terminal()).await {
            Ok(state) => *state,
            Err(_) => self.state(),
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

    use super::*;
    use crate::audio::memory::MemoryOutput;
    use std::time::Duration;

    fn sink(output: &MemoryOutput, min: usize) -> AudioChunkSink {
        AudioChunkSink::new(Arc::new(output.clone()), min)
    }

    async fn settle<F: Fn() -> bool>(cond: F) {
        for _ in 0..200 {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test]
    async fn starts_after_threshold_and_ends() {
        let output = MemoryOutput::new();
        let sink = sink(&output, 10);
        assert_eq!(sink.state(), PlaybackState::Idle);

        sink.append(Bytes::from_static(b"abcd")).unwrap();
        assert_eq!(sink.state(), PlaybackState::Buffering);
        assert!(!output.last_stream().unwrap().started);

        sink.append(Bytes::from_static(b"efghijkl")).unwrap();
        assert_eq!(sink.state(), PlaybackState::Playing);
        assert!(output.last_stream().unwrap().started);

        sink.close();
        assert_eq!(sink.wait_terminal().await, PlaybackState::Ended);
        let stream = output.last_stream().unwrap();
        assert!(stream.finished);
        assert_eq!(stream.bytes(), b"abcdefghijkl");
    }

    #[tokio::test]
    async fn close_starts_short_audio() {
        let output = MemoryOutput::new();
        let sink = sink(&output, 1_000);
        sink.append(Bytes::from_static(b"tiny")).unwrap();
        assert_eq!(sink.state(), PlaybackState::Buffering);
        sink.close();
        let stream = output.last_stream().unwrap();
        assert!(stream.started);
        assert!(stream.finished);
        assert_eq!(sink.wait_terminal().await, PlaybackState::Ended);
    }

    #[tokio::test]
    async fn close_without_audio_never_opens_device() {
        let output = MemoryOutput::new();
        let sink = sink(&output, 10);
        sink.close();
        assert_eq!(sink.state(), PlaybackState::Ended);
        assert!(output.streams().is_empty());
    }

    #[tokio::test]
    async fn busy_device_queues_in_order_and_defers_close() {
        let output = MemoryOutput::new();
        output.set_end_on_finish(false);
        output.set_ready(false);
        let sink = sink(&output, 1);

        sink.append(Bytes::from_static(b"one-")).unwrap();
        sink.append(Bytes::from_static(b"two-")).unwrap();
        sink.close();
        let stream = output.last_stream().unwrap();
        assert!(stream.writes.is_empty());
        assert!(!stream.finished);

        output.set_ready(true);
        settle(|| output.last_stream().unwrap().finished).await;
        assert_eq!(output.last_stream().unwrap().bytes(), b"one-two-");
        assert_eq!(sink.state(), PlaybackState::Playing);

        output.emit(DeviceEvent::Ended);
        assert_eq!(sink.wait_terminal().await, PlaybackState::Ended);
    }

    #[tokio::test]
    async fn start_failure_is_errored() {
        let output = MemoryOutput::new();
        output.set_fail_start(true);
        let sink = sink(&output, 2);
        assert!(sink.append(Bytes::from_static(b"abc")).is_err());
        assert_eq!(sink.state(), PlaybackState::Errored);
        assert!(sink.append(Bytes::from_static(b"more")).is_err());
    }

    #[tokio::test]
    async fn device_error_is_errored() {
        let output = MemoryOutput::new();
        let sink = sink(&output, 2);
        sink.append(Bytes::from_static(b"abc")).unwrap();
        output.emit(DeviceEvent::Error("unplugged".into()));
        assert_eq!(sink.wait_terminal().await, PlaybackState::Errored);
        assert!(output.last_stream().unwrap().stopped);
    }

    #[tokio::test]
    async fn stop_releases_device() {
        let output = MemoryOutput::new();
        let sink = sink(&output, 2);
        sink.append(Bytes::from_static(b"abc")).unwrap();
        sink.stop();
        assert_eq!(sink.state(), PlaybackState::Ended);
        assert!(output.last_stream().unwrap().stopped);
        assert!(sink.append(Bytes::from_static(b"late")).is_err());
    }

    #[tokio::test]
    async fn filler_then_buffering() {
        let output = MemoryOutput::new();
        let sink = sink(&output, 100);
        sink.note_filler_playing();
        assert_eq!(sink.state(), PlaybackState::FillerPlaying);
        sink.open().unwrap();
        assert_eq!(sink.state(), PlaybackState::Buffering);
        sink.open().unwrap();
        assert_eq!(output.streams().len(), 1);
    }
}
