//! Device-level playback seam.
//!
//! An [`AudioOutput`] opens one continuous [`PlaybackDevice`] stream per
//! use. The device accepts encoded audio bytes as they arrive, starts
//! audible playback on request and reports asynchronous happenings
//! (write completion, natural end, failures) through a [`DeviceEvent`]
//! channel handed over at open time.

use crate::error::Result;
use tokio::sync::mpsc;

/// Asynchronous notifications from an open device stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceEvent {
    /// A write that left the device busy has completed.
    WriteComplete,
    /// All written audio has been played after [`PlaybackDevice::finish`].
    Ended,
    /// The device failed; the stream is unusable.
    Error(String),
}

/// One continuous playback stream.
pub trait PlaybackDevice: Send {
    /// Whether the device can take another write right now.
    ///
    /// A device that returns `false` must emit [`DeviceEvent::WriteComplete`]
    /// once it becomes ready again.
    fn is_ready(&self) -> bool {
        true
    }

    /// Append encoded bytes to the stream.
    fn write(&mut self, bytes: &[u8]) -> Result<()>;

    /// Begin audible playback of what has been written so far.
    fn start(&mut self) -> Result<()>;

    /// No more data is coming; play out the rest and emit `Ended`.
    fn finish(&mut self) -> Result<()>;

    /// Halt immediately and release the device.
    fn stop(&mut self);
}

/// Factory for playback streams.
pub trait AudioOutput: Send + Sync {
    /// Open a fresh stream reporting to `events`.
    ///
    /// # Errors
    ///
    /// Returns an error if the underlying device cannot be opened.
    fn open(&self, events: mpsc::UnboundedSender<DeviceEvent>) -> Result<Box<dyn PlaybackDevice>>;
}
