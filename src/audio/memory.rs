//! In-memory playback output.
//!
//! Records every stream it opens instead of making sound. Used by the
//! `--silent` CLI mode and throughout the tests, where its switches
//! simulate a busy device, a failing start or an output that never ends
//! on its own.

use crate::audio::device::{AudioOutput, DeviceEvent, PlaybackDevice};
use crate::error::{FocusError, Result};
use bytes::Bytes;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc;

/// What happened to one opened stream.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StreamRecord {
    /// Writes in the order the device received them.
    pub writes: Vec<Bytes>,
    pub started: bool,
    pub finished: bool,
    pub stopped: bool,
}

impl StreamRecord {
    /// All written bytes concatenated.
    pub fn bytes(&self) -> Vec<u8> {
        self.writes.iter().flat_map(|b| b.iter().copied()).collect()
    }
}

#[derive(Debug)]
struct Shared {
    streams: Mutex<Vec<StreamRecord>>,
    events: Mutex<Option<mpsc::UnboundedSender<DeviceEvent>>>,
    ready: AtomicBool,
    fail_start: AtomicBool,
    end_on_finish: AtomicBool,
}

/// Output that keeps audio in memory.
#[derive(Debug, Clone)]
pub struct MemoryOutput {
    shared: Arc<Shared>,
}

impl Default for MemoryOutput {
    fn default() -> Self {
        Self {
            shared: Arc::new(Shared {
                streams: Mutex::new(Vec::new()),
                events: Mutex::new(None),
                ready: AtomicBool::new(true),
                fail_start: AtomicBool::new(false),
                end_on_finish: AtomicBool::new(true),
            }),
        }
    }
}

impl MemoryOutput {
    pub fn new() -> Self {
        Self::default()
    }

    fn streams_guard(&self) -> MutexGuard<'_, Vec<StreamRecord>> {
        self.shared
            .streams
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Snapshot of every stream opened so far.
    pub fn streams(&self) -> Vec<StreamRecord> {
        self.streams_guard().clone()
    }

    /// Snapshot of the most recently opened stream.
    pub fn last_stream(&self) -> Option<StreamRecord> {
        self.streams_guard().last().cloned()
    }

    /// Make the device busy (`false`) or ready again (`true`).
    ///
    /// Becoming ready emits [`DeviceEvent::WriteComplete`] on the latest stream.
    pub fn set_ready(&self, ready: bool) {
        self.shared.ready.store(ready, Ordering::SeqCst);
        if ready {
            self.emit(DeviceEvent::WriteComplete);
        }
    }

    /// Make the next `start()` calls fail.
    pub fn set_fail_start(&self, fail: bool) {
        self.shared.fail_start.store(fail, Ordering::SeqCst);
    }

    /// Whether `finish()` immediately reports a natural end (default `true`).
    pub fn set_end_on_finish(&self, end: bool) {
        self.shared.end_on_finish.store(end, Ordering::SeqCst);
    }

    /// Deliver an event on the latest stream's channel.
    pub fn emit(&self, event: DeviceEvent) {
        let events = self
            .shared
            .events
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if let Some(tx) = events.as_ref() {
            let _ = tx.send(event);
        }
    }
}

impl AudioOutput for MemoryOutput {
    fn open(&self, events: mpsc::UnboundedSender<DeviceEvent>) -> Result<Box<dyn PlaybackDevice>> {
        let index = {
            let mut streams = self.streams_guard();
            streams.push(StreamRecord::default());
            streams.len() - 1
        };
        *self
            .shared
            .events
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = Some(events.clone());
        Ok(Box::new(MemoryDevice {
            output: self.clone(),
            index,
            events,
        }))
    }
}

struct MemoryDevice {
    output: MemoryOutput,
    index: usize,
    events: mpsc::UnboundedSender<DeviceEvent>,
}

impl MemoryDevice {
    fn update(&self, f: impl FnOnce(&mut StreamRecord)) {
        if let Some(record) = self.output.streams_guard().get_mut(self.index) {
            f(record);
        }
    }
}

impl PlaybackDevice for MemoryDevice {
    fn is_ready(&self) -> bool {
        self.output.shared.ready.load(Ordering::SeqCst)
    }

    fn write(&mut self, bytes: &[u8]) -> Result<()> {
        let chunk = Bytes::copy_from_slice(bytes);
        self.update(|r| r.writes.push(chunk));
        Ok(())
    }

    fn start(&mut self) -> Result<()> {
        if self.output.shared.fail_start.load(Ordering::SeqCst) {
            return Err(FocusError::Playback("playback start refused".to_owned()));
        }
        self.update(|r| r.started = true);
        Ok(())
    }

    fn finish(&mut self) -> Result<()> {
        self.update(|r| r.finished = true);
        if self.output.shared.end_on_finish.load(Ordering::SeqCst) {
            let _ = self.events.send(DeviceEvent::Ended);
        }
        Ok(())
    }

    fn stop(&mut self) {
        self.update(|r| r.stopped = true);
    }
}
