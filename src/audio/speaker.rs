//! Speaker output through cpal.
//!
//! Each opened stream owns a worker thread that decodes the incoming
//! encoded bytes and feeds a sample queue drained by the cpal callback.
//! The callback plays silence until [`PlaybackDevice::start`] is called.

use crate::audio::decode::{ChunkReader, decode_stream};
use crate::audio::device::{AudioOutput, DeviceEvent, PlaybackDevice};
use crate::error::{FocusError, Result};
use bytes::Bytes;
use cpal::StreamConfig;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use crossbeam_channel::Sender;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

/// Plays audio on a system output device.
#[derive(Debug, Clone, Default)]
pub struct SpeakerOutput {
    device_name: Option<String>,
}

impl SpeakerOutput {
    /// Use the named output device, or the system default when `None`.
    pub fn new(device_name: Option<String>) -> Self {
        Self { device_name }
    }

    /// List available output devices.
    ///
    /// # Errors
    ///
    /// Returns an error if devices cannot be enumerated.
    pub fn list_output_devices() -> Result<Vec<String>> {
        let host = cpal::default_host();
        let devices = host
            .output_devices()
            .map_err(|e| FocusError::Playback(format!("cannot enumerate devices: {e}")))?;
        Ok(devices
            .filter_map(|d| d.description().ok().map(|desc| desc.name().to_owned()))
            .collect())
    }

    fn find_device(&self) -> Result<cpal::Device> {
        let host = cpal::default_host();
        match self.device_name.as_deref() {
            Some(name) => host
                .output_devices()
                .map_err(|e| FocusError::Playback(format!("cannot enumerate devices: {e}")))?
                .find(|d| {
                    d.description()
                        .ok()
                        .is_some_and(|desc| desc.name() == name)
                })
                .ok_or_else(|| FocusError::Playback(format!("output device '{name}' not found"))),
            None => host
                .default_output_device()
                .ok_or_else(|| FocusError::Playback("no default output device".into())),
        }
    }
}

#[derive(Default)]
struct SpeakerShared {
    samples: Mutex<VecDeque<f32>>,
    playing: AtomicBool,
    stopped: AtomicBool,
}

impl SpeakerShared {
    fn queued(&self) -> usize {
        self.samples.lock().map(|q| q.len()).unwrap_or(0)
    }
}

impl AudioOutput for SpeakerOutput {
    fn open(&self, events: mpsc::UnboundedSender<DeviceEvent>) -> Result<Box<dyn PlaybackDevice>> {
        let device = self.find_device()?;
        let (tx, rx) = crossbeam_channel::unbounded::<Bytes>();
        let shared = Arc::new(SpeakerShared::default());

        let worker_shared = Arc::clone(&shared);
        std::thread::Builder::new()
            .name("focus-speaker".into())
            .spawn(move || run_stream(device, ChunkReader::new(rx), worker_shared, events))
            .map_err(|e| FocusError::Playback(format!("cannot spawn speaker thread: {e}")))?;

        Ok(Box::new(SpeakerStream {
            tx: Some(tx),
            shared,
        }))
    }
}

struct SpeakerStream {
    tx: Option<Sender<Bytes>>,
    shared: Arc<SpeakerShared>,
}

impl PlaybackDevice for SpeakerStream {
    fn write(&mut self, bytes: &[u8]) -> Result<()> {
        let tx = self
            .tx
            .as_ref()
            .ok_or_else(|| FocusError::Playback("write after finish".into()))?;
        tx.send(Bytes::copy_from_slice(bytes))
            .map_err(|_| FocusError::Playback("speaker stream closed".into()))
    }

    fn start(&mut self) -> Result<()> {
        self.shared.playing.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn finish(&mut self) -> Result<()> {
        self.tx = None;
        Ok(())
    }

    fn stop(&mut self) {
        self.shared.stopped.store(true, Ordering::SeqCst);
        self.tx = None;
        if let Ok(mut q) = self.shared.samples.lock() {
            q.clear();
        }
    }
}

fn run_stream(
    device: cpal::Device,
    reader: ChunkReader,
    shared: Arc<SpeakerShared>,
    events: mpsc::UnboundedSender<DeviceEvent>,
) {
    let mut stream: Option<cpal::Stream> = None;
    let mut stream_rate = 0u32;
    let mut rate_warned = false;
    let mut failed = false;

    let decoded = decode_stream(reader, |chunk| {
        if shared.stopped.load(Ordering::SeqCst) {
            return false;
        }
        if stream.is_none() {
            match build_stream(&device, chunk.sample_rate, Arc::clone(&shared)) {
                Ok(s) => {
                    stream = Some(s);
                    stream_rate = chunk.sample_rate;
                }
                Err(e) => {
                    error!("{e}");
                    let _ = events.send(DeviceEvent::Error(e.to_string()));
                    failed = true;
                    return false;
                }
            }
        }
        if chunk.sample_rate != stream_rate && !rate_warned {
            rate_warned = true;
            warn!(
                stream_rate,
                chunk_rate = chunk.sample_rate,
                "sentence audio sample rate differs from the open stream"
            );
        }
        if let Ok(mut q) = shared.samples.lock() {
            q.extend(chunk.samples);
        }
        true
    });

    if let Err(e) = decoded
        && !shared.stopped.load(Ordering::SeqCst)
    {
        warn!("speaker decode failed: {e}");
        let _ = events.send(DeviceEvent::Error(e.to_string()));
        return;
    }
    if failed {
        return;
    }

    while !shared.stopped.load(Ordering::SeqCst)
        && shared.playing.load(Ordering::SeqCst)
        && shared.queued() > 0
    {
        std::thread::sleep(Duration::from_millis(10));
    }
    drop(stream);

    if !shared.stopped.load(Ordering::SeqCst) {
        info!("speaker playback drained");
        let _ = events.send(DeviceEvent::Ended);
    }
}

fn build_stream(
    device: &cpal::Device,
    sample_rate: u32,
    shared: Arc<SpeakerShared>,
) -> Result<cpal::Stream> {
    let config = StreamConfig {
        channels: 1,
        sample_rate,
        buffer_size: cpal::BufferSize::Default,
    };
    let stream = device
        .build_output_stream(
            &config,
            move |data: &mut [f32], _info: &cpal::OutputCallbackInfo| {
                let playing = shared.playing.load(Ordering::Relaxed)
                    && !shared.stopped.load(Ordering::Relaxed);
                let mut queue = match shared.samples.lock() {
                    Ok(q) => q,
                    Err(_) => return,
                };
                for sample in data.iter_mut() {
                    *sample = if playing {
                        queue.pop_front().unwrap_or(0.0)
                    } else {
                        0.0
                    };
                }
            },
            move |err| {
                error!("audio output stream error: {err}");
            },
            None,
        )
        .map_err(|e| FocusError::Playback(format!("failed to build output stream: {e}")))?;
    stream
        .play()
        .map_err(|e| FocusError::Playback(format!("failed to start output stream: {e}")))?;
    Ok(stream)
}
