//! Streaming decode of encoded audio chunks into mono PCM.
//!
//! The speaker output receives encoded bytes (mp3, aac, wav) as they are
//! synthesized. [`ChunkReader`] turns a channel of chunks into a blocking
//! [`Read`] so symphonia can detect the format and decode while more bytes
//! arrive.

use crate::error::{FocusError, Result};
use bytes::{Buf, Bytes};
use crossbeam_channel::Receiver;
use std::io::Read;
use symphonia::core::audio::SampleBuffer;
use symphonia::core::codecs::DecoderOptions;
use symphonia::core::errors::Error as SymphError;
use symphonia::core::formats::{FormatOptions, FormatReader};
use symphonia::core::io::{MediaSourceStream, ReadOnlySource};
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;
use tracing::debug;

/// Blocking reader over a channel of byte chunks.
///
/// Reads block until the next chunk arrives; a disconnected channel reads
/// as end of stream.
#[derive(Debug)]
pub struct ChunkReader {
    rx: Receiver<Bytes>,
    current: Bytes,
}

impl ChunkReader {
    pub fn new(rx: Receiver<Bytes>) -> Self {
        Self {
            rx,
            current: Bytes::new(),
        }
    }
}

impl Read for ChunkReader {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        while self.current.is_empty() {
            match self.rx.recv() {
                Ok(chunk) => self.current = chunk,
                Err(_) => return Ok(0),
            }
        }
        let n = buf.len().min(self.current.len());
        buf[..n].copy_from_slice(&self.current[..n]);
        self.current.advance(n);
        Ok(n)
    }
}

/// A block of decoded mono samples.
#[derive(Debug, Clone, PartialEq)]
pub struct PcmChunk {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
}

/// Decode `reader` to mono f32, handing each packet's samples to `sink`.
///
/// The stream may hold several containers back to back (one per
/// synthesized sentence). When one ends, the format of the rest of the
/// stream is detected again; decoding finishes at end of input. Decoding
/// stops early when `sink` returns `false`.
///
/// # Errors
///
/// Returns an error if the first container's format is not recognized or a
/// packet cannot be read.
pub fn decode_stream<R>(reader: R, mut sink: impl FnMut(PcmChunk) -> bool) -> Result<()>
where
    R: Read + Send + Sync + 'static,
{
    let mut mss = MediaSourceStream::new(Box::new(ReadOnlySource::new(reader)), Default::default());
    let mut containers = 0usize;

    loop {
        let detected = match symphonia::default::get_probe().format(
            &Hint::new(),
            mss,
            &FormatOptions::default(),
            &MetadataOptions::default(),
        ) {
            Ok(detected) => detected,
            Err(SymphError::IoError(e))
                if containers > 0 && e.kind() == std::io::ErrorKind::UnexpectedEof =>
            {
                debug!(containers, "audio stream ended");
                return Ok(());
            }
            Err(e) => return Err(FocusError::Decode(format!("unrecognized audio format: {e}"))),
        };
        containers += 1;

        let mut format = detected.format;
        if !decode_container(format.as_mut(), &mut sink)? {
            return Ok(());
        }
        mss = format.into_inner();
    }
}

/// Decode one container to its end. Returns `false` if `sink` asked to stop.
fn decode_container(
    format: &mut dyn FormatReader,
    sink: &mut impl FnMut(PcmChunk) -> bool,
) -> Result<bool> {
    let track = format
        .default_track()
        .ok_or_else(|| FocusError::Decode("no default audio track".into()))?;
    let track_id = track.id;
    let codec_params = track.codec_params.clone();

    let mut decoder = symphonia::default::get_codecs()
        .make(&codec_params, &DecoderOptions::default())
        .map_err(|e| FocusError::Decode(format!("failed to create decoder: {e}")))?;

    let mut sample_buf: Option<SampleBuffer<f32>> = None;

    loop {
        let packet = match format.next_packet() {
            Ok(p) => p,
            Err(SymphError::IoError(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                return Ok(true);
            }
            Err(e) => return Err(FocusError::Decode(format!("audio read error: {e}"))),
        };
        if packet.track_id() != track_id {
            continue;
        }

        let decoded = match decoder.decode(&packet) {
            Ok(d) => d,
            Err(SymphError::DecodeError(e)) => {
                debug!("skipping undecodable packet: {e}");
                continue;
            }
            Err(e) => return Err(FocusError::Decode(format!("audio decode error: {e}"))),
        };

        let spec = *decoded.spec();
        let channels = spec.channels.count().max(1);
        let frames = decoded.frames() as u64;
        let required = usize::try_from(frames)
            .unwrap_or(usize::MAX)
            .saturating_mul(channels);
        match sample_buf.as_mut() {
            Some(b) if b.capacity() >= required => b.clear(),
            _ => sample_buf = Some(SampleBuffer::<f32>::new(frames, spec)),
        }
        let Some(buf) = sample_buf.as_mut() else {
            continue;
        };
        buf.copy_interleaved_ref(decoded);

        let chunk = PcmChunk {
            samples: downmix(buf.samples(), channels),
            sample_rate: spec.rate,
        };
        if !sink(chunk) {
            debug!("decode stopped by consumer");
            return Ok(false);
        }
    }
}

/// Average interleaved frames down to one channel.
pub fn downmix(interleaved: &[f32], channels: usize) -> Vec<f32> {
    if channels <= 1 {
        return interleaved.to_vec();
    }
    interleaved
        .chunks_exact(channels)
        .map(|frame| frame.iter().sum::<f32>() / channels as f32)
        .collect()
}
