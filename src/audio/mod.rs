//! Audio output: device seam, per-turn sink, filler clips and decoding.

#[cfg(feature = "speaker")]
pub mod decode;
pub mod device;
pub mod filler;
pub mod memory;
pub mod sink;
#[cfg(feature = "speaker")]
pub mod speaker;

pub use device::{AudioOutput, DeviceEvent, PlaybackDevice};
pub use filler::{FillerAudioController, FillerOutcome, FillerSource};
pub use memory::MemoryOutput;
pub use sink::{AudioChunkSink, PlaybackState};
#[cfg(feature = "speaker")]
pub use speaker::SpeakerOutput;
