//! Streaming answer text to spoken audio, one turn at a time.

pub mod consumer;
pub mod coordinator;
pub mod messages;
pub mod queue;
pub mod segmenter;
pub mod speech;
