//! Audio-side components: chunk processing and adaptive buffering

pub mod buffer;
pub mod processor;

pub use buffer::{AdaptiveBufferController, AudioCounters, BufferAdjustment, BufferState};
pub use processor::{ChunkProcessor, PcmGainProcessor};
