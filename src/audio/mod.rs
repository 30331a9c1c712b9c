//! Audio-side building blocks: the jitter ring buffer and the device seam.

pub mod buffer;
pub mod device;

pub use buffer::RingBuffer;
pub use device::{CaptureSource, PlaybackSink};
