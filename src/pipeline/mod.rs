//! Frame hand-off to the downstream consumer

pub mod ringbuf;
pub mod sink;

pub use ringbuf::{FrameRingBuffer, RingSink, RingStats};
pub use sink::{FrameSink, YuvFrame};
