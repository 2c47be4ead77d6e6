pub mod opencv_reader;
pub mod opencv_writer;

use anyhow::Result;
use opencv::core::{Mat, Size};
use std::path::Path;

pub trait VideoReader: Send {
    /// Frame count reported by the container. Only an estimate for many formats.
    fn frame_count(&self) -> Result<Option<u64>>;
    fn source_fps(&self) -> Result<f64>;
    /// Next decoded frame (BGR), or `None` at end of stream.
    fn next_frame(&mut self) -> Result<Option<Mat>>;
}

/// Destination for an ordered frame sequence.
pub trait VideoSink {
    fn write_frame(&mut self, frame: &Mat) -> Result<()>;
    /// Flush and close the container. Must be safe to call once on every exit path.
    fn release(&mut self) -> Result<()>;
}

pub trait SinkFactory: Send + Sync {
    fn open(&self, path: &Path, fps: f64, frame_size: Size) -> Result<Box<dyn VideoSink>>;
}
