use super::{SinkFactory, VideoSink};
use anyhow::{anyhow, Result};
use opencv::{
    core::{Mat, Size},
    prelude::*,
    videoio::VideoWriter,
};
use std::path::Path;

/// Writes MPEG-4 video through OpenCV's `VideoWriter`.
pub struct OpencvWriter {
    writer: VideoWriter,
    released: bool,
}

impl VideoSink for OpencvWriter {
    fn write_frame(&mut self, frame: &Mat) -> Result<()> {
        self.writer.write(frame)?;
        Ok(())
    }

    fn release(&mut self) -> Result<()> {
        if !self.released {
            self.released = true;
            self.writer.release()?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy)]
pub struct OpencvSinkFactory {
    fourcc: [char; 4],
}

impl Default for OpencvSinkFactory {
    fn default() -> Self {
        Self {
            fourcc: ['m', 'p', '4', 'v'],
        }
    }
}

impl SinkFactory for OpencvSinkFactory {
    fn open(&self, path: &Path, fps: f64, frame_size: Size) -> Result<Box<dyn VideoSink>> {
        let path_str = path
            .to_str()
            .ok_or_else(|| anyhow!("Output path is not valid UTF-8: {:?}", path))?;
        let [a, b, c, d] = self.fourcc;
        let fourcc = VideoWriter::fourcc(a, b, c, d)?;
        let writer = VideoWriter::new(path_str, fourcc, fps, frame_size, true)?;
        if !writer.is_opened()? {
            return Err(anyhow!("Failed to open video writer at {}", path_str));
        }

        tracing::info!(
            "Opened video writer at {} ({}x{} @ {:.1} fps)",
            path_str,
            frame_size.width,
            frame_size.height,
            fps
        );

        Ok(Box::new(OpencvWriter {
            writer,
            released: false,
        }))
    }
}
