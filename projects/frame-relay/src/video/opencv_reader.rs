use super::VideoReader;
use anyhow::{anyhow, Result};
use opencv::{
    core::Mat,
    prelude::*,
    videoio::{
        VideoCapture, CAP_ANY, CAP_PROP_FPS, CAP_PROP_FRAME_COUNT, CAP_PROP_HW_ACCELERATION,
        VIDEO_ACCELERATION_ANY,
    },
};

pub struct OpencvReader {
    capture: VideoCapture,
    source_fps: f64,
    reported_frames: Option<u64>,
}

impl OpencvReader {
    pub fn new(path: &str) -> Result<Self> {
        let mut capture = VideoCapture::from_file(path, CAP_ANY)?;
        if !capture.is_opened()? {
            return Err(anyhow!("Failed to open video file: {}", path));
        }

        // Try to enable hardware decoding (VideoToolbox on macOS, VA-API on Linux, etc.)
        match capture.set(CAP_PROP_HW_ACCELERATION, VIDEO_ACCELERATION_ANY as f64) {
            Ok(true) => tracing::debug!("OpencvReader: hardware acceleration enabled"),
            _ => tracing::debug!("OpencvReader: hardware acceleration not available"),
        }

        let mut fps = capture.get(CAP_PROP_FPS)?;
        if fps <= 0.0 {
            tracing::warn!("OpencvReader: Failed to get FPS from metadata, falling back to 30.0");
            fps = 30.0;
        }
        let raw_count = capture.get(CAP_PROP_FRAME_COUNT)?;
        let reported_frames = (raw_count > 0.0).then_some(raw_count as u64);

        tracing::info!(
            "OpencvReader: opened {}, fps={:.2}, stream_frames={:?}",
            path,
            fps,
            reported_frames
        );

        Ok(Self {
            capture,
            source_fps: fps,
            reported_frames,
        })
    }
}

impl VideoReader for OpencvReader {
    fn frame_count(&self) -> Result<Option<u64>> {
        Ok(self.reported_frames)
    }

    fn source_fps(&self) -> Result<f64> {
        Ok(self.source_fps)
    }

    fn next_frame(&mut self) -> Result<Option<Mat>> {
        let mut frame = Mat::default();
        let success = self.capture.read(&mut frame)?;
        if !success || frame.empty() {
            return Ok(None);
        }
        Ok(Some(frame))
    }
}
