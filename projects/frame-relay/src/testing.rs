// Shared test doubles: synthetic videos, stub detectors, recording sinks

use crate::config::PipelineConfig;
use crate::error::{DetectionError, QueueError};
use crate::pipeline::detection::Detector;
use crate::pipeline::orchestrator::Pipeline;
use crate::pipeline::types::Detection;
use crate::queue::{DiskQueue, QueueConsumer, WorkQueue};
use crate::run_context::{create_run, PipelineContext, RunMetadata};
use crate::video::{SinkFactory, VideoReader, VideoSink};
use anyhow::{anyhow, Result};
use opencv::core::{Mat, Scalar, Size, Vec3b, CV_8UC3};
use opencv::prelude::*;
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc::Receiver;
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub const FRAME_WIDTH: i32 = 32;
pub const FRAME_HEIGHT: i32 = 24;

/// Solid frame whose blue/green channels encode `index + base`.
pub fn synthetic_frame(index: u64, base: u64, width: i32, height: i32) -> Mat {
    let value = index + base;
    Mat::new_rows_cols_with_default(
        height,
        width,
        CV_8UC3,
        Scalar::new((value % 256) as f64, ((value / 256) % 256) as f64, 0.0, 0.0),
    )
    .unwrap()
}

/// Inverse of `synthetic_frame`, read from the top-left pixel.
pub fn frame_value(image: &Mat) -> u64 {
    let px = *image.at_2d::<Vec3b>(0, 0).unwrap();
    px[1] as u64 * 256 + px[0] as u64
}

/// In-memory video of solid frames.
pub struct SyntheticReader {
    frames: u64,
    next: u64,
    base: u64,
    width: i32,
    height: i32,
    fail_at: Option<u64>,
    gate: Option<(u64, Receiver<()>)>,
}

impl SyntheticReader {
    pub fn new(frames: u64) -> Self {
        Self {
            frames,
            next: 0,
            base: 0,
            width: FRAME_WIDTH,
            height: FRAME_HEIGHT,
            fail_at: None,
            gate: None,
        }
    }

    /// Offset encoded pixel values, to tell two videos apart.
    pub fn with_base(mut self, base: u64) -> Self {
        self.base = base;
        self
    }

    pub fn failing_at(mut self, index: u64) -> Self {
        self.fail_at = Some(index);
        self
    }

    /// Block before decoding frame `index` until the sender is dropped or signals.
    pub fn gated_at(mut self, index: u64, gate: Receiver<()>) -> Self {
        self.gate = Some((index, gate));
        self
    }
}

impl VideoReader for SyntheticReader {
    fn frame_count(&self) -> Result<Option<u64>> {
        Ok(Some(self.frames))
    }

    fn source_fps(&self) -> Result<f64> {
        Ok(25.0)
    }

    fn next_frame(&mut self) -> Result<Option<Mat>> {
        if self.next >= self.frames {
            return Ok(None);
        }
        if self.fail_at == Some(self.next) {
            return Err(anyhow!("corrupt packet at frame {}", self.next));
        }
        if let Some((index, gate)) = &self.gate {
            if *index == self.next {
                let _ = gate.recv();
            }
        }
        let frame = synthetic_frame(self.next, self.base, self.width, self.height);
        self.next += 1;
        Ok(Some(frame))
    }
}

/// Always returns the same detections.
pub struct StubDetector {
    pub detections: Vec<Detection>,
}

impl Detector for StubDetector {
    fn predict(
        &mut self,
        _image: &Mat,
        _confidence: f32,
        _overlap: f32,
    ) -> Result<Vec<Detection>, DetectionError> {
        Ok(self.detections.clone())
    }
}

/// Fails on the frames whose encoded index is in `fail_on`, detects nothing otherwise.
pub struct FailingDetector {
    pub fail_on: HashSet<u64>,
}

impl Detector for FailingDetector {
    fn predict(
        &mut self,
        image: &Mat,
        _confidence: f32,
        _overlap: f32,
    ) -> Result<Vec<Detection>, DetectionError> {
        let index = frame_value(image);
        if self.fail_on.contains(&index) {
            return Err(DetectionError::Inference(format!(
                "model crashed on frame {}",
                index
            )));
        }
        Ok(Vec::new())
    }
}

/// Panics on the frames whose encoded index is in `panic_on`.
pub struct PanickingDetector {
    pub panic_on: HashSet<u64>,
}

impl Detector for PanickingDetector {
    fn predict(
        &mut self,
        image: &Mat,
        _confidence: f32,
        _overlap: f32,
    ) -> Result<Vec<Detection>, DetectionError> {
        let index = frame_value(image);
        if self.panic_on.contains(&index) {
            panic!("detector blew up on frame {}", index);
        }
        Ok(Vec::new())
    }
}

#[derive(Debug, Clone, Default)]
pub struct Recording {
    pub frames: Vec<u64>,
    pub frame_size: Option<Size>,
    pub fps: f64,
    pub released: usize,
}

/// Sink factory that records what would have been encoded.
#[derive(Clone, Default)]
pub struct RecordingSinkFactory {
    pub recording: Arc<Mutex<Recording>>,
}

impl RecordingSinkFactory {
    pub fn snapshot(&self) -> Recording {
        self.recording.lock().unwrap().clone()
    }
}

struct RecordingSink {
    path: PathBuf,
    recording: Arc<Mutex<Recording>>,
}

impl VideoSink for RecordingSink {
    fn write_frame(&mut self, frame: &Mat) -> Result<()> {
        self.recording.lock().unwrap().frames.push(frame_value(frame));
        Ok(())
    }

    fn release(&mut self) -> Result<()> {
        let mut recording = self.recording.lock().unwrap();
        recording.released += 1;
        fs::write(&self.path, format!("{:?}", recording.frames))?;
        Ok(())
    }
}

impl SinkFactory for RecordingSinkFactory {
    fn open(&self, path: &Path, fps: f64, frame_size: Size) -> Result<Box<dyn VideoSink>> {
        {
            let mut recording = self.recording.lock().unwrap();
            *recording = Recording {
                fps,
                frame_size: Some(frame_size),
                ..Recording::default()
            };
        }
        fs::write(path, b"")?;
        Ok(Box::new(RecordingSink {
            path: path.to_path_buf(),
            recording: self.recording.clone(),
        }))
    }
}

/// Disk queue whose first `failures` publishes report the backend unavailable.
pub struct FlakyQueue {
    inner: DiskQueue,
    remaining: AtomicUsize,
    injected: AtomicUsize,
}

impl FlakyQueue {
    pub fn new(inner: DiskQueue, failures: usize) -> Self {
        Self {
            inner,
            remaining: AtomicUsize::new(failures),
            injected: AtomicUsize::new(0),
        }
    }

    pub fn failures_injected(&self) -> usize {
        self.injected.load(Ordering::SeqCst)
    }
}

impl WorkQueue for FlakyQueue {
    fn publish(&self, payload: &[u8]) -> Result<(), QueueError> {
        let fail = self
            .remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if fail {
            self.injected.fetch_add(1, Ordering::SeqCst);
            return Err(QueueError::Unavailable(std::io::Error::other(
                "connection refused",
            )));
        }
        self.inner.publish(payload)
    }

    fn open_consumer(&self, prefetch: usize) -> Result<Box<dyn QueueConsumer>, QueueError> {
        self.inner.open_consumer(prefetch)
    }

    fn purge(&self) -> Result<usize, QueueError> {
        self.inner.purge()
    }

    fn depth(&self) -> Result<usize, QueueError> {
        self.inner.depth()
    }
}

/// A fresh run context with its store under `root/store`.
pub fn test_context(root: &Path, run_id: u64) -> PipelineContext {
    create_run(
        &root.join("store"),
        RunMetadata {
            original_name: "synthetic.mp4".to_string(),
            created_at: chrono::Utc::now(),
            run_id,
            estimated_frames: None,
            source_fps: 25.0,
        },
    )
    .unwrap()
}

/// Pipeline over a disk queue under `root`, with a detector that fails on the
/// frames in `failing` and a recording video sink.
pub fn test_pipeline(root: &Path, failing: &[u64]) -> (Pipeline, RecordingSinkFactory) {
    let mut config = PipelineConfig::with_root(root);
    config.retry_delay = Duration::from_millis(5);
    config.poll_interval = Duration::from_millis(20);

    let fail_on: HashSet<u64> = failing.iter().copied().collect();
    let factory = move || -> Result<Box<dyn Detector>> {
        Ok(Box::new(FailingDetector {
            fail_on: fail_on.clone(),
        }))
    };
    let sinks = RecordingSinkFactory::default();
    let queue = Arc::new(DiskQueue::open(&config.queue_dir).unwrap());
    let pipeline =
        Pipeline::new(config, queue, Arc::new(factory), Arc::new(sinks.clone())).unwrap();
    (pipeline, sinks)
}
