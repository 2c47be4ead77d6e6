use thiserror::Error;

/// The video container could not be turned into frames.
#[derive(Error, Debug)]
pub enum SourceError {
    #[error("failed to open video {name}: {reason}")]
    Open { name: String, reason: String },

    #[error("video {0} contains no frames, nothing to process")]
    Empty(String),

    #[error("failed to read frame {sequence_number}: {reason}")]
    Read { sequence_number: u64, reason: String },
}

/// Errors raised by the work queue.
#[derive(Error, Debug)]
pub enum QueueError {
    /// The queue backend cannot be reached. Callers retry these with a fixed delay.
    #[error("work queue unavailable: {0}")]
    Unavailable(#[from] std::io::Error),

    #[error("prefetch limit of {0} reached, settle the outstanding delivery first")]
    PrefetchExceeded(usize),

    #[error("unknown delivery tag {0}")]
    UnknownDelivery(u64),

    #[error("work queue state lock poisoned")]
    Poisoned,
}

impl QueueError {
    pub fn is_connectivity(&self) -> bool {
        matches!(self, QueueError::Unavailable(_))
    }
}

#[derive(Error, Debug)]
pub enum DetectionError {
    #[error("detection request failed: {0}")]
    Transport(String),

    #[error("detection service returned HTTP {0}")]
    Status(u16),

    #[error("failed to decode detection response: {0}")]
    Decode(String),

    #[error("model inference failed: {0}")]
    Inference(String),
}

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("frame store i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to encode frame {sequence_number}: {reason}")]
    Encode { sequence_number: u64, reason: String },

    #[error("stored frame {0} could not be decoded")]
    Decode(u64),

    #[error("frame store for {0} has been cleared")]
    Cleared(String),
}

/// A single frame could not be annotated. The unit is dropped, the run continues.
#[derive(Error, Debug)]
pub enum FrameProcessingError {
    #[error("malformed frame payload: {0}")]
    Payload(String),

    #[error(transparent)]
    Detection(#[from] DetectionError),

    #[error("overlay failed: {0}")]
    Overlay(#[from] opencv::Error),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("frame processing panicked: {0}")]
    Panicked(String),
}

#[derive(Error, Debug)]
pub enum ReassemblyError {
    #[error("no frames found for video reconstruction")]
    NoFrames,

    #[error(
        "frame {sequence_number} is {actual_width}x{actual_height}, expected {expected_width}x{expected_height}"
    )]
    DimensionMismatch {
        sequence_number: u64,
        expected_width: i32,
        expected_height: i32,
        actual_width: i32,
        actual_height: i32,
    },

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("video writer error: {0}")]
    Writer(String),

    #[error("failed to move finished video into place: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("worker pool size must be at least 1")]
    NoWorkers,

    #[error("output frame rate must be positive, got {0}")]
    InvalidFps(f64),

    #[error("{name} must be within [0, 1], got {value}")]
    InvalidThreshold { name: &'static str, value: f32 },

    #[error("missing required setting: {0}")]
    Missing(&'static str),
}

/// Errors surfaced by pipeline operations to callers (CLI, HTTP handlers).
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error(transparent)]
    Source(#[from] SourceError),

    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Reassembly(#[from] ReassemblyError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("no run is active, upload a video first")]
    NoActiveRun,

    #[error("video not ready: {0}")]
    NotReady(String),

    #[error("run did not complete within {0:?}")]
    TimedOut(std::time::Duration),

    #[error("internal error: {0}")]
    Internal(String),
}
