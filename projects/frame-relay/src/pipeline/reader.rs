// Frame source: decodes a video into sequence-numbered units and publishes them

use crate::error::{PipelineError, QueueError, SourceError};
use crate::pipeline::codec::encode_unit;
use crate::pipeline::types::FrameUnit;
use crate::queue::retry::retry_fixed;
use crate::queue::WorkQueue;
use crate::run_context::PipelineContext;
use crate::video::opencv_reader::OpencvReader;
use crate::video::VideoReader;
use opencv::core::Mat;
use std::path::Path;
use std::time::Duration;

/// Lazy, finite, non-restartable sequence of frame units in read order.
pub struct FrameSource {
    name: String,
    reader: Box<dyn VideoReader>,
    pending: Option<Mat>,
    next_sequence: u64,
    estimated_frames: Option<u64>,
    source_fps: f64,
    finished: bool,
}

impl FrameSource {
    /// Wrap a reader. The first frame is decoded here so that an empty or
    /// unreadable container is reported before anything is published.
    pub fn open(name: &str, mut reader: Box<dyn VideoReader>) -> Result<Self, SourceError> {
        let open_err = |e: anyhow::Error| SourceError::Open {
            name: name.to_string(),
            reason: e.to_string(),
        };
        let estimated_frames = reader.frame_count().map_err(open_err)?;
        let source_fps = reader.source_fps().map_err(open_err)?;
        let first = reader.next_frame().map_err(open_err)?;
        let Some(first) = first else {
            return Err(SourceError::Empty(name.to_string()));
        };

        Ok(Self {
            name: name.to_string(),
            reader,
            pending: Some(first),
            next_sequence: 0,
            estimated_frames,
            source_fps,
            finished: false,
        })
    }

    pub fn open_path(path: &Path) -> Result<Self, SourceError> {
        let name = path.display().to_string();
        let path_str = path.to_str().ok_or_else(|| SourceError::Open {
            name: name.clone(),
            reason: "path is not valid UTF-8".to_string(),
        })?;
        let reader = OpencvReader::new(path_str).map_err(|e| SourceError::Open {
            name: name.clone(),
            reason: e.to_string(),
        })?;
        Self::open(&name, Box::new(reader))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn estimated_frames(&self) -> Option<u64> {
        self.estimated_frames
    }

    pub fn source_fps(&self) -> f64 {
        self.source_fps
    }
}

impl Iterator for FrameSource {
    type Item = Result<FrameUnit, SourceError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }

        let image = match self.pending.take() {
            Some(image) => image,
            None => match self.reader.next_frame() {
                Ok(Some(image)) => image,
                Ok(None) => {
                    self.finished = true;
                    return None;
                }
                Err(e) => {
                    self.finished = true;
                    return Some(Err(SourceError::Read {
                        sequence_number: self.next_sequence,
                        reason: e.to_string(),
                    }));
                }
            },
        };

        let sequence_number = self.next_sequence;
        self.next_sequence += 1;
        Some(Ok(FrameUnit {
            sequence_number,
            image,
        }))
    }
}

/// Publish every unit of `source` for the run in `ctx`. Connectivity failures
/// are retried with `retry_delay` until the run is cancelled. Returns the
/// number of units published.
pub fn publish_frames(
    source: FrameSource,
    ctx: &PipelineContext,
    queue: &dyn WorkQueue,
    retry_delay: Duration,
) -> Result<u64, PipelineError> {
    let name = source.name().to_string();
    let cancelled = || ctx.is_cancelled();
    let mut published: u64 = 0;

    tracing::info!(run_id = ctx.run_id, "Publishing frames of {}", name);

    for item in source {
        if ctx.is_cancelled() {
            tracing::info!(
                run_id = ctx.run_id,
                "Run cancelled after {} frames, stopping publisher",
                published
            );
            return Ok(published);
        }

        let unit = match item {
            Ok(unit) => unit,
            Err(e) => {
                // Keep what was already published, the run finishes short
                tracing::warn!(run_id = ctx.run_id, "Stopped reading {}: {}", name, e);
                break;
            }
        };

        let payload = match encode_unit(ctx.run_id, &unit) {
            Ok(payload) => payload,
            Err(e) => {
                tracing::error!(
                    sequence_number = unit.sequence_number,
                    "Failed to encode frame: {}",
                    e
                );
                continue;
            }
        };

        let sent = match retry_fixed(
            "Publishing frame",
            retry_delay,
            &cancelled,
            |e: &QueueError| e.is_connectivity(),
            || queue.publish(&payload),
        ) {
            Ok(sent) => sent,
            Err(e) => {
                // The run ends with what made it onto the queue
                ctx.tracker.finalize_total(published);
                tracing::error!(
                    run_id = ctx.run_id,
                    sequence_number = unit.sequence_number,
                    "Publishing stopped after {} frames: {}",
                    published,
                    e
                );
                return Err(e.into());
            }
        };
        if sent.is_none() {
            tracing::info!(run_id = ctx.run_id, "Run cancelled while publishing");
            return Ok(published);
        }

        published += 1;
        ctx.tracker.report_enqueued(1);
        tracing::debug!(sequence_number = unit.sequence_number, "Frame enqueued");
    }

    ctx.tracker.finalize_total(published);
    tracing::info!(
        run_id = ctx.run_id,
        "Finished publishing {} frames of {}",
        published,
        name
    );
    Ok(published)
}
