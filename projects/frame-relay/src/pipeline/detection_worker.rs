use crate::error::{DetectionError, FrameProcessingError, QueueError, StoreError};
use crate::pipeline::annotate::{annotate, ColorMode};
use crate::pipeline::codec::{decode_header, decode_unit};
use crate::pipeline::detection::{Detector, DetectorFactory};
use crate::pipeline::types::AnnotationResult;
use crate::queue::retry::{retry_fixed, sleep_unless};
use crate::queue::{QueueConsumer, WorkQueue};
use crate::run_context::{PipelineContext, RunSlot};
use opencv::prelude::*;
use serde::Serialize;
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(Debug, Clone)]
pub struct WorkerSettings {
    pub confidence: f32,
    pub overlap: f32,
    pub color_mode: ColorMode,
    pub retry_delay: Duration,
    /// How long one consume wait lasts before the stop flag is checked again.
    pub poll_interval: Duration,
}

#[derive(Default)]
pub struct WorkerStats {
    alive: AtomicBool,
    processed: AtomicU64,
    failed: AtomicU64,
    discarded: AtomicU64,
}

#[derive(Debug, Clone, Serialize)]
pub struct WorkerHealth {
    pub id: usize,
    pub alive: bool,
    pub processed: u64,
    pub failed: u64,
    pub discarded: u64,
}

impl WorkerStats {
    pub fn health(&self, id: usize) -> WorkerHealth {
        WorkerHealth {
            id,
            alive: self.alive.load(Ordering::Acquire),
            processed: self.processed.load(Ordering::Acquire),
            failed: self.failed.load(Ordering::Acquire),
            discarded: self.discarded.load(Ordering::Acquire),
        }
    }
}

/// What happens to a delivery once its handler returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Processed and stored.
    Ack,
    /// Belongs to a run that is no longer active. Acked without processing.
    Discard,
    /// Unrecoverable for this frame. Nacked without requeue.
    Reject,
}

/// Clears the `alive` flag however the worker thread exits.
struct AliveGuard<'a>(&'a AtomicBool);

impl<'a> AliveGuard<'a> {
    fn set(flag: &'a AtomicBool) -> Self {
        flag.store(true, Ordering::Release);
        Self(flag)
    }
}

impl Drop for AliveGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}

/// Decode, detect, draw and store one frame unit.
pub fn process_unit(
    payload: &[u8],
    ctx: &PipelineContext,
    detector: &mut dyn Detector,
    settings: &WorkerSettings,
) -> Result<AnnotationResult, FrameProcessingError> {
    let (_, unit) = decode_unit(payload)?;
    let detections = detector.predict(&unit.image, settings.confidence, settings.overlap)?;
    if let Some(bad) = detections.iter().find(|d| !d.is_finite()) {
        return Err(DetectionError::Decode(format!(
            "non-finite box for {} at ({}, {}, {}x{})",
            bad.class_label, bad.x, bad.y, bad.width, bad.height
        ))
        .into());
    }
    let (image, detections_drawn) = annotate(
        &unit.image,
        &detections,
        settings.confidence,
        settings.color_mode,
    )?;
    ctx.store.write(unit.sequence_number, &image)?;
    Ok(AnnotationResult {
        sequence_number: unit.sequence_number,
        image,
        detections_drawn,
    })
}

/// Long-lived consumer: one queue consumer and one detector per worker.
pub struct AnnotationWorker {
    pub id: usize,
    pub queue: Arc<dyn WorkQueue>,
    pub runs: RunSlot,
    pub factory: Arc<dyn DetectorFactory>,
    pub settings: WorkerSettings,
    pub stop: Arc<AtomicBool>,
    pub stats: Arc<WorkerStats>,
}

impl AnnotationWorker {
    fn stopping(&self) -> bool {
        self.stop.load(Ordering::Acquire)
    }

    /// Consume until a stop is requested. The in-flight unit is always settled first.
    pub fn run(self) {
        let alive = AliveGuard::set(&self.stats.alive);
        tracing::info!(worker = self.id, "Annotation worker started");

        if let Some((mut detector, mut consumer)) = self.connect() {
            self.consume(detector.as_mut(), consumer.as_mut());
        }

        drop(alive);
        tracing::info!(
            worker = self.id,
            processed = self.stats.processed.load(Ordering::Relaxed),
            failed = self.stats.failed.load(Ordering::Relaxed),
            "Annotation worker stopped"
        );
    }

    fn connect(&self) -> Option<(Box<dyn Detector>, Box<dyn QueueConsumer>)> {
        let stopping = || self.stopping();

        let detector = match retry_fixed(
            "Creating detector",
            self.settings.retry_delay,
            &stopping,
            |_: &anyhow::Error| true,
            || self.factory.create(),
        ) {
            Ok(Some(detector)) => detector,
            Ok(None) => return None,
            Err(e) => {
                tracing::error!(worker = self.id, "Failed to create detector: {}", e);
                return None;
            }
        };

        match retry_fixed(
            "Opening queue consumer",
            self.settings.retry_delay,
            &stopping,
            QueueError::is_connectivity,
            || self.queue.open_consumer(1),
        ) {
            Ok(Some(consumer)) => Some((detector, consumer)),
            Ok(None) => None,
            Err(e) => {
                tracing::error!(worker = self.id, "Failed to open queue consumer: {}", e);
                None
            }
        }
    }

    fn consume(&self, detector: &mut dyn Detector, consumer: &mut dyn QueueConsumer) {
        let stopping = || self.stopping();

        while !self.stopping() {
            let delivery = match consumer.next_delivery(self.settings.poll_interval) {
                Ok(Some(delivery)) => delivery,
                Ok(None) => continue,
                Err(e) => {
                    tracing::warn!(
                        worker = self.id,
                        "Consume failed: {}. Retrying in {:?}",
                        e,
                        self.settings.retry_delay
                    );
                    sleep_unless(self.settings.retry_delay, &stopping);
                    continue;
                }
            };

            if delivery.redelivered {
                tracing::debug!(worker = self.id, tag = delivery.tag, "Processing redelivered unit");
            }
            let disposition = self.handle(detector, &delivery.payload);
            let settled = match disposition {
                Disposition::Ack | Disposition::Discard => consumer.ack(delivery.tag),
                Disposition::Reject => consumer.nack(delivery.tag, false),
            };
            if let Err(e) = settled {
                tracing::warn!(
                    worker = self.id,
                    tag = delivery.tag,
                    "Failed to settle delivery: {}",
                    e
                );
            }
        }
    }

    pub fn handle(&self, detector: &mut dyn Detector, payload: &[u8]) -> Disposition {
        let header = match decode_header(payload) {
            Ok(header) => header,
            Err(e) => {
                tracing::error!(worker = self.id, "Dropping unreadable unit: {}", e);
                self.stats.failed.fetch_add(1, Ordering::AcqRel);
                return Disposition::Reject;
            }
        };

        let Some(ctx) = self.runs.lookup(header.run_id) else {
            tracing::warn!(
                worker = self.id,
                run_id = header.run_id,
                sequence_number = header.sequence_number,
                "Discarding unit from inactive run"
            );
            self.stats.discarded.fetch_add(1, Ordering::AcqRel);
            return Disposition::Discard;
        };

        let start = Instant::now();
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
            process_unit(payload, &ctx, detector, &self.settings)
        }))
        .unwrap_or_else(|p| Err(FrameProcessingError::Panicked(panic_message(p.as_ref()))));

        match outcome {
            Ok(result) => {
                ctx.tracker.report_completed(1);
                self.stats.processed.fetch_add(1, Ordering::AcqRel);
                tracing::debug!(
                    worker = self.id,
                    sequence_number = result.sequence_number,
                    detections = result.detections_drawn,
                    width = result.image.cols(),
                    height = result.image.rows(),
                    elapsed_ms = start.elapsed().as_millis() as u64,
                    "Frame annotated"
                );
                Disposition::Ack
            }
            Err(FrameProcessingError::Store(StoreError::Cleared(_))) if ctx.is_cancelled() => {
                tracing::warn!(
                    worker = self.id,
                    sequence_number = header.sequence_number,
                    "Run cancelled while frame was in flight, result dropped"
                );
                self.stats.discarded.fetch_add(1, Ordering::AcqRel);
                Disposition::Discard
            }
            Err(e) => {
                tracing::error!(
                    worker = self.id,
                    sequence_number = header.sequence_number,
                    "Frame processing failed: {}",
                    e
                );
                ctx.tracker
                    .report_failed(Some(header.sequence_number), e.to_string());
                self.stats.failed.fetch_add(1, Ordering::AcqRel);
                Disposition::Reject
            }
        }
    }
}
