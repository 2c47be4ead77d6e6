// Pipeline orchestrator: manages the run lifecycle
//
// Owns the work queue, the worker pools and the active run. Uploads, cancels
// and video builds are serialised; status queries only read atomics and the
// queue depth.

use crate::config::PipelineConfig;
use crate::error::{PipelineError, SourceError};
use crate::pipeline::detection::DetectorFactory;
use crate::pipeline::detection_worker::WorkerHealth;
use crate::pipeline::finalize::{ReassemblyReport, Reassembler};
use crate::pipeline::progress::ProgressSnapshot;
use crate::pipeline::reader::{publish_frames, FrameSource};
use crate::pipeline::store::clear_root;
use crate::pipeline::worker_pool::WorkerPool;
use crate::queue::{DiskQueue, WorkQueue};
use crate::run_context::{create_run, restore_latest_run, PipelineContext, RunMetadata, RunSlot};
use crate::video::opencv_writer::OpencvSinkFactory;
use crate::video::{SinkFactory, VideoReader};
use chrono::Utc;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Serialize)]
pub struct UploadReceipt {
    pub run_id: u64,
    pub source: String,
    pub estimated_frames: Option<u64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ConsumerStatus {
    pub pools: usize,
    pub alive: usize,
    pub workers: Vec<WorkerHealth>,
}

#[derive(Default)]
struct Lifecycle {
    last_run_id: u64,
}

pub struct Pipeline {
    config: PipelineConfig,
    queue: Arc<dyn WorkQueue>,
    factory: Arc<dyn DetectorFactory>,
    reassembler: Reassembler,
    runs: RunSlot,
    pools: Mutex<Vec<WorkerPool>>,
    lifecycle: Mutex<Lifecycle>,
}

fn poisoned(what: &str) -> PipelineError {
    PipelineError::Internal(format!("{} lock poisoned", what))
}

impl Pipeline {
    pub fn new(
        config: PipelineConfig,
        queue: Arc<dyn WorkQueue>,
        factory: Arc<dyn DetectorFactory>,
        sinks: Arc<dyn SinkFactory>,
    ) -> Result<Self, PipelineError> {
        config.validate()?;
        let reassembler = Reassembler::new(sinks, config.output_fps);
        let pipeline = Self {
            config,
            queue,
            factory,
            reassembler,
            runs: RunSlot::default(),
            pools: Mutex::new(Vec::new()),
            lifecycle: Mutex::new(Lifecycle::default()),
        };
        pipeline.recover_run()?;
        Ok(pipeline)
    }

    /// Make the newest run left in the store active again, so units recovered
    /// by the queue are annotated into it instead of being discarded.
    ///
    /// The source video is not read again. The run's total becomes the frames
    /// already stored plus the units still queued.
    fn recover_run(&self) -> Result<(), PipelineError> {
        let mut lifecycle = self.lock_lifecycle()?;
        let Some(ctx) = restore_latest_run(&self.config.store_root)? else {
            return Ok(());
        };

        let stored = ctx.store.keys()?.len() as u64;
        let pending = self.queue.depth()? as u64;
        ctx.tracker.report_enqueued(stored + pending);
        ctx.tracker.report_completed(stored);
        ctx.tracker.finalize_total(stored + pending);

        tracing::info!(
            run_id = ctx.run_id,
            "Resumed run for {}: {} frames stored, {} still queued",
            ctx.metadata.original_name,
            stored,
            pending
        );
        lifecycle.last_run_id = ctx.run_id;
        self.runs.replace(Some(Arc::new(ctx)))?;
        Ok(())
    }

    /// Production wiring: disk queue, configured detector backend, OpenCV writer.
    pub fn open(config: PipelineConfig) -> Result<Self, PipelineError> {
        let queue = Arc::new(DiskQueue::open(&config.queue_dir)?);
        let factory = Arc::new(config.backend.clone());
        Self::new(config, queue, factory, Arc::new(OpencvSinkFactory::default()))
    }

    pub fn current_run(&self) -> Option<Arc<PipelineContext>> {
        self.runs.current()
    }

    fn lock_lifecycle(&self) -> Result<MutexGuard<'_, Lifecycle>, PipelineError> {
        self.lifecycle.lock().map_err(|_| poisoned("lifecycle"))
    }

    /// Start a run from a video file on disk.
    pub fn upload(&self, path: &Path) -> Result<UploadReceipt, PipelineError> {
        self.start_run(|| FrameSource::open_path(path))
    }

    /// Start a run from an already opened reader.
    pub fn upload_reader(
        &self,
        name: &str,
        reader: Box<dyn VideoReader>,
    ) -> Result<UploadReceipt, PipelineError> {
        self.start_run(|| FrameSource::open(name, reader))
    }

    fn start_run(
        &self,
        open: impl FnOnce() -> Result<FrameSource, SourceError>,
    ) -> Result<UploadReceipt, PipelineError> {
        let mut lifecycle = self.lock_lifecycle()?;

        // Nothing from the previous run may leak into this one
        self.reset()?;

        let source = open()?;

        let now = Utc::now();
        let run_id = (now.timestamp_micros().max(0) as u64).max(lifecycle.last_run_id + 1);
        lifecycle.last_run_id = run_id;

        let metadata = RunMetadata {
            original_name: source.name().to_string(),
            created_at: now,
            run_id,
            estimated_frames: source.estimated_frames(),
            source_fps: source.source_fps(),
        };
        let ctx = Arc::new(create_run(&self.config.store_root, metadata)?);
        self.runs.replace(Some(ctx.clone()))?;

        let receipt = UploadReceipt {
            run_id,
            source: source.name().to_string(),
            estimated_frames: source.estimated_frames(),
        };

        let queue = self.queue.clone();
        let retry_delay = self.config.retry_delay;
        let publisher = ctx.clone();
        thread::Builder::new()
            .name(format!("frame-source-{}", run_id))
            .spawn(move || {
                if let Err(e) = publish_frames(source, &publisher, queue.as_ref(), retry_delay) {
                    tracing::error!(run_id = publisher.run_id, "Frame publisher failed: {}", e);
                }
            })
            .map_err(|e| PipelineError::Internal(format!("failed to spawn publisher: {}", e)))?;

        tracing::info!(
            run_id,
            "Upload accepted: {} (~{:?} frames)",
            receipt.source,
            receipt.estimated_frames
        );
        Ok(receipt)
    }

    /// Cancel the active run, purge the queue and clear the frame store.
    /// Callers hold the lifecycle lock.
    fn reset(&self) -> Result<(), PipelineError> {
        if let Some(previous) = self.runs.replace(None)? {
            previous.cancel();
            tracing::info!(run_id = previous.run_id, "Run cancelled");
        }
        let purged = self.queue.purge()?;
        let cleared = clear_root(&self.config.store_root)?;
        if purged > 0 || cleared > 0 {
            tracing::info!(
                "Reset pipeline: purged {} queued frames, cleared {} run stores",
                purged,
                cleared
            );
        }
        Ok(())
    }

    /// Stop the active run and empty the queue and the frame store. Idempotent.
    pub fn cancel(&self) -> Result<(), PipelineError> {
        let _lifecycle = self.lock_lifecycle()?;
        self.reset()
    }

    /// Drop every undelivered unit without touching the run or the store.
    pub fn purge_queue(&self) -> Result<usize, PipelineError> {
        let purged = self.queue.purge()?;
        tracing::info!("Purged {} frames from the work queue", purged);
        Ok(purged)
    }

    pub fn status(&self) -> Result<ProgressSnapshot, PipelineError> {
        let depth = self.queue.depth()?;
        Ok(match self.runs.current() {
            Some(ctx) => ctx.tracker.snapshot(depth),
            None => ProgressSnapshot {
                queue_depth: depth,
                ..ProgressSnapshot::idle()
            },
        })
    }

    /// Start a pool of `workers` (default from config) competing for the queue.
    /// Returns the number of workers now running across all pools.
    pub fn start_consumers(&self, workers: Option<usize>) -> Result<usize, PipelineError> {
        let size = workers.unwrap_or(self.config.workers);
        if size == 0 {
            return Err(crate::error::ConfigError::NoWorkers.into());
        }
        let pool = WorkerPool::start(
            size,
            self.queue.clone(),
            self.runs.clone(),
            self.factory.clone(),
            self.config.worker_settings(),
        )?;
        let mut pools = self.pools.lock().map_err(|_| poisoned("worker pools"))?;
        pools.push(pool);
        Ok(pools.iter().map(WorkerPool::size).sum())
    }

    /// Stop every pool, letting in-flight units finish. Returns how many workers stopped.
    pub fn stop_consumers(&self) -> Result<usize, PipelineError> {
        let pools = {
            let mut pools = self.pools.lock().map_err(|_| poisoned("worker pools"))?;
            std::mem::take(&mut *pools)
        };
        let mut stopped = 0;
        for mut pool in pools {
            pool.request_stop();
            stopped += pool.size();
            pool.shutdown();
        }
        Ok(stopped)
    }

    pub fn consumer_status(&self) -> Result<ConsumerStatus, PipelineError> {
        let pools = self.pools.lock().map_err(|_| poisoned("worker pools"))?;
        let workers: Vec<WorkerHealth> = pools.iter().flat_map(WorkerPool::health).collect();
        Ok(ConsumerStatus {
            pools: pools.len(),
            alive: workers.iter().filter(|w| w.alive).count(),
            workers,
        })
    }

    /// Reassemble the active run's stored frames into the configured output file.
    pub fn generate_video(&self) -> Result<ReassemblyReport, PipelineError> {
        let _lifecycle = self.lock_lifecycle()?;
        let ctx = self.runs.current().ok_or(PipelineError::NoActiveRun)?;
        tracing::info!(
            run_id = ctx.run_id,
            "Building video for {} (source {:.2} fps)",
            ctx.metadata.original_name,
            ctx.metadata.source_fps
        );
        let expected = ctx
            .tracker
            .is_total_final()
            .then(|| ctx.tracker.total());
        let report = self
            .reassembler
            .build_video(&ctx.store, &self.config.output_path, expected)?;
        ctx.record_build(report.clone());
        Ok(report)
    }

    /// Path of the latest video built for the active run.
    pub fn video_artifact(&self) -> Result<PathBuf, PipelineError> {
        let ctx = self.runs.current().ok_or(PipelineError::NoActiveRun)?;
        let report = ctx.last_build().ok_or_else(|| {
            PipelineError::NotReady(format!("no video has been generated for run {}", ctx.run_id))
        })?;
        if !report.output_path.is_file() {
            return Err(PipelineError::NotReady(format!(
                "{} no longer exists",
                report.output_path.display()
            )));
        }
        Ok(report.output_path)
    }

    /// Block until the active run completes, reporting every snapshot.
    pub fn wait_for_completion(
        &self,
        poll: Duration,
        timeout: Option<Duration>,
        mut on_progress: impl FnMut(&ProgressSnapshot),
    ) -> Result<ProgressSnapshot, PipelineError> {
        let start = Instant::now();
        loop {
            if self.runs.current().is_none() {
                return Err(PipelineError::NoActiveRun);
            }
            let snapshot = self.status()?;
            on_progress(&snapshot);
            if snapshot.completed {
                return Ok(snapshot);
            }
            if let Some(timeout) = timeout {
                if start.elapsed() >= timeout {
                    return Err(PipelineError::TimedOut(timeout));
                }
            }
            thread::sleep(poll);
        }
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        // Let a running publisher stop; the pools stop when dropped
        if let Some(ctx) = self.runs.current() {
            ctx.cancel();
        }
    }
}
