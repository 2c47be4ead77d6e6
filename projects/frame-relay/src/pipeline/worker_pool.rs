// Fixed-size pool of long-lived annotation worker threads

use crate::error::PipelineError;
use crate::pipeline::detection::DetectorFactory;
use crate::pipeline::detection_worker::{AnnotationWorker, WorkerHealth, WorkerSettings, WorkerStats};
use crate::queue::WorkQueue;
use crate::run_context::RunSlot;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

static NEXT_POOL_ID: AtomicU64 = AtomicU64::new(1);

pub struct WorkerPool {
    pub id: u64,
    stop: Arc<AtomicBool>,
    workers: Vec<(Arc<WorkerStats>, Option<JoinHandle<()>>)>,
}

impl WorkerPool {
    pub fn start(
        size: usize,
        queue: Arc<dyn WorkQueue>,
        runs: RunSlot,
        factory: Arc<dyn DetectorFactory>,
        settings: WorkerSettings,
    ) -> Result<Self, PipelineError> {
        let id = NEXT_POOL_ID.fetch_add(1, Ordering::Relaxed);
        let stop = Arc::new(AtomicBool::new(false));
        let mut pool = Self {
            id,
            stop: stop.clone(),
            workers: Vec::with_capacity(size),
        };

        for i in 0..size {
            let stats = Arc::new(WorkerStats::default());
            let worker = AnnotationWorker {
                id: i,
                queue: queue.clone(),
                runs: runs.clone(),
                factory: factory.clone(),
                settings: settings.clone(),
                stop: stop.clone(),
                stats: stats.clone(),
            };
            // On spawn failure `pool` is dropped, which stops the workers already running
            let handle = thread::Builder::new()
                .name(format!("annotation-worker-{}-{}", id, i))
                .spawn(move || worker.run())
                .map_err(|e| PipelineError::Internal(format!("failed to spawn worker: {}", e)))?;
            pool.workers.push((stats, Some(handle)));
        }

        tracing::info!(pool = id, "Started {} annotation workers", size);
        Ok(pool)
    }

    pub fn size(&self) -> usize {
        self.workers.len()
    }

    /// Ask every worker to stop after settling its current unit.
    pub fn request_stop(&self) {
        self.stop.store(true, Ordering::Release);
    }

    /// Stop and wait for every worker to exit.
    pub fn shutdown(&mut self) {
        self.request_stop();
        for (i, (_, handle)) in self.workers.iter_mut().enumerate() {
            if let Some(handle) = handle.take() {
                if handle.join().is_err() {
                    tracing::error!(pool = self.id, worker = i, "Annotation worker panicked");
                }
            }
        }
        tracing::info!(pool = self.id, "Worker pool stopped");
    }

    pub fn health(&self) -> Vec<WorkerHealth> {
        self.workers
            .iter()
            .enumerate()
            .map(|(i, (stats, _))| stats.health(i))
            .collect()
    }

    pub fn alive_workers(&self) -> usize {
        self.health().iter().filter(|h| h.alive).count()
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        if self.workers.iter().any(|(_, h)| h.is_some()) {
            self.shutdown();
        }
    }
}
