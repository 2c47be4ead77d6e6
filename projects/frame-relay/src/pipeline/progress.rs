use crate::pipeline::types::FrameFailure;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Instant;

/// How many recent per-frame failures are kept for the status API.
const RECENT_FAILURES: usize = 20;

/// Shared counters for one run. Written by the frame source and the workers,
/// read by status queries.
pub struct ProgressTracker {
    pub run_id: u64,
    total: AtomicU64,
    total_final: AtomicBool,
    enqueued: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    recent_failures: Mutex<VecDeque<FrameFailure>>,
    start_time: Instant,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProgressSnapshot {
    pub run_id: u64,
    /// Frames published so far.
    pub progress: u64,
    pub total_frames: u64,
    pub completed: bool,
    pub queue_depth: usize,
    pub frames_completed: u64,
    pub frames_failed: u64,
    pub recent_failures: Vec<FrameFailure>,
    pub elapsed_secs: f64,
    pub frames_per_second: f64,
}

impl ProgressTracker {
    pub fn new(run_id: u64) -> Self {
        Self {
            run_id,
            total: AtomicU64::new(0),
            total_final: AtomicBool::new(false),
            enqueued: AtomicU64::new(0),
            completed: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            recent_failures: Mutex::new(VecDeque::with_capacity(RECENT_FAILURES)),
            start_time: Instant::now(),
        }
    }

    /// Provisional total from container metadata. Ignored once the total is final.
    pub fn set_estimated_total(&self, total: u64) {
        if !self.total_final.load(Ordering::Acquire) {
            self.total.store(total, Ordering::Release);
        }
    }

    /// Fix the total to the number of units actually published.
    pub fn finalize_total(&self, total: u64) {
        self.total.store(total, Ordering::Release);
        self.total_final.store(true, Ordering::Release);
    }

    pub fn report_enqueued(&self, n: u64) {
        self.enqueued.fetch_add(n, Ordering::AcqRel);
    }

    pub fn report_completed(&self, n: u64) {
        self.completed.fetch_add(n, Ordering::AcqRel);
    }

    pub fn report_failed(&self, sequence_number: Option<u64>, error: impl Into<String>) {
        self.failed.fetch_add(1, Ordering::AcqRel);
        if let Ok(mut recent) = self.recent_failures.lock() {
            if recent.len() == RECENT_FAILURES {
                recent.pop_front();
            }
            recent.push_back(FrameFailure {
                sequence_number,
                error: error.into(),
            });
        }
    }

    pub fn total(&self) -> u64 {
        self.total.load(Ordering::Acquire)
    }

    pub fn is_total_final(&self) -> bool {
        self.total_final.load(Ordering::Acquire)
    }

    /// Build a status snapshot. `completed` is derived here on every call.
    pub fn snapshot(&self, queue_depth: usize) -> ProgressSnapshot {
        let total_final = self.is_total_final();
        let total = self.total();
        let enqueued = self.enqueued.load(Ordering::Acquire);
        let completed = self.completed.load(Ordering::Acquire);
        let failed = self.failed.load(Ordering::Acquire);

        let done = total_final && total > 0 && completed + failed >= total && queue_depth == 0;

        let elapsed_secs = self.start_time.elapsed().as_secs_f64();
        let frames_per_second = if elapsed_secs > 0.0 {
            completed as f64 / elapsed_secs
        } else {
            0.0
        };

        let recent_failures = self
            .recent_failures
            .lock()
            .map(|r| r.iter().cloned().collect())
            .unwrap_or_default();

        ProgressSnapshot {
            run_id: self.run_id,
            progress: enqueued,
            total_frames: total,
            completed: done,
            queue_depth,
            frames_completed: completed,
            frames_failed: failed,
            recent_failures,
            elapsed_secs,
            frames_per_second,
        }
    }
}

impl ProgressSnapshot {
    /// Status reported before the first upload.
    pub fn idle() -> Self {
        Self {
            run_id: 0,
            progress: 0,
            total_frames: 0,
            completed: false,
            queue_depth: 0,
            frames_completed: 0,
            frames_failed: 0,
            recent_failures: Vec::new(),
            elapsed_secs: 0.0,
            frames_per_second: 0.0,
        }
    }
}
