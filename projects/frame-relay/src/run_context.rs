use crate::error::{PipelineError, StoreError};
use crate::pipeline::finalize::ReassemblyReport;
use crate::pipeline::progress::ProgressTracker;
use crate::pipeline::store::{run_dirs, FrameStore};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct RunMetadata {
    pub original_name: String,
    pub created_at: DateTime<Utc>,
    pub run_id: u64,
    pub estimated_frames: Option<u64>,
    pub source_fps: f64,
}

/// Everything that belongs to one upload. Handed to the frame source and to
/// every worker; replaced wholesale when the next upload starts.
pub struct PipelineContext {
    pub run_id: u64,
    pub metadata: RunMetadata,
    pub tracker: ProgressTracker,
    pub store: FrameStore,
    cancelled: AtomicBool,
    last_build: Mutex<Option<ReassemblyReport>>,
}

impl PipelineContext {
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    pub fn last_build(&self) -> Option<ReassemblyReport> {
        self.last_build.lock().ok().and_then(|b| b.clone())
    }

    pub fn record_build(&self, report: ReassemblyReport) {
        if let Ok(mut last) = self.last_build.lock() {
            *last = Some(report);
        }
    }
}

const METADATA_FILE: &str = "metadata.json";

fn context(store: FrameStore, metadata: RunMetadata) -> PipelineContext {
    let tracker = ProgressTracker::new(metadata.run_id);
    if let Some(estimate) = metadata.estimated_frames {
        tracker.set_estimated_total(estimate);
    }

    PipelineContext {
        run_id: metadata.run_id,
        metadata,
        tracker,
        store,
        cancelled: AtomicBool::new(false),
        last_build: Mutex::new(None),
    }
}

/// Create the run directory and write its `metadata.json`.
pub fn create_run(store_root: &Path, metadata: RunMetadata) -> Result<PipelineContext, StoreError> {
    let store = FrameStore::create(store_root, metadata.run_id)?;

    let content = serde_json::to_string_pretty(&metadata)
        .map_err(|e| StoreError::Io(std::io::Error::other(e)))?;
    fs::write(store.dir().join(METADATA_FILE), content)?;

    Ok(context(store, metadata))
}

/// Reopen the newest run under `store_root` left behind by a previous process.
///
/// Run directories without readable metadata are skipped. Progress counters
/// start from zero except for the estimate; callers re-derive the rest from
/// the store and the queue.
pub fn restore_latest_run(store_root: &Path) -> Result<Option<PipelineContext>, StoreError> {
    let mut latest: Option<RunMetadata> = None;
    for dir in run_dirs(store_root)? {
        let path = dir.join(METADATA_FILE);
        let metadata = match fs::read_to_string(&path)
            .map_err(|e| e.to_string())
            .and_then(|content| {
                serde_json::from_str::<RunMetadata>(&content).map_err(|e| e.to_string())
            }) {
            Ok(metadata) => metadata,
            Err(e) => {
                tracing::warn!("Ignoring run directory {}: {}", dir.display(), e);
                continue;
            }
        };
        if latest.as_ref().map_or(true, |l| metadata.run_id > l.run_id) {
            latest = Some(metadata);
        }
    }

    let Some(metadata) = latest else {
        return Ok(None);
    };
    let store = FrameStore::create(store_root, metadata.run_id)?;
    Ok(Some(context(store, metadata)))
}

/// The active run, shared between the pipeline front end and the workers.
#[derive(Clone, Default)]
pub struct RunSlot {
    inner: Arc<RwLock<Option<Arc<PipelineContext>>>>,
}

impl RunSlot {
    pub fn current(&self) -> Option<Arc<PipelineContext>> {
        self.inner.read().ok().and_then(|slot| slot.clone())
    }

    /// The active run if its id matches `run_id`.
    pub fn lookup(&self, run_id: u64) -> Option<Arc<PipelineContext>> {
        self.current().filter(|ctx| ctx.run_id == run_id)
    }

    pub fn replace(
        &self,
        ctx: Option<Arc<PipelineContext>>,
    ) -> Result<Option<Arc<PipelineContext>>, PipelineError> {
        let mut slot = self
            .inner
            .write()
            .map_err(|_| PipelineError::Internal("run slot lock poisoned".to_string()))?;
        Ok(std::mem::replace(&mut *slot, ctx))
    }
}
