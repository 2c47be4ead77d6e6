// Frame store: sequence_number -> annotated image, one directory per run
//
// Entries are PNG files named `frame_<seq>.png`. A write lands in a temp file
// first and is renamed into place, so readers never observe a partial frame
// and a retried write simply replaces the previous one.

use crate::error::StoreError;
use crate::pipeline::codec::{decode_png, encode_png};
use opencv::core::Mat;
use opencv::prelude::*;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use walkdir::WalkDir;

const FRAME_PREFIX: &str = "frame_";
const FRAME_EXT: &str = "png";
const RUN_PREFIX: &str = "run-";

static TMP_COUNTER: AtomicU64 = AtomicU64::new(0);

#[derive(Debug, Clone)]
pub struct FrameStore {
    dir: PathBuf,
}

impl FrameStore {
    /// Create (or reopen) the store directory for `run_id` under `root`.
    pub fn create(root: &Path, run_id: u64) -> Result<Self, StoreError> {
        let dir = run_dir(root, run_id);
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, sequence_number: u64) -> PathBuf {
        self.dir
            .join(format!("{}{:08}.{}", FRAME_PREFIX, sequence_number, FRAME_EXT))
    }

    /// Store one annotated frame. Last writer wins.
    ///
    /// The run directory is never recreated here: once it has been cleared,
    /// late writes from a cancelled run fail with `StoreError::Cleared`.
    pub fn write(&self, sequence_number: u64, image: &Mat) -> Result<(), StoreError> {
        let bytes = encode_png(image).map_err(|e| StoreError::Encode {
            sequence_number,
            reason: e.to_string(),
        })?;

        let tmp = self.dir.join(format!(
            ".{}{}.{}.tmp",
            FRAME_PREFIX,
            sequence_number,
            TMP_COUNTER.fetch_add(1, Ordering::Relaxed)
        ));
        fs::write(&tmp, &bytes).map_err(|e| self.map_missing(e))?;
        if let Err(e) = fs::rename(&tmp, self.path_for(sequence_number)) {
            let _ = fs::remove_file(&tmp);
            return Err(self.map_missing(e));
        }
        Ok(())
    }

    pub fn read(&self, sequence_number: u64) -> Result<Mat, StoreError> {
        let bytes = fs::read(self.path_for(sequence_number)).map_err(|e| self.map_missing(e))?;
        match decode_png(&bytes) {
            Ok(image) if !image.empty() => Ok(image),
            _ => Err(StoreError::Decode(sequence_number)),
        }
    }

    /// Every stored sequence number, ascending.
    pub fn keys(&self) -> Result<Vec<u64>, StoreError> {
        if !self.dir.is_dir() {
            return Err(StoreError::Cleared(self.dir.display().to_string()));
        }
        let mut keys: Vec<u64> = WalkDir::new(&self.dir)
            .min_depth(1)
            .max_depth(1)
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file())
            .filter_map(|e| e.file_name().to_str().and_then(parse_key))
            .collect();
        keys.sort_unstable();
        Ok(keys)
    }

    /// Remove the run directory and everything in it. Idempotent.
    pub fn clear(&self) -> Result<(), StoreError> {
        match fs::remove_dir_all(&self.dir) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn map_missing(&self, e: io::Error) -> StoreError {
        if e.kind() == io::ErrorKind::NotFound && !self.dir.is_dir() {
            StoreError::Cleared(self.dir.display().to_string())
        } else {
            StoreError::Io(e)
        }
    }
}

pub fn run_dir(root: &Path, run_id: u64) -> PathBuf {
    root.join(format!("{}{}", RUN_PREFIX, run_id))
}

/// Every run directory under `root`. Empty if `root` does not exist.
pub fn run_dirs(root: &Path) -> Result<Vec<PathBuf>, StoreError> {
    if !root.is_dir() {
        return Ok(Vec::new());
    }
    let mut dirs = Vec::new();
    for entry in fs::read_dir(root)? {
        let entry = entry?;
        let is_run = entry
            .file_name()
            .to_str()
            .map(|n| n.starts_with(RUN_PREFIX))
            .unwrap_or(false);
        if is_run && entry.file_type()?.is_dir() {
            dirs.push(entry.path());
        }
    }
    Ok(dirs)
}

/// Remove every run directory under `root`. Returns how many were removed.
pub fn clear_root(root: &Path) -> Result<usize, StoreError> {
    let mut removed = 0;
    for dir in run_dirs(root)? {
        match fs::remove_dir_all(dir) {
            Ok(()) => removed += 1,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
    }
    Ok(removed)
}

fn parse_key(name: &str) -> Option<u64> {
    name.strip_prefix(FRAME_PREFIX)?
        .strip_suffix(FRAME_EXT)?
        .strip_suffix('.')?
        .parse()
        .ok()
}
