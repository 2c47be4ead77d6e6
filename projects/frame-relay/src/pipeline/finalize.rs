use crate::error::{ReassemblyError, StoreError};
use crate::pipeline::store::FrameStore;
use crate::video::{SinkFactory, VideoSink};
use opencv::core::{Mat, Size};
use opencv::prelude::*;
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

/// Gaps listed individually in the log before being summarised.
const GAPS_LOGGED: usize = 20;

#[derive(Debug, Clone, Serialize)]
pub struct ReassemblyReport {
    pub output_path: PathBuf,
    pub frames_written: usize,
    pub width: i32,
    pub height: i32,
    pub fps: f64,
    pub first_sequence: u64,
    pub last_sequence: u64,
    /// Sequence numbers that had no stored frame.
    pub gaps: Vec<u64>,
}

/// Releases the sink on every exit path, including early returns and panics.
struct SinkGuard {
    sink: Box<dyn VideoSink>,
    released: bool,
}

impl SinkGuard {
    fn finish(mut self) -> Result<(), ReassemblyError> {
        self.released = true;
        self.sink
            .release()
            .map_err(|e| ReassemblyError::Writer(e.to_string()))
    }
}

impl Drop for SinkGuard {
    fn drop(&mut self) {
        if !self.released {
            if let Err(e) = self.sink.release() {
                tracing::warn!("Failed to release video writer: {}", e);
            }
        }
    }
}

/// Turns the frames of a store into one video, ordered by sequence number.
#[derive(Clone)]
pub struct Reassembler {
    sink_factory: Arc<dyn SinkFactory>,
    fps: f64,
}

/// Missing sequence numbers between 0 and the last key, plus any trailing
/// ones when the expected total is known.
pub fn find_gaps(sorted_keys: &[u64], expected_total: Option<u64>) -> Vec<u64> {
    let mut gaps = Vec::new();
    let mut expected = 0;
    for &key in sorted_keys {
        gaps.extend(expected..key);
        expected = key + 1;
    }
    if let Some(total) = expected_total {
        gaps.extend(expected..total);
    }
    gaps
}

fn partial_path(output: &Path) -> PathBuf {
    let stem = output
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("output");
    let name = match output.extension().and_then(|s| s.to_str()) {
        Some(ext) => format!("{}.partial.{}", stem, ext),
        None => format!("{}.partial", stem),
    };
    output.with_file_name(name)
}

impl Reassembler {
    pub fn new(sink_factory: Arc<dyn SinkFactory>, fps: f64) -> Self {
        Self { sink_factory, fps }
    }

    /// Write every stored frame to `output` in ascending sequence order.
    ///
    /// Stored frames that cannot be decoded are skipped and reported as gaps.
    /// The video is assembled next to `output` and moved into place only once
    /// the writer has been released, so a failed build leaves any earlier
    /// file at `output` untouched.
    pub fn build_video(
        &self,
        store: &FrameStore,
        output: &Path,
        expected_total: Option<u64>,
    ) -> Result<ReassemblyReport, ReassemblyError> {
        let start = Instant::now();
        let keys = store.keys()?;
        if keys.is_empty() {
            return Err(ReassemblyError::NoFrames);
        }

        if let Some(parent) = output.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let partial = partial_path(output);

        let written = match self.write_frames(store, &keys, &partial) {
            Ok(written) => written,
            Err(e) => {
                let _ = fs::remove_file(&partial);
                return Err(e);
            }
        };
        fs::rename(&partial, output)?;

        let mut gaps = find_gaps(&keys, expected_total);
        gaps.extend(&written.skipped);
        gaps.sort_unstable();
        if !gaps.is_empty() {
            let shown: Vec<_> = gaps.iter().take(GAPS_LOGGED).collect();
            tracing::warn!(
                missing = gaps.len(),
                "Frames missing from reassembly, video is shorter: {:?}{}",
                shown,
                if gaps.len() > GAPS_LOGGED { " ..." } else { "" }
            );
        }

        tracing::info!(
            "Reassembled {} frames ({}x{} @ {:.1} fps) into {} in {:.2}s",
            written.count,
            written.frame_size.width,
            written.frame_size.height,
            self.fps,
            output.display(),
            start.elapsed().as_secs_f64()
        );

        Ok(ReassemblyReport {
            output_path: output.to_path_buf(),
            frames_written: written.count,
            width: written.frame_size.width,
            height: written.frame_size.height,
            fps: self.fps,
            first_sequence: written.first_sequence,
            last_sequence: written.last_sequence,
            gaps,
        })
    }

    /// Read a stored frame, or `None` if it cannot be decoded.
    fn read_frame(store: &FrameStore, sequence_number: u64) -> Result<Option<Mat>, ReassemblyError> {
        match store.read(sequence_number) {
            Ok(frame) => Ok(Some(frame)),
            Err(StoreError::Decode(seq)) => {
                tracing::warn!(sequence_number = seq, "Skipping unreadable stored frame");
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }

    fn write_frames(
        &self,
        store: &FrameStore,
        keys: &[u64],
        partial: &Path,
    ) -> Result<WrittenFrames, ReassemblyError> {
        let writer_err = |e: opencv::Error| ReassemblyError::Writer(e.to_string());
        let mut skipped = Vec::new();

        // The first decodable frame fixes the video dimensions
        let mut remaining = keys.iter();
        let (first_sequence, first) = loop {
            let Some(&sequence_number) = remaining.next() else {
                return Err(ReassemblyError::NoFrames);
            };
            match Self::read_frame(store, sequence_number)? {
                Some(frame) => break (sequence_number, frame),
                None => skipped.push(sequence_number),
            }
        };
        let frame_size = first.size().map_err(writer_err)?;

        let sink = self
            .sink_factory
            .open(partial, self.fps, frame_size)
            .map_err(|e| ReassemblyError::Writer(e.to_string()))?;
        let mut guard = SinkGuard {
            sink,
            released: false,
        };

        guard
            .sink
            .write_frame(&first)
            .map_err(|e| ReassemblyError::Writer(e.to_string()))?;
        drop(first);
        let mut count = 1;
        let mut last_sequence = first_sequence;

        for &sequence_number in remaining {
            let Some(frame) = Self::read_frame(store, sequence_number)? else {
                skipped.push(sequence_number);
                continue;
            };
            let size = frame.size().map_err(writer_err)?;
            if size != frame_size {
                return Err(ReassemblyError::DimensionMismatch {
                    sequence_number,
                    expected_width: frame_size.width,
                    expected_height: frame_size.height,
                    actual_width: size.width,
                    actual_height: size.height,
                });
            }
            guard
                .sink
                .write_frame(&frame)
                .map_err(|e| ReassemblyError::Writer(e.to_string()))?;
            count += 1;
            last_sequence = sequence_number;
        }

        guard.finish()?;
        Ok(WrittenFrames {
            frame_size,
            count,
            first_sequence,
            last_sequence,
            skipped,
        })
    }
}

struct WrittenFrames {
    frame_size: Size,
    count: usize,
    first_sequence: u64,
    last_sequence: u64,
    skipped: Vec<u64>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{synthetic_frame, RecordingSinkFactory, FRAME_HEIGHT, FRAME_WIDTH};
    use tempfile::tempdir;

    fn store_with(root: &Path, keys: &[u64]) -> FrameStore {
        let store = FrameStore::create(root, 1).unwrap();
        for &k in keys {
            store
                .write(k, &synthetic_frame(k, 0, FRAME_WIDTH, FRAME_HEIGHT))
                .unwrap();
        }
        store
    }

    #[test]
    fn test_find_gaps() {
        assert_eq!(find_gaps(&[0, 1, 3, 5], None), vec![2, 4]);
        assert_eq!(find_gaps(&[2, 3], Some(6)), vec![0, 1, 4, 5]);
        assert!(find_gaps(&[0, 1, 2], Some(3)).is_empty());
    }

    #[test]
    fn test_partial_path() {
        assert_eq!(
            partial_path(Path::new("/out/processed_video.mp4")),
            PathBuf::from("/out/processed_video.partial.mp4")
        );
        assert_eq!(partial_path(Path::new("video")), PathBuf::from("video.partial"));
    }

    #[test]
    fn test_frames_written_in_sequence_order() {
        let dir = tempdir().unwrap();
        // Completion order differs from sequence order
        let store = store_with(dir.path(), &[5, 1, 3, 0]);
        let sinks = RecordingSinkFactory::default();
        let reassembler = Reassembler::new(Arc::new(sinks.clone()), 30.0);
        let output = dir.path().join("out").join("video.mp4");

        let report = reassembler.build_video(&store, &output, None).unwrap();

        let recording = sinks.snapshot();
        assert_eq!(recording.frames, vec![0, 1, 3, 5]);
        assert_eq!(recording.fps, 30.0);
        assert_eq!(recording.frame_size, Some(Size::new(FRAME_WIDTH, FRAME_HEIGHT)));
        assert_eq!(recording.released, 1);

        assert_eq!(report.frames_written, 4);
        assert_eq!(report.gaps, vec![2, 4]);
        assert_eq!((report.first_sequence, report.last_sequence), (0, 5));
        assert!(output.is_file());
        assert!(!partial_path(&output).exists());
    }

    #[test]
    fn test_empty_store_is_no_frames() {
        let dir = tempdir().unwrap();
        let store = store_with(dir.path(), &[]);
        let reassembler = Reassembler::new(Arc::new(RecordingSinkFactory::default()), 30.0);
        let err = reassembler
            .build_video(&store, &dir.path().join("v.mp4"), None)
            .unwrap_err();
        assert!(matches!(err, ReassemblyError::NoFrames));
    }

    #[test]
    fn test_dimension_mismatch_keeps_previous_output() {
        let dir = tempdir().unwrap();
        let store = store_with(dir.path(), &[0, 1]);
        store.write(2, &synthetic_frame(2, 0, 16, 16)).unwrap();

        let output = dir.path().join("video.mp4");
        fs::write(&output, b"previous build").unwrap();

        let sinks = RecordingSinkFactory::default();
        let reassembler = Reassembler::new(Arc::new(sinks.clone()), 30.0);
        let err = reassembler.build_video(&store, &output, None).unwrap_err();

        assert!(matches!(
            err,
            ReassemblyError::DimensionMismatch {
                sequence_number: 2,
                actual_width: 16,
                ..
            }
        ));
        // Writer released even though the build failed
        assert_eq!(sinks.snapshot().released, 1);
        assert_eq!(fs::read(&output).unwrap(), b"previous build");
        assert!(!partial_path(&output).exists());
    }

    #[test]
    fn test_unreadable_frames_are_skipped_as_gaps() {
        let dir = tempdir().unwrap();
        let store = store_with(dir.path(), &[1, 2, 4]);
        // Undecodable leading and middle frames
        fs::write(store.dir().join("frame_00000000.png"), b"not a png").unwrap();
        fs::write(store.dir().join("frame_00000003.png"), b"truncated").unwrap();

        let sinks = RecordingSinkFactory::default();
        let reassembler = Reassembler::new(Arc::new(sinks.clone()), 30.0);
        let report = reassembler
            .build_video(&store, &dir.path().join("v.mp4"), Some(6))
            .unwrap();

        assert_eq!(sinks.snapshot().frames, vec![1, 2, 4]);
        assert_eq!(report.frames_written, 3);
        assert_eq!((report.first_sequence, report.last_sequence), (1, 4));
        assert_eq!(report.gaps, vec![0, 3, 5]);
    }

    #[test]
    fn test_only_unreadable_frames_is_no_frames() {
        let dir = tempdir().unwrap();
        let store = store_with(dir.path(), &[]);
        fs::write(store.dir().join("frame_00000000.png"), b"garbage").unwrap();

        let sinks = RecordingSinkFactory::default();
        let reassembler = Reassembler::new(Arc::new(sinks.clone()), 30.0);
        let output = dir.path().join("v.mp4");
        let err = reassembler.build_video(&store, &output, None).unwrap_err();
        assert!(matches!(err, ReassemblyError::NoFrames));
        assert_eq!(sinks.snapshot().released, 0);
        assert!(!output.exists());
    }
}
