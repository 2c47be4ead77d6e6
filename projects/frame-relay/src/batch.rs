// In-process run: upload, annotate with a local worker pool, reassemble

use crate::error::PipelineError;
use crate::pipeline::finalize::ReassemblyReport;
use crate::pipeline::orchestrator::{Pipeline, UploadReceipt};
use anyhow::{Context, Result};
use indicatif::{ProgressBar, ProgressStyle};
use std::time::Duration;

const POLL_INTERVAL: Duration = Duration::from_millis(200);

fn progress_bar(receipt: &UploadReceipt, visible: bool) -> Result<ProgressBar> {
    if !visible {
        return Ok(ProgressBar::hidden());
    }
    let pb = ProgressBar::new(receipt.estimated_frames.unwrap_or(0));
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({per_sec:.1.yellow} fps, {eta})")?
            .progress_chars("#>-"),
    );
    Ok(pb)
}

/// Run one video through the whole pipeline and return the built video.
pub fn process_video(
    pipeline: &Pipeline,
    upload: impl FnOnce(&Pipeline) -> Result<UploadReceipt, PipelineError>,
    show_progress: bool,
) -> Result<ReassemblyReport> {
    let receipt = upload(pipeline).context("failed to start run")?;
    let pb = progress_bar(&receipt, show_progress)?;

    pipeline
        .start_consumers(None)
        .context("failed to start annotation workers")?;

    let waited = pipeline.wait_for_completion(POLL_INTERVAL, None, |snapshot| {
        pb.set_length(snapshot.total_frames);
        pb.set_position(snapshot.frames_completed + snapshot.frames_failed);
    });
    let stopped = pipeline.stop_consumers();

    let snapshot = waited.context("run did not complete")?;
    stopped.context("failed to stop annotation workers")?;
    pb.finish_and_clear();

    if snapshot.frames_failed > 0 {
        tracing::warn!(
            run_id = receipt.run_id,
            "{} of {} frames failed annotation and are missing from the output",
            snapshot.frames_failed,
            snapshot.total_frames
        );
    }

    let report = pipeline
        .generate_video()
        .context("failed to reassemble video")?;
    tracing::info!(
        run_id = receipt.run_id,
        "Wrote {} frames ({}x{} @ {} fps) to {}",
        report.frames_written,
        report.width,
        report.height,
        report.fps,
        report.output_path.display()
    );
    Ok(report)
}
