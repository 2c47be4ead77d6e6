use crate::pipeline::finalize::ReassemblyReport;
use crate::pipeline::orchestrator::{ConsumerStatus, Pipeline, UploadReceipt};
use crate::pipeline::progress::ProgressSnapshot;
use crate::web::error::{ApiError, ApiResult};
use axum::body::Body;
use axum::extract::multipart::Field;
use axum::extract::{Multipart, State};
use axum::http::{header, StatusCode};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::Json;
use futures::Stream;
use serde::Deserialize;
use serde_json::{json, Value};
use std::convert::Infallible;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio_stream::wrappers::IntervalStream;
use tokio_stream::StreamExt;

pub const DOWNLOAD_NAME: &str = "processed_video.mp4";

#[derive(Clone)]
pub struct AppState {
    pub pipeline: Arc<Pipeline>,
    pub upload_dir: PathBuf,
    /// Interval between snapshots on the status stream.
    pub stream_interval: Duration,
}

#[derive(Debug, Deserialize)]
pub struct StartConsumerRequest {
    pub workers: Option<usize>,
}

/// Keep only the final path component of a client supplied file name.
fn sanitize_file_name(name: Option<&str>) -> String {
    name.and_then(|n| Path::new(n).file_name())
        .and_then(|n| n.to_str())
        .filter(|n| !n.is_empty())
        .unwrap_or("upload.mp4")
        .to_string()
}

/// Stream one multipart field to `path` chunk by chunk. Returns the bytes written.
async fn save_field(mut field: Field<'_>, path: &Path) -> ApiResult<u64> {
    let mut file = tokio::fs::File::create(path)
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))?;
    let mut written: u64 = 0;
    while let Some(chunk) = field
        .chunk()
        .await
        .map_err(|e| ApiError::BadRequest(e.to_string()))?
    {
        file.write_all(&chunk)
            .await
            .map_err(|e| ApiError::Internal(e.to_string()))?;
        written += chunk.len() as u64;
    }
    file.flush()
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))?;
    Ok(written)
}

pub async fn upload(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> ApiResult<(StatusCode, Json<UploadReceipt>)> {
    let mut saved = None;
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::BadRequest(e.to_string()))?
    {
        if field.name() != Some("video") {
            continue;
        }
        let file_name = sanitize_file_name(field.file_name());
        tokio::fs::create_dir_all(&state.upload_dir)
            .await
            .map_err(|e| ApiError::Internal(e.to_string()))?;
        let path = state.upload_dir.join(format!(
            "{}_{}",
            chrono::Utc::now().timestamp_millis(),
            file_name
        ));

        let written = match save_field(field, &path).await {
            Ok(written) => written,
            Err(e) => {
                let _ = tokio::fs::remove_file(&path).await;
                return Err(e);
            }
        };
        if written == 0 {
            let _ = tokio::fs::remove_file(&path).await;
            return Err(ApiError::BadRequest("uploaded video is empty".to_string()));
        }
        tracing::info!("Saved upload {} ({} bytes)", path.display(), written);
        saved = Some(path);
        break;
    }

    let path =
        saved.ok_or_else(|| ApiError::BadRequest("missing multipart field `video`".to_string()))?;
    let pipeline = state.pipeline.clone();
    let receipt = tokio::task::spawn_blocking(move || pipeline.upload(&path)).await??;
    Ok((StatusCode::ACCEPTED, Json(receipt)))
}

pub async fn get_status(State(state): State<AppState>) -> ApiResult<Json<ProgressSnapshot>> {
    Ok(Json(state.pipeline.status()?))
}

/// Server-sent status snapshots until the run completes.
pub async fn status_stream(
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let pipeline = state.pipeline.clone();
    let interval = state.stream_interval;

    let stream = async_stream::stream! {
        let mut ticks = IntervalStream::new(tokio::time::interval(interval));
        while ticks.next().await.is_some() {
            let snapshot = match pipeline.status() {
                Ok(snapshot) => snapshot,
                Err(e) => {
                    yield Ok(Event::default().event("error").data(e.to_string()));
                    continue;
                }
            };
            let done = snapshot.completed;
            match Event::default().json_data(&snapshot) {
                Ok(event) => yield Ok(event),
                Err(e) => {
                    tracing::warn!("Failed to serialize status snapshot: {}", e);
                    break;
                }
            }
            if done {
                break;
            }
        }
    };

    Sse::new(stream).keep_alive(KeepAlive::default())
}

pub async fn start_consumer(
    State(state): State<AppState>,
    body: Option<Json<StartConsumerRequest>>,
) -> ApiResult<Json<Value>> {
    let requested = body.and_then(|Json(req)| req.workers);
    let total = state.pipeline.start_consumers(requested)?;
    Ok(Json(json!({ "status": "started", "workers": total })))
}

pub async fn stop_consumer(State(state): State<AppState>) -> ApiResult<Json<Value>> {
    let pipeline = state.pipeline.clone();
    let stopped = tokio::task::spawn_blocking(move || pipeline.stop_consumers()).await??;
    Ok(Json(json!({ "status": "stopped", "workers": stopped })))
}

pub async fn consumer_status(State(state): State<AppState>) -> ApiResult<Json<ConsumerStatus>> {
    Ok(Json(state.pipeline.consumer_status()?))
}

pub async fn generate_video(State(state): State<AppState>) -> ApiResult<Json<ReassemblyReport>> {
    let pipeline = state.pipeline.clone();
    let report = tokio::task::spawn_blocking(move || pipeline.generate_video()).await??;
    Ok(Json(report))
}

pub async fn download_video(State(state): State<AppState>) -> ApiResult<Response> {
    let path = state.pipeline.video_artifact()?;
    let bytes = tokio::fs::read(&path)
        .await
        .map_err(|e| ApiError::Internal(format!("failed to read {}: {}", path.display(), e)))?;

    Ok((
        [
            (header::CONTENT_TYPE, "video/mp4".to_string()),
            (
                header::CONTENT_DISPOSITION,
                format!("attachment; filename=\"{}\"", DOWNLOAD_NAME),
            ),
        ],
        Body::from(bytes),
    )
        .into_response())
}

pub async fn cancel_processing(State(state): State<AppState>) -> ApiResult<Json<Value>> {
    let pipeline = state.pipeline.clone();
    tokio::task::spawn_blocking(move || pipeline.cancel()).await??;
    Ok(Json(json!({ "status": "cancelled" })))
}

pub async fn purge_queue(State(state): State<AppState>) -> ApiResult<Json<Value>> {
    let pipeline = state.pipeline.clone();
    let purged = tokio::task::spawn_blocking(move || pipeline.purge_queue()).await??;
    Ok(Json(json!({ "status": "purged", "purged": purged })))
}
