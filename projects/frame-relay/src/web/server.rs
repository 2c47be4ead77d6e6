use crate::web::api::{
    cancel_processing, consumer_status, download_video, generate_video, get_status, purge_queue,
    start_consumer, status_stream, stop_consumer, upload, AppState,
};
use anyhow::Result;
use axum::extract::DefaultBodyLimit;
use axum::routing::{get, post};
use axum::Router;
use std::net::{IpAddr, SocketAddr, TcpListener};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

/// Largest accepted upload body.
const MAX_UPLOAD_BYTES: usize = 2 * 1024 * 1024 * 1024;

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/upload", post(upload))
        .route("/status", get(get_status))
        .route("/status/stream", get(status_stream))
        .route("/start-consumer", post(start_consumer))
        .route("/stop-consumer", post(stop_consumer))
        .route("/consumer-status", get(consumer_status))
        .route("/generate-video", post(generate_video))
        .route("/download-video", get(download_video))
        .route("/cancel-processing", post(cancel_processing))
        .route("/purge-queue", post(purge_queue))
        .layer(DefaultBodyLimit::max(MAX_UPLOAD_BYTES))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

pub async fn run_server(host: IpAddr, port: u16, state: AppState) -> Result<()> {
    let mut current_port = port;
    let listener = loop {
        let addr = SocketAddr::new(host, current_port);
        match TcpListener::bind(addr) {
            Ok(listener) => {
                // Tokio requires a non-blocking socket
                listener.set_nonblocking(true)?;
                info!("Successfully bound to {}", addr);
                break listener;
            }
            Err(e) => {
                warn!("Failed to bind to {}: {}. Trying next port...", addr, e);
                current_port = current_port
                    .checked_add(1)
                    .ok_or_else(|| anyhow::anyhow!("No available ports found"))?;
            }
        }
    };

    let app = router(state);

    let tokio_listener = tokio::net::TcpListener::from_std(listener)?;
    info!(
        "Frame relay server started on http://{}",
        tokio_listener.local_addr()?
    );

    axum::serve(tokio_listener, app).await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::orchestrator::Pipeline;
    use crate::testing::{test_pipeline, RecordingSinkFactory, SyntheticReader};
    use axum::body::{to_bytes, Body};
    use axum::http::{header, Method, Request, StatusCode};
    use axum::response::Response;
    use serde_json::Value;
    use std::sync::Arc;
    use std::time::Duration;
    use tempfile::TempDir;
    use tower::ServiceExt;

    const BOUNDARY: &str = "frame-relay-test-boundary";

    struct Harness {
        _dir: TempDir,
        pipeline: Arc<Pipeline>,
        sinks: RecordingSinkFactory,
        app: Router,
    }

    fn harness() -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let (pipeline, sinks) = test_pipeline(dir.path(), &[]);
        let pipeline = Arc::new(pipeline);
        let app = router(AppState {
            pipeline: pipeline.clone(),
            upload_dir: dir.path().join("uploads"),
            stream_interval: Duration::from_millis(10),
        });
        Harness {
            _dir: dir,
            pipeline,
            sinks,
            app,
        }
    }

    async fn send(app: &Router, method: Method, uri: &str, body: Body) -> Response {
        app.clone()
            .oneshot(
                Request::builder()
                    .method(method)
                    .uri(uri)
                    .body(body)
                    .unwrap(),
            )
            .await
            .unwrap()
    }

    async fn body_json(response: Response) -> Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn multipart_request(field: &str, file_name: &str, content: &[u8]) -> Request<Body> {
        let mut body = Vec::new();
        body.extend_from_slice(
            format!(
                "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"{field}\"; filename=\"{file_name}\"\r\nContent-Type: video/mp4\r\n\r\n"
            )
            .as_bytes(),
        );
        body.extend_from_slice(content);
        body.extend_from_slice(format!("\r\n--{BOUNDARY}--\r\n").as_bytes());

        Request::builder()
            .method(Method::POST)
            .uri("/upload")
            .header(
                header::CONTENT_TYPE,
                format!("multipart/form-data; boundary={BOUNDARY}"),
            )
            .body(Body::from(body))
            .unwrap()
    }

    #[tokio::test]
    async fn test_idle_status() {
        let h = harness();
        let response = send(&h.app, Method::GET, "/status", Body::empty()).await;
        assert_eq!(response.status(), StatusCode::OK);

        let json = body_json(response).await;
        assert_eq!(json["run_id"], 0);
        assert_eq!(json["progress"], 0);
        assert_eq!(json["total_frames"], 0);
        assert_eq!(json["completed"], false);
    }

    #[tokio::test]
    async fn test_video_endpoints_without_run() {
        let h = harness();

        let response = send(&h.app, Method::POST, "/generate-video", Body::empty()).await;
        assert_eq!(response.status(), StatusCode::CONFLICT);
        assert_eq!(body_json(response).await["code"], "NO_ACTIVE_RUN");

        let response = send(&h.app, Method::GET, "/download-video", Body::empty()).await;
        assert_eq!(response.status(), StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn test_upload_requires_video_field() {
        let h = harness();
        let response = h
            .app
            .clone()
            .oneshot(multipart_request("attachment", "clip.mp4", b"data"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert!(h.pipeline.current_run().is_none());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_upload_rejects_undecodable_video() {
        let h = harness();
        let response = h
            .app
            .clone()
            .oneshot(multipart_request("video", "clip.mp4", b"definitely not a video"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(body_json(response).await["code"], "SOURCE_ERROR");
        assert!(h.pipeline.current_run().is_none());
    }

    fn saved_uploads(h: &Harness) -> Vec<std::path::PathBuf> {
        match std::fs::read_dir(h._dir.path().join("uploads")) {
            Ok(entries) => entries.map(|e| e.unwrap().path()).collect(),
            Err(_) => Vec::new(),
        }
    }

    #[tokio::test]
    async fn test_empty_upload_leaves_no_file() {
        let h = harness();
        let response = h
            .app
            .clone()
            .oneshot(multipart_request("video", "clip.mp4", b""))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert!(saved_uploads(&h).is_empty());
        assert!(h.pipeline.current_run().is_none());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_large_upload_saved_intact() {
        let h = harness();
        let content: Vec<u8> = (0..512 * 1024).map(|i| (i % 251) as u8).collect();
        let response = h
            .app
            .clone()
            .oneshot(multipart_request("video", "../../big.mp4", &content))
            .await
            .unwrap();
        // Not a real video, but it was written out in full before decoding
        assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);

        let saved = saved_uploads(&h);
        assert_eq!(saved.len(), 1);
        assert!(saved[0].to_str().unwrap().ends_with("_big.mp4"));
        assert_eq!(std::fs::read(&saved[0]).unwrap(), content);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_consumer_lifecycle() {
        let h = harness();

        let response = send(
            &h.app,
            Method::POST,
            "/start-consumer",
            Body::from(r#"{"workers": 2}"#),
        )
        .await;
        // No JSON content type: the body is ignored and the configured default applies
        assert_eq!(response.status(), StatusCode::OK);
        let started = body_json(response).await["workers"].as_u64().unwrap();
        assert_eq!(started as usize, crate::config::DEFAULT_WORKERS);

        let response = send(&h.app, Method::GET, "/consumer-status", Body::empty()).await;
        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["pools"], 1);
        assert_eq!(json["workers"].as_array().unwrap().len() as u64, started);

        let response = send(&h.app, Method::POST, "/stop-consumer", Body::empty()).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["workers"].as_u64(), Some(started));

        let response = send(&h.app, Method::GET, "/consumer-status", Body::empty()).await;
        assert_eq!(body_json(response).await["pools"], 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_start_consumer_with_worker_count() {
        let h = harness();
        let response = h
            .app
            .clone()
            .oneshot(
                Request::builder()
                    .method(Method::POST)
                    .uri("/start-consumer")
                    .header(header::CONTENT_TYPE, "application/json")
                    .body(Body::from(r#"{"workers": 3}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["workers"], 3);
        h.pipeline.stop_consumers().unwrap();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_process_and_download() {
        let h = harness();
        let pipeline = h.pipeline.clone();
        let receipt = tokio::task::spawn_blocking(move || {
            pipeline.upload_reader("match.mp4", Box::new(SyntheticReader::new(6)))
        })
        .await
        .unwrap()
        .unwrap();

        let response = send(&h.app, Method::POST, "/start-consumer", Body::empty()).await;
        assert_eq!(response.status(), StatusCode::OK);

        let mut completed = false;
        for _ in 0..3000 {
            let json = body_json(send(&h.app, Method::GET, "/status", Body::empty()).await).await;
            assert_eq!(json["run_id"], receipt.run_id);
            if json["completed"] == true {
                assert_eq!(json["progress"], 6);
                assert_eq!(json["frames_completed"], 6);
                assert_eq!(json["queue_depth"], 0);
                completed = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(completed, "run did not complete");

        let response = send(&h.app, Method::GET, "/download-video", Body::empty()).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let response = send(&h.app, Method::POST, "/generate-video", Body::empty()).await;
        assert_eq!(response.status(), StatusCode::OK);
        let report = body_json(response).await;
        assert_eq!(report["frames_written"], 6);
        assert_eq!(h.sinks.snapshot().frames, vec![0, 1, 2, 3, 4, 5]);

        let response = send(&h.app, Method::GET, "/download-video", Body::empty()).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[header::CONTENT_TYPE], "video/mp4");
        assert_eq!(
            response.headers()[header::CONTENT_DISPOSITION],
            "attachment; filename=\"processed_video.mp4\""
        );

        let response = send(&h.app, Method::POST, "/cancel-processing", Body::empty()).await;
        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(send(&h.app, Method::GET, "/status", Body::empty()).await).await;
        assert_eq!(json["run_id"], 0);

        let pipeline = h.pipeline.clone();
        tokio::task::spawn_blocking(move || pipeline.stop_consumers())
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_status_stream_ends_on_completion() {
        let h = harness();
        let pipeline = h.pipeline.clone();
        tokio::task::spawn_blocking(move || {
            pipeline.upload_reader("short.mp4", Box::new(SyntheticReader::new(3)))?;
            pipeline.start_consumers(Some(1))
        })
        .await
        .unwrap()
        .unwrap();

        let response = send(&h.app, Method::GET, "/status/stream", Body::empty()).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[header::CONTENT_TYPE], "text/event-stream");

        let bytes = tokio::time::timeout(
            Duration::from_secs(60),
            to_bytes(response.into_body(), usize::MAX),
        )
        .await
        .expect("status stream did not finish")
        .unwrap();
        let text = String::from_utf8(bytes.to_vec()).unwrap();

        let last = text
            .lines()
            .filter_map(|line| line.strip_prefix("data: "))
            .last()
            .unwrap();
        let snapshot: Value = serde_json::from_str(last).unwrap();
        assert_eq!(snapshot["completed"], true);
        assert_eq!(snapshot["frames_completed"], 3);

        let pipeline = h.pipeline.clone();
        tokio::task::spawn_blocking(move || pipeline.stop_consumers())
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_purge_queue_endpoint() {
        let h = harness();
        let response = send(&h.app, Method::POST, "/purge-queue", Body::empty()).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["purged"], 0);
    }
}
