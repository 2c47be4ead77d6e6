use crate::config::{
    PipelineConfig, DEFAULT_CONFIDENCE, DEFAULT_OUTPUT_FPS, DEFAULT_OVERLAP, DEFAULT_WORKERS,
};
use crate::error::ConfigError;
use crate::pipeline::annotate::ColorMode;
use crate::pipeline::detection::DetectorBackend;
use crate::pipeline::remote::RemoteConfig;
use clap::{Parser, Subcommand, ValueEnum};
use std::net::IpAddr;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Serve the HTTP API
    Serve(ServeArgs),
    /// Annotate a single video in-process and print the output path
    Process(ProcessArgs),
}

#[derive(clap::Args, Debug)]
pub struct ServeArgs {
    /// Host to bind to
    #[arg(long, default_value = "127.0.0.1")]
    pub host: IpAddr,

    /// Port to bind to
    #[arg(long, default_value_t = 5000)]
    pub port: u16,

    /// Directory uploaded videos are saved to
    #[arg(long, env = "FRAME_RELAY_UPLOAD_DIR", default_value = "data/uploads")]
    pub upload_dir: PathBuf,

    /// Start a worker pool together with the server
    #[arg(long)]
    pub start_workers: bool,

    #[command(flatten)]
    pub pipeline: PipelineArgs,
}

#[derive(clap::Args, Debug)]
pub struct ProcessArgs {
    /// Video file to annotate
    pub video: PathBuf,

    /// Hide the progress bar
    #[arg(long)]
    pub quiet: bool,

    #[command(flatten)]
    pub pipeline: PipelineArgs,
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    Model,
    Remote,
}

#[derive(clap::Args, Debug)]
pub struct PipelineArgs {
    /// Directory backing the work queue
    #[arg(long, env = "FRAME_RELAY_QUEUE_DIR", default_value = "data/queue")]
    pub queue_dir: PathBuf,

    /// Root directory for stored annotated frames
    #[arg(long, env = "FRAME_RELAY_STORE_ROOT", default_value = "data/frames")]
    pub store_root: PathBuf,

    /// Where the reassembled video is written
    #[arg(
        long,
        env = "FRAME_RELAY_OUTPUT",
        default_value = "data/output/processed_video.mp4"
    )]
    pub output: PathBuf,

    /// Annotation workers per pool
    #[arg(long, env = "FRAME_RELAY_WORKERS", default_value_t = DEFAULT_WORKERS)]
    pub workers: usize,

    /// Frame rate of the reassembled video
    #[arg(long, env = "FRAME_RELAY_OUTPUT_FPS", default_value_t = DEFAULT_OUTPUT_FPS)]
    pub output_fps: f64,

    /// Minimum detection confidence (0-1)
    #[arg(long, env = "FRAME_RELAY_CONFIDENCE", default_value_t = DEFAULT_CONFIDENCE)]
    pub confidence: f32,

    /// IoU above which overlapping detections are suppressed (0-1)
    #[arg(long, env = "FRAME_RELAY_OVERLAP", default_value_t = DEFAULT_OVERLAP)]
    pub overlap: f32,

    /// How boxes are colored
    #[arg(long, env = "FRAME_RELAY_COLOR_MODE", value_enum, default_value_t = ColorMode::Class)]
    pub color_mode: ColorMode,

    /// Seconds between retries of queue and detector connections
    #[arg(long, env = "FRAME_RELAY_RETRY_DELAY", default_value_t = 5)]
    pub retry_delay_secs: u64,

    #[arg(long, env = "FRAME_RELAY_BACKEND", value_enum, default_value_t = BackendKind::Model)]
    pub backend: BackendKind,

    /// RT-DETR model file for the local backend
    #[arg(long, env = "FRAME_RELAY_MODEL_PATH", default_value = "models/rtdetr.onnx")]
    pub model_path: String,

    /// Model URL for the remote backend
    #[arg(long, env = "FRAME_RELAY_REMOTE_ENDPOINT")]
    pub remote_endpoint: Option<String>,

    #[arg(long, env = "FRAME_RELAY_API_KEY", hide_env_values = true)]
    pub api_key: Option<String>,

    /// Remote request timeout in seconds
    #[arg(long, env = "FRAME_RELAY_REQUEST_TIMEOUT", default_value_t = 30)]
    pub request_timeout_secs: u64,
}

impl PipelineArgs {
    pub fn into_config(self) -> Result<PipelineConfig, ConfigError> {
        let backend = match self.backend {
            BackendKind::Model => DetectorBackend::Model {
                model_path: self.model_path,
            },
            BackendKind::Remote => DetectorBackend::Remote(RemoteConfig {
                endpoint: self
                    .remote_endpoint
                    .ok_or(ConfigError::Missing("remote endpoint"))?,
                api_key: self.api_key.ok_or(ConfigError::Missing("API key"))?,
                timeout: Duration::from_secs(self.request_timeout_secs),
            }),
        };

        let config = PipelineConfig {
            queue_dir: self.queue_dir,
            store_root: self.store_root,
            output_path: self.output,
            workers: self.workers,
            output_fps: self.output_fps,
            confidence: self.confidence,
            overlap: self.overlap,
            color_mode: self.color_mode,
            retry_delay: Duration::from_secs(self.retry_delay_secs),
            poll_interval: Duration::from_millis(500),
            backend,
        };
        config.validate()?;
        Ok(config)
    }
}

impl Args {
    pub fn parse_args() -> Self {
        Self::parse()
    }
}
