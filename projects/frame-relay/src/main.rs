mod batch;
mod cli;
mod config;
mod error;
mod pipeline;
mod queue;
mod run_context;
#[cfg(test)]
mod testing;
mod video;
mod web;

use anyhow::{Context, Result};
use cli::{Args, Command, ProcessArgs, ServeArgs};
use pipeline::orchestrator::Pipeline;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;
use web::api::AppState;
use web::server::run_server;

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables from .env if present
    dotenvy::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("frame_relay=info,tower_http=info")),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse_args();

    match args.command {
        Command::Serve(serve) => serve_api(serve).await,
        Command::Process(process) => process_file(process).await,
    }
}

async fn serve_api(args: ServeArgs) -> Result<()> {
    let config = args
        .pipeline
        .into_config()
        .context("invalid pipeline configuration")?;
    let pipeline = Arc::new(Pipeline::open(config).context("failed to open pipeline")?);

    if args.start_workers {
        let workers = pipeline.start_consumers(None)?;
        tracing::info!("Started {} annotation workers", workers);
    }

    let state = AppState {
        pipeline,
        upload_dir: args.upload_dir,
        stream_interval: Duration::from_secs(1),
    };
    run_server(args.host, args.port, state).await
}

async fn process_file(args: ProcessArgs) -> Result<()> {
    let config = args
        .pipeline
        .into_config()
        .context("invalid pipeline configuration")?;
    let video = args.video;
    let show_progress = !args.quiet;

    let report = tokio::task::spawn_blocking(move || {
        let pipeline = Pipeline::open(config).context("failed to open pipeline")?;
        batch::process_video(&pipeline, |p| p.upload(&video), show_progress)
    })
    .await??;

    println!("{}", report.output_path.display());
    Ok(())
}
