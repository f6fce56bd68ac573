//! Shared-memory video receiver

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use color_eyre::Result;
use tracing::info;
use tracing_subscriber::EnvFilter;

use shm_ingest::graph::ReplayGraph;
use shm_ingest::{Config, LifecycleState, MediaGraph, Receiver, ReceiverError};

#[derive(Parser, Debug)]
#[command(name = "shm-ingest", about = "Shared Memory Video Receiver")]
struct Args {
    /// TOML configuration file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Shared-memory socket path
    #[arg(long)]
    socket_path: Option<PathBuf>,

    #[arg(long)]
    width: Option<u32>,

    #[arg(long)]
    height: Option<u32>,

    /// Source video format (I420, BGR, RGB, ...)
    #[arg(long)]
    format: Option<String>,

    /// Play a raw frame dump instead of the live feed
    #[arg(long)]
    replay: Option<PathBuf>,

    /// How often the consumer loop polls for a new frame, in milliseconds
    #[arg(long, default_value_t = 1000)]
    poll_ms: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize error handling and logging
    color_eyre::install()?;
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("shm_ingest=debug")),
        )
        .with_timer(tracing_subscriber::fmt::time::uptime())
        .init();

    let args = Args::parse();

    let mut config = Config::load(args.config.as_deref())?;
    if let Some(path) = args.socket_path {
        config.receiver.endpoint = path;
    }
    if let Some(width) = args.width {
        config.receiver.width = width;
    }
    if let Some(height) = args.height {
        config.receiver.height = height;
    }
    if let Some(format) = args.format {
        config.receiver.source_format = format;
    }
    let poll = Duration::from_millis(args.poll_ms.max(1));

    match args.replay {
        Some(path) => {
            config.receiver.endpoint = path;
            let graph = ReplayGraph::from_config(&config.receiver);
            run(config, graph, poll).await
        }
        None => run_live(config, poll).await,
    }
}

#[cfg(feature = "gstreamer-pipeline")]
async fn run_live(config: Config, poll: Duration) -> Result<()> {
    let graph = shm_ingest::graph::GstGraph::new(&config)?;
    run(config, graph, poll).await
}

#[cfg(not(feature = "gstreamer-pipeline"))]
async fn run_live(_config: Config, _poll: Duration) -> Result<()> {
    Err(color_eyre::eyre::eyre!(
        "built without the gstreamer-pipeline feature; use --replay <file>"
    ))
}

async fn run<G: MediaGraph>(config: Config, graph: G, poll: Duration) -> Result<()> {
    info!(
        "Starting SHM receiver on {}, {}x{}, format={}",
        config.receiver.endpoint.display(),
        config.receiver.width,
        config.receiver.height,
        config.receiver.source_format
    );

    let receiver = Arc::new(Receiver::new(&config, graph));
    let starting = receiver.clone();
    let start = tokio::task::spawn_blocking(move || starting.start());
    tokio::pin!(start);

    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    tokio::select! {
        started = &mut start => started??,
        _ = &mut shutdown => {
            info!("Caught SIGINT during startup, cleaning up...");
            let stopping = receiver.clone();
            tokio::task::spawn_blocking(move || stopping.stop()).await?;
            return match start.await? {
                Ok(()) | Err(ReceiverError::Interrupted) => Ok(()),
                Err(err) => Err(err.into()),
            };
        }
    }

    let mut ticker = tokio::time::interval(poll);
    let mut last_sequence = 0;

    loop {
        tokio::select! {
            _ = &mut shutdown => {
                info!("Caught SIGINT, cleaning up...");
                break;
            }
            _ = ticker.tick() => {
                let stats = receiver.stats();
                if let Some(frame) = receiver.frame() {
                    if frame.meta.sequence != last_sequence {
                        last_sequence = frame.meta.sequence;
                        info!(
                            "Frame {} ({}x{}) FPS: {:.1} Frames: {} Drops: {}",
                            frame.meta.sequence,
                            frame.meta.width,
                            frame.meta.height,
                            stats.fps,
                            stats.successful_frames,
                            stats.dropped_frames
                        );
                    }
                }
                if matches!(stats.state, LifecycleState::Stopping | LifecycleState::Failed) {
                    info!("Pipeline ended ({:?})", stats.state);
                    break;
                }
            }
        }
    }

    let stopping = receiver.clone();
    tokio::task::spawn_blocking(move || stopping.stop()).await?;
    info!("Application shutdown complete");
    Ok(())
}
