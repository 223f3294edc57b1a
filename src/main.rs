//! Cloudcam agent: live H.264/RTP stream with on-demand JPEG thumbnails

use std::path::PathBuf;
use std::sync::Arc;

use color_eyre::Result;
use serde_json::Value;
use tokio::io::BufReader;
use tokio::sync::mpsc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use cloudcam::control::{serve, CommandHandler};
use cloudcam::pipeline::StreamPipeline;
use cloudcam::upload::Uploader;
use cloudcam::Config;

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;

    let config_path = std::env::args()
        .nth(1)
        .or_else(|| std::env::var("CLOUDCAM_CONFIG").ok())
        .map(PathBuf::from);
    let config = Config::load(config_path.as_deref())?;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.logging.filter));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_timer(tracing_subscriber::fmt::time::uptime())
        .with_writer(std::io::stderr)
        .init();

    info!("Cloudcam Launching...");
    if let Some(path) = &config_path {
        info!("Configuration: {}", path.display());
    }

    let defaults = config.stream.default_params()?;
    let mut pipeline = StreamPipeline::new(defaults.clone(), config.stream.apply_interval());

    #[cfg(feature = "gstreamer-pipeline")]
    let backend = cloudcam::capture::GstStreamBackend::new(config.stream.clone());
    #[cfg(not(feature = "gstreamer-pipeline"))]
    let backend = cloudcam::capture::TestPatternBackend::new(config.stream.clone());

    pipeline.start(backend)?;
    info!(
        "Streaming {}x{}@{} to {}",
        config.stream.width,
        config.stream.height,
        config.stream.fps,
        defaults.destination()
    );

    let handler = Arc::new(CommandHandler::new(
        pipeline.context().clone(),
        Uploader::new(&config.upload)?,
        config.snapshot.timeout(),
        defaults,
    ));

    // Reported documents go to stdout, one per line
    let (reports_tx, mut reports_rx) = mpsc::unbounded_channel::<Value>();
    let printer = tokio::spawn(async move {
        while let Some(reported) = reports_rx.recv().await {
            println!("{reported}");
        }
    });

    let input = BufReader::new(tokio::io::stdin());
    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
        info!("Interrupted");
    };
    let exit = serve(handler, input, shutdown, reports_tx).await;
    info!("Control loop finished: {:?}", exit);

    // Wakes any snapshot request still waiting on the pipeline
    tokio::task::spawn_blocking(move || pipeline.stop()).await?;
    printer.await?;

    info!("Cloudcam shutting down");
    Ok(())
}
