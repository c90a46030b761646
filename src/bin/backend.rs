#![forbid(unsafe_code)]

//! HTTP server for tubegrab: search, MP3 download and the static front end.

use std::{net::SocketAddr, path::PathBuf, sync::Arc};

use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal;
use tracing::{error, info, warn};
use tubegrab::{
    config::{SettingsOverrides, resolve_settings},
    logging::init_tracing,
    probe::probe,
    reaper::{ActiveFiles, Reaper},
    server::{AppState, router},
    tools::Toolbox,
};

#[derive(Debug, Parser)]
#[command(about = "Search videos and download their audio as MP3")]
struct BackendArgs {
    /// Address to listen on (overrides TUBEGRAB_HOST).
    #[arg(long)]
    host: Option<String>,
    /// Port to listen on (overrides TUBEGRAB_PORT / PORT).
    #[arg(long)]
    port: Option<u16>,
    /// Directory holding yt-dlp and ffmpeg.
    #[arg(long)]
    bin_dir: Option<PathBuf>,
    /// Where MP3 files are produced before being streamed.
    #[arg(long)]
    temp_dir: Option<PathBuf>,
    /// Static front end.
    #[arg(long)]
    www_root: Option<PathBuf>,
    /// Alternate `.env` file.
    #[arg(long)]
    env_file: Option<PathBuf>,
}

impl From<BackendArgs> for SettingsOverrides {
    fn from(args: BackendArgs) -> Self {
        Self {
            host: args.host,
            port: args.port,
            bin_dir: args.bin_dir,
            temp_dir: args.temp_dir,
            www_root: args.www_root,
            env_path: args.env_file,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = BackendArgs::parse();
    init_tracing();
    let settings = resolve_settings(args.into()).context("loading settings")?;

    std::fs::create_dir_all(&settings.temp_dir)
        .with_context(|| format!("creating temp dir {}", settings.temp_dir.display()))?;

    let toolbox = Toolbox::from_settings(&settings);
    let status = probe(&toolbox).await;
    for (name, tool) in [("yt-dlp", &status.extractor), ("ffmpeg", &status.transcoder)] {
        match (&tool.version, tool.present) {
            (Some(version), true) => info!(tool = name, version = %version, "dependency found"),
            _ => warn!(tool = name, bin_dir = %toolbox.bin_dir().display(), "dependency missing, run check_deps for install hints"),
        }
    }

    let state = AppState::new(&settings, toolbox);
    let reaper = Reaper::new(settings.temp_dir.clone(), settings.retention);
    let active: Arc<dyn ActiveFiles> = Arc::new(state.downloads.clone());
    let sweeper = reaper.spawn_sweeper(settings.sweep_interval, active);
    info!(
        dir = %reaper.temp_dir().display(),
        retention_secs = reaper.retention().as_secs(),
        interval_secs = settings.sweep_interval.as_secs(),
        "temp sweeper started"
    );

    let max_results = state.search.max_results();
    let app = router(state);
    let addr = SocketAddr::new(settings.host, settings.port);
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding to {addr}"))?;
    info!(%addr, max_results, www_root = %settings.www_root.display(), "listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("running API server")?;

    sweeper.abort();
    info!("server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = signal::ctrl_c().await {
        error!(error = %err, "failed to install Ctrl+C handler");
    }
}
