#![forbid(unsafe_code)]

use std::{net::SocketAddr, path::PathBuf, sync::Arc};

use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal;
use tracing::{error, info};
use tubeclip::{
    config::{DEFAULT_CONFIG_PATH, RuntimeConfig, load_runtime_config_from},
    invoke::Invoker,
    logging::init_logging,
    security::ensure_not_root,
    server::{AppState, router},
    storage::{Storage, spawn_sweeper},
};

#[derive(Parser, Debug)]
#[command(author, version, about = "Serve yt-dlp clip downloads over HTTP.")]
struct Cli {
    #[arg(long = "config", value_name = "PATH", default_value = DEFAULT_CONFIG_PATH, help = "Path to the config file")]
    config: PathBuf,
    #[arg(long = "host", value_name = "ADDR", help = "Address to listen on")]
    host: Option<String>,
    #[arg(long = "port", value_name = "PORT", help = "Port to listen on")]
    port: Option<u16>,
    #[arg(
        long = "storage-dir",
        value_name = "PATH",
        help = "Directory generated clips are written to"
    )]
    storage_dir: Option<PathBuf>,
    #[arg(
        long = "log-level",
        value_name = "LEVEL",
        default_value = "info",
        help = "Log level used when RUST_LOG is not set"
    )]
    log_level: String,
}

/// File values first, then environment, then flags.
fn resolve_config(cli: &Cli) -> Result<RuntimeConfig> {
    let mut config = load_runtime_config_from(&cli.config)?;

    if let Ok(value) = std::env::var("TUBECLIP_HOST") {
        if !value.trim().is_empty() {
            config.host = value.trim().to_string();
        }
    }
    if let Ok(value) = std::env::var("TUBECLIP_PORT") {
        config.port = value
            .trim()
            .parse()
            .context("Parsing TUBECLIP_PORT from the environment")?;
    }

    if let Some(host) = &cli.host {
        config.host = host.clone();
    }
    if let Some(port) = cli.port {
        config.port = port;
    }
    if let Some(dir) = &cli.storage_dir {
        config.storage_dir = dir.clone();
    }
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(&cli.log_level)?;
    ensure_not_root("backend")?;

    let config = resolve_config(&cli)?;
    let storage = Arc::new(Storage::open(&config.storage_dir).context("preparing storage directory")?);
    let invoker = Invoker::new(
        config.ytdlp_path.clone(),
        config.max_filesize.clone(),
        config.invoke_timeout,
        storage.clone(),
    );
    info!(
        storage = %storage.dir().display(),
        ytdlp = %config.ytdlp_path.display(),
        max_filesize = %config.max_filesize,
        "configuration loaded"
    );

    let sweeper = spawn_sweeper(storage.clone(), config.file_ttl, config.sweep_interval);

    let state = AppState {
        storage,
        invoker: Arc::new(invoker),
    };
    let app = router(state);

    let addr = SocketAddr::new(
        config
            .host
            .parse()
            .with_context(|| format!("parsing listen host {}", config.host))?,
        config.port,
    );
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding to {}", addr))?;
    info!("clip server listening on http://{}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("running clip server")?;

    sweeper.abort();
    info!("clip server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = signal::ctrl_c().await {
        error!("Failed to install Ctrl+C handler: {}", err);
    }
}
