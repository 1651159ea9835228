//! Watchtower - local developer proxy.
//!
//! Runs the proxy engine and its command API:
//! - Forward proxy (plus optional reverse HTTP/HTTPS listeners), auto-started
//!   from persisted settings
//! - Command API for front ends on `127.0.0.1:48888`

use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::Parser;
use tracing::{debug, info, warn};
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use watchtower_proxy::ProxyEvent;
use watchtower_server::{Engine, Server, ServerConfig, DEFAULT_PORT};
use watchtower_storage::Database;

/// Watchtower - intercepting proxy for local development
#[derive(Parser, Debug)]
#[command(name = "watchtower", version, about)]
struct Args {
    /// Enable debug logging (also logs to the console)
    #[arg(long)]
    debug: bool,

    /// Set log level (error, warn, info, debug, trace)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Data directory (database, root CA, traffic logs)
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Command API port
    #[arg(long, default_value_t = DEFAULT_PORT)]
    api_port: u16,

    /// Do not start the proxy on launch
    #[arg(long)]
    no_proxy: bool,
}

impl Args {
    fn filter_directive(&self) -> String {
        let level = if self.debug { "debug" } else { &self.log_level };
        format!("watchtower={},warn", level)
    }
}

/// Initialize logging with daily file rotation under `<data>/logs`.
fn init_logging(args: &Args, data_dir: &Path) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(args.filter_directive()));

    let log_dir = data_dir.join("logs");
    if std::fs::create_dir_all(&log_dir).is_ok() {
        let file_appender = RollingFileAppender::builder()
            .rotation(Rotation::DAILY)
            .max_log_files(7)
            .filename_prefix("watchtower")
            .filename_suffix("log")
            .build(&log_dir)
            .ok();

        if let Some(appender) = file_appender {
            let (non_blocking, guard) = tracing_appender::non_blocking(appender);

            if args.debug {
                tracing_subscriber::registry()
                    .with(env_filter)
                    .with(fmt::layer().with_writer(std::io::stdout))
                    .with(fmt::layer().with_writer(non_blocking).with_ansi(false))
                    .init();
            } else {
                tracing_subscriber::registry()
                    .with(env_filter)
                    .with(fmt::layer().with_writer(non_blocking).with_ansi(false))
                    .init();
            }

            info!("Logging to {:?}", log_dir);
            return Some(guard);
        }
    }

    // Fallback: console logging only
    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    warn!("File logging unavailable, using console only");
    None
}

/// Mirrors proxy lifecycle events into the log.
fn spawn_event_logger(engine: &Engine) {
    let mut events = engine.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                ProxyEvent::StartFailed(reason) => warn!("Proxy start failed: {}", reason),
                ProxyEvent::StatusChanged(status) => debug!(
                    status = %serde_json::to_string(&status).unwrap_or_default(),
                    "Proxy status changed"
                ),
            }
        }
    });
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Failed to listen for Ctrl+C: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Shutdown requested");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let data_dir = match &args.data_dir {
        Some(dir) => dir.clone(),
        None => Database::default_data_dir().context("could not resolve data directory")?,
    };
    std::fs::create_dir_all(&data_dir)
        .with_context(|| format!("could not create data directory {}", data_dir.display()))?;

    let _log_guard = init_logging(&args, &data_dir);
    info!(version = env!("CARGO_PKG_VERSION"), data_dir = %data_dir.display(), "Starting Watchtower");

    let engine = Engine::open(&data_dir).context("failed to open Watchtower data")?;
    spawn_event_logger(&engine);

    if args.no_proxy {
        info!("Proxy auto-start disabled");
    } else if let Some(status) = engine.auto_start().await {
        info!(port = status.port, "Proxy auto-started");
    }

    let config = ServerConfig::default().with_port(args.api_port);
    let server = Server::new(config, engine.clone())?;
    server.run_until(shutdown_signal()).await?;

    engine.stop_local_proxy().await;
    info!("Watchtower stopped");
    Ok(())
}
