use std::path::PathBuf;

use anyhow::Context;
use chatrelay_core::{
    config::{Config, Credentials},
    server::RelayServer,
};
use clap::Parser;
use tokio::signal::ctrl_c;

const TRACING_TARGET: &str = "chatrelay";

#[derive(Parser)]
#[command(author, version, about = "chat relay: streaming chat over websocket plus image/ocr bridges", long_about = None)]
struct Cli {
    /// Optional config file (JSON or TOML). Environment variables override it.
    #[arg(long, env = "CHATRELAY_CONFIG")]
    config: Option<PathBuf>,

    /// Log level used when RUST_LOG is not set
    #[arg(long, env = "CHATRELAY_LOG_LEVEL", default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(&cli.log_level);

    let mut cfg = match &cli.config {
        Some(path) => Config::from_path(path)
            .with_context(|| format!("loading config from {}", path.display()))?,
        None => Config::default(),
    };
    cfg.apply_env().context("reading environment overrides")?;

    let creds = Credentials::from_env(&cfg);
    let server = RelayServer::new(&cfg, creds).context("building relay")?;
    tracing::info!(
        target: TRACING_TARGET,
        addr = %server.addr(),
        model = %cfg.chat.model,
        poll_mode = ?cfg.image.poll_mode,
        "starting relay"
    );

    server.run(shutdown_signal()).await?;
    Ok(())
}

fn init_logging(level: &str) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        tracing_subscriber::EnvFilter::new(format!(
            "chatrelay={level},chatrelay_core={level},tower_http={level}"
        ))
    });

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .init();
}

/// Resolves on Ctrl+C (or SIGTERM on unix).
async fn shutdown_signal() {
    let interrupt = async {
        if let Err(e) = ctrl_c().await {
            tracing::error!(target: TRACING_TARGET, error = %e, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(target: TRACING_TARGET, error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = interrupt => {},
        () = terminate => {},
    }
    tracing::info!(target: TRACING_TARGET, "shutdown requested; draining connections");
}
