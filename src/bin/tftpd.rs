//! TFTP server binary: serves (and accepts uploads into) a directory over
//! RFC 1350 octet-mode transfers.

use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use tftpd_rs::server;

/// The RFC-assigned TFTP port. Binding it usually requires root.
const WELL_KNOWN_PORT: u16 = 69;

/// Unprivileged fallback used when `WELL_KNOWN_PORT` can't be bound.
const FALLBACK_PORT: u16 = 6969;

/// A concurrent TFTP server.
#[derive(Parser, Debug)]
#[command(name = "tftpd", version, about)]
struct Cli {
    /// UDP port to listen on. Defaults to 69, falling back to 6969 if that
    /// can't be bound (e.g. not running as root).
    #[arg(short, long)]
    port: Option<u16>,

    /// Directory to serve and receive files into.
    #[arg(short, long, default_value = ".")]
    dir: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let dir = std::fs::canonicalize(&cli.dir)?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let server_handle = tokio::spawn(run_with_fallback(cli.port, dir, shutdown_rx));

    tokio::signal::ctrl_c().await?;
    info!("received Ctrl-C, shutting down");
    let _ = shutdown_tx.send(true);

    match server_handle.await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => {
            error!(error = %e, "server exited with an error");
            Err(e)
        }
        Err(e) => Err(anyhow::anyhow!("server task panicked: {e}")),
    }
}

/// Try the requested (or default) port first; if that bind fails and no
/// port was explicitly requested, retry once on `FALLBACK_PORT`.
async fn run_with_fallback(
    requested: Option<u16>,
    dir: PathBuf,
    shutdown: watch::Receiver<bool>,
) -> Result<()> {
    match requested {
        Some(port) => server::run(port, dir, shutdown).await,
        None => match server::run(WELL_KNOWN_PORT, dir.clone(), shutdown.clone()).await {
            Ok(()) => Ok(()),
            Err(e) => {
                warn!(error = %e, port = WELL_KNOWN_PORT, fallback = FALLBACK_PORT, "falling back to unprivileged port");
                server::run(FALLBACK_PORT, dir, shutdown).await
            }
        },
    }
}
