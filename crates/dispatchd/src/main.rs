//! dispatchd - local control plane for the `modal` CLI.
//!
//! Main entry point for the daemon binary.

use mimalloc::MiMalloc;

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

use std::path::PathBuf;

use clap::Parser;
use dispatchd::{Daemon, DaemonConfig, DEFAULT_PORT};
use eyre::WrapErr;
use tracing::{error, info};
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Parser)]
#[command(name = "dispatchd", about = "Local control plane for the modal CLI", version)]
struct Cli {
    /// Port to listen on
    #[arg(short, long, default_value_t = DEFAULT_PORT)]
    port: u16,

    /// SQLite database path
    #[arg(long, env = "DISPATCHD_DB")]
    db: Option<PathBuf>,

    /// key=value config file
    #[arg(short, long, env = "DISPATCHD_CONFIG")]
    config: Option<PathBuf>,
}

fn main() -> eyre::Result<()> {
    let cli = Cli::parse();

    // Initialize tracing.
    fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let mut config = DaemonConfig {
        port: cli.port,
        config_path: cli.config,
        ..Default::default()
    };
    if let Some(db) = cli.db {
        config.db_path = db;
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .wrap_err("failed to create tokio runtime")?;

    runtime.block_on(async {
        let daemon = Daemon::new(config).await?;

        let run = daemon.run();
        tokio::pin!(run);

        tokio::select! {
            result = &mut run => {
                if let Err(e) = &result {
                    error!("daemon error: {}", e);
                }
                return result;
            }
            signal = shutdown_signal() => {
                signal?;
                daemon.shutdown();
            }
        }

        // Let the daemon cancel running children before exiting.
        run.await
    })
}

#[cfg(unix)]
async fn shutdown_signal() -> eyre::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm =
        signal(SignalKind::terminate()).wrap_err("failed to register SIGTERM handler")?;
    let mut sigint =
        signal(SignalKind::interrupt()).wrap_err("failed to register SIGINT handler")?;

    tokio::select! {
        _ = sigint.recv() => info!("received SIGINT, initiating graceful shutdown"),
        _ = sigterm.recv() => info!("received SIGTERM, initiating graceful shutdown"),
    }
    Ok(())
}

#[cfg(not(unix))]
async fn shutdown_signal() -> eyre::Result<()> {
    tokio::signal::ctrl_c()
        .await
        .wrap_err("failed to listen for ctrl-c")?;
    info!("received ctrl-c, initiating graceful shutdown");
    Ok(())
}
