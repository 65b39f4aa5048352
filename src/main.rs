//! `cncd`: the controller session daemon binary. Parses CLI flags, merges
//! them with an optional TOML config file, wires up a [`SessionHub`], and
//! serves the TCP/JSON socket API until a shutdown signal arrives.

use anyhow::{Context, Result};
use clap::Parser;
use cnc_core::config::{Cli, Config};
use cnc_core::hub::SessionHub;
use cnc_core::net::server;
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

fn init_logging(log_level: &str) -> Result<()> {
    let filter = EnvFilter::try_new(log_level).context("invalid log level")?;
    tracing_subscriber::fmt().with_env_filter(filter).init();
    Ok(())
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    if let Err(e) = init_logging(&cli.log_level) {
        eprintln!("failed to initialize logging: {e}");
        return ExitCode::from(2);
    }

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("failed to build async runtime: {e}");
            return ExitCode::from(2);
        }
    };

    runtime.block_on(async {
        match run(cli).await {
            Ok(Shutdown::Normal) => {
                info!("cncd shutdown complete");
                ExitCode::SUCCESS
            }
            Ok(Shutdown::Interrupted) => {
                info!("cncd interrupted");
                ExitCode::from(130)
            }
            Err(RunError::BindFailed(e)) => {
                error!(error = %e, "cncd failed to bind listen address");
                ExitCode::from(2)
            }
            Err(RunError::Other(e)) => {
                error!(error = %e, "cncd exited with error");
                ExitCode::from(1)
            }
        }
    })
}

enum Shutdown {
    Normal,
    Interrupted,
}

/// Distinguishes a listen-socket bind failure (spec §6 exit code 2) from
/// every other startup/runtime error (exit code 1).
#[derive(Debug, thiserror::Error)]
enum RunError {
    #[error("failed to bind {0}")]
    BindFailed(std::io::Error),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

async fn run(cli: cnc_core::config::Cli) -> Result<Shutdown, RunError> {
    let config = Config::from_cli(&cli).context("failed to resolve configuration")?;
    info!(host = %config.host, port = config.port, "starting cncd");

    let listener = tokio::net::TcpListener::bind((config.host.as_str(), config.port))
        .await
        .map_err(RunError::BindFailed)?;

    let hub = Arc::new(SessionHub::new(&config));
    let server_hub = Arc::clone(&hub);
    let server_task = tokio::spawn(async move { server::serve_on(server_hub, listener).await });

    let shutdown = tokio::select! {
        res = server_task => {
            match res {
                Ok(Ok(())) => Shutdown::Normal,
                Ok(Err(e)) => return Err(anyhow::Error::from(e).context("net server failed").into()),
                Err(e) => return Err(anyhow::Error::from(e).context("net server task panicked").into()),
            }
        }
        signal = shutdown_signal() => {
            info!("shutdown signal received, tearing down sessions");
            signal
        }
    };

    Ok(shutdown)
}

#[cfg(unix)]
async fn shutdown_signal() -> Shutdown {
    use tokio::signal::unix::{signal, SignalKind};
    let mut sigterm = signal(SignalKind::terminate()).expect("install SIGTERM handler");
    let mut sigint = signal(SignalKind::interrupt()).expect("install SIGINT handler");
    tokio::select! {
        _ = sigterm.recv() => Shutdown::Normal,
        _ = sigint.recv() => Shutdown::Interrupted,
    }
}

#[cfg(not(unix))]
async fn shutdown_signal() -> Shutdown {
    let _ = tokio::signal::ctrl_c().await;
    Shutdown::Interrupted
}
