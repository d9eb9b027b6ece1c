//! Sandcell orchestrator
//!
//! Loads configuration, connects to the container runtime and serves
//! newline-delimited JSON-RPC requests on stdin until EOF or a shutdown
//! signal, then tears every session down.

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::signal;
use tracing::{error, info, warn};

use sandcell::config::AppConfig;
use sandcell::container::{DockerRuntime, Orchestrator};
use sandcell::logging::init_logging;
use sandcell::rpc::Dispatcher;

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = AppConfig::load()?;

    // Initialize logging
    init_logging(&config.log_level, config.log_json)?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        "Starting Sandcell orchestrator"
    );

    sandcell::metrics::init_metrics(&config.metrics)?;

    let runtime = DockerRuntime::new(&config.docker).context("Failed to create runtime client")?;
    let orchestrator = Arc::new(Orchestrator::new(config.docker.clone(), Arc::new(runtime)));
    orchestrator
        .start()
        .await
        .context("Failed to start orchestrator")?;

    let dispatcher = Arc::new(Dispatcher::new(orchestrator.clone(), config.rpc.sink_capacity));

    tokio::select! {
        result = serve_stdio(dispatcher) => {
            if let Err(e) = result {
                error!(error = %e, "RPC loop failed");
            }
        }
        _ = shutdown_signal() => {
            info!("Shutdown signal received");
        }
    }

    info!("Shutting down...");
    if let Err(e) = orchestrator.stop().await {
        warn!(error = %e, "Shutdown completed with errors");
        return Err(e.into());
    }

    info!("Sandcell orchestrator stopped");
    Ok(())
}

/// Answer one JSON-RPC request per stdin line. Requests run concurrently;
/// responses are written as they complete.
async fn serve_stdio(dispatcher: Arc<Dispatcher>) -> Result<()> {
    let (tx, mut rx) = tokio::sync::mpsc::channel::<String>(64);

    let writer = tokio::spawn(async move {
        let mut stdout = tokio::io::stdout();
        while let Some(response) = rx.recv().await {
            stdout.write_all(response.as_bytes()).await?;
            stdout.write_all(b"\n").await?;
            stdout.flush().await?;
        }
        Ok::<_, std::io::Error>(())
    });

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        let dispatcher = dispatcher.clone();
        let tx = tx.clone();
        tokio::spawn(async move {
            let response = dispatcher.handle_line(&line).await;
            match serde_json::to_string(&response) {
                Ok(text) => {
                    let _ = tx.send(text).await;
                }
                Err(e) => error!(error = %e, "Failed to encode RPC response"),
            }
        });
    }

    drop(tx);
    writer.await??;
    Ok(())
}

/// Handle shutdown signals gracefully
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install signal handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
