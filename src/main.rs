//! analysis-client - connect to an analysis server and stream its events.
//!
//! ```text
//! analysis-client [--socket PATH] [--root DIR]... [-- PROGRAM ARGS...]
//! ```
//!
//! With a program after `--` the server is launched over stdio;
//! otherwise the client connects to `--socket` (or the default socket
//! path). Each `--root` is added as an analysis root. Ctrl-C shuts the
//! server down cleanly.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use analysis_client::client::{AnalysisListener, StatusListener};
use analysis_client::protocol::methods::{
    SetAnalysisRoots, SetAnalysisRootsParams, SetServerSubscriptions, SetServerSubscriptionsParams,
};
use analysis_client::protocol::types::ServerService;
use analysis_client::{
    default_socket_path, AnalysisClient, AnalysisEvent, ClientConfig, Endpoint, ServerCommand,
    StatusEvent,
};

#[derive(Debug, Default)]
struct Args {
    socket: Option<PathBuf>,
    roots: Vec<PathBuf>,
    command: Vec<String>,
}

impl Args {
    fn parse(mut raw: impl Iterator<Item = String>) -> Result<Self> {
        let mut args = Args::default();
        while let Some(arg) = raw.next() {
            match arg.as_str() {
                "--socket" => {
                    let path = raw.next().context("--socket requires a path")?;
                    args.socket = Some(PathBuf::from(path));
                }
                "--root" => {
                    let dir = raw.next().context("--root requires a directory")?;
                    args.roots.push(PathBuf::from(dir));
                }
                "--" => {
                    args.command = raw.by_ref().collect();
                    break;
                }
                "-h" | "--help" => {
                    println!("usage: analysis-client [--socket PATH] [--root DIR]... [-- PROGRAM ARGS...]");
                    std::process::exit(0);
                }
                other => bail!("unexpected argument: {}", other),
            }
        }

        if args.socket.is_some() && !args.command.is_empty() {
            bail!("--socket and a server command are mutually exclusive");
        }
        Ok(args)
    }

    fn endpoint(&self) -> Endpoint {
        match self.command.split_first() {
            Some((program, rest)) => {
                Endpoint::Process(ServerCommand::new(program).args(rest.iter().cloned()))
            }
            None => Endpoint::UnixSocket(self.socket.clone().unwrap_or_else(default_socket_path)),
        }
    }
}

/// Logs analysis results as they arrive.
struct EventLogger;

impl AnalysisListener for EventLogger {
    fn on_event(&self, event: &AnalysisEvent) -> Result<()> {
        match event {
            AnalysisEvent::Errors { file, errors } => {
                let fatal = errors.iter().filter(|e| e.is_error()).count();
                tracing::info!("{}: {} issue(s), {} error(s)", file, errors.len(), fatal);
                for error in errors.iter().filter(|e| e.is_error()) {
                    tracing::info!(
                        "  {}:{} {}",
                        error.location.start_line,
                        error.location.start_column,
                        error.message
                    );
                }
            }
            AnalysisEvent::ServerStatus {
                analysis: Some(status),
                ..
            } => {
                if status.is_analyzing {
                    tracing::info!("Analyzing...");
                } else {
                    tracing::info!("Analysis complete");
                }
            }
            AnalysisEvent::ServerError { message, .. } => {
                tracing::error!("Server error: {}", message);
            }
            other => tracing::debug!("Event {}", other.name()),
        }
        Ok(())
    }
}

/// Logs connection and liveness changes.
struct StatusLogger;

impl StatusListener for StatusLogger {
    fn on_status(&self, status: &StatusEvent) -> Result<()> {
        match status {
            StatusEvent::TransportLost { reason } => tracing::error!("Connection lost: {}", reason),
            StatusEvent::ProtocolAnomaly { detail } => tracing::warn!("Protocol anomaly: {}", detail),
            other => tracing::debug!("Status {:?}", other),
        }
        Ok(())
    }
}

fn absolute_root(dir: &Path) -> Result<String> {
    let path = std::fs::canonicalize(dir)
        .with_context(|| format!("Analysis root {} is not accessible", dir.display()))?;
    path.to_str()
        .map(str::to_string)
        .with_context(|| format!("Analysis root {} is not valid UTF-8", path.display()))
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "analysis_client=info".into()),
        ))
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    tracing::info!("Starting analysis-client v{}", env!("CARGO_PKG_VERSION"));

    let args = Args::parse(std::env::args().skip(1))?;
    let roots = args
        .roots
        .iter()
        .map(|dir| absolute_root(dir))
        .collect::<Result<Vec<_>>>()?;

    let client = AnalysisClient::new(ClientConfig::from_env());
    client.add_analysis_listener(Arc::new(EventLogger));
    client.add_status_listener(Arc::new(StatusLogger));

    let server = client.start(&args.endpoint()).await?;
    println!("Analysis server {} (pid {})", server.version, server.pid);

    let result = run(&client, roots).await;
    if let Err(e) = &result {
        tracing::error!("Session error: {:#}", e);
    }

    client.shutdown().await?;
    tracing::info!("analysis-client exited cleanly");
    result
}

async fn run(client: &AnalysisClient, roots: Vec<String>) -> Result<()> {
    client
        .call::<SetServerSubscriptions>(SetServerSubscriptionsParams {
            subscriptions: vec![ServerService::Status],
        })
        .await?;

    if !roots.is_empty() {
        tracing::info!("Analysis roots: {}", roots.join(", "));
        client
            .call::<SetAnalysisRoots>(SetAnalysisRootsParams {
                included: roots,
                ..Default::default()
            })
            .await?;
    }

    tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            signal.context("Failed to listen for Ctrl-C")?;
            tracing::info!("Interrupted, shutting down");
        }
        _ = client.stopped() => {
            tracing::warn!("Server connection ended");
        }
    }
    Ok(())
}
