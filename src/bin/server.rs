//! tinymq broker server.
//!
//! Entry point for the server binary: parses command line arguments,
//! initializes logging, binds the listener and hands it to
//! [`tinymq::server`], wiring process termination signals into the graceful
//! shutdown path.

use anyhow::Context;
use clap::Parser;
use tinymq::{server, DEFAULT_PORT};
use tokio::net::TcpListener;
use tokio::signal::unix::{signal, SignalKind};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "tinymq-server", version, about = "An MQTT 3.1.1 broker")]
struct Cli {
    /// Address to listen on.
    #[arg(long, default_value_t = format!("0.0.0.0:{DEFAULT_PORT}"))]
    listen: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // `RUST_LOG` overrides the default level.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    let listener = TcpListener::bind(&cli.listen)
        .await
        .with_context(|| format!("failed to bind {}", cli.listen))?;
    info!(addr = %cli.listen, "listening");

    let shutdown = termination_signal().context("failed to install signal handlers")?;
    server::run(listener, shutdown).await;

    Ok(())
}

/// A future that resolves on the first delivery of SIGHUP, SIGINT, SIGTERM
/// or SIGQUIT.
fn termination_signal() -> std::io::Result<impl std::future::Future<Output = ()>> {
    let mut hangup = signal(SignalKind::hangup())?;
    let mut interrupt = signal(SignalKind::interrupt())?;
    let mut terminate = signal(SignalKind::terminate())?;
    let mut quit = signal(SignalKind::quit())?;

    Ok(async move {
        tokio::select! {
            _ = hangup.recv() => {}
            _ = interrupt.recv() => {}
            _ = terminate.recv() => {}
            _ = quit.recv() => {}
        }
    })
}
