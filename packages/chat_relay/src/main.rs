use anyhow::{Context, Result, bail};
use chat_relay::{RelayConfig, Server, load_config};
use clap::Parser;
use std::path::PathBuf;
use tracing::{error, info};
use tracing_subscriber::prelude::*;

#[derive(Parser)]
#[command(name = "relay")]
#[command(about = "Relay every line a client sends to every other connected client")]
struct Args {
    /// TOML config file (RELAY_* env vars override it)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Host to bind to
    #[arg(short = 'b', long)]
    host: Option<String>,

    /// Port to listen on (0 = auto-select)
    #[arg(short, long)]
    port: Option<u16>,

    /// Maximum number of simultaneous clients
    #[arg(short, long)]
    max_clients: Option<usize>,

    /// Read buffer size per client, in bytes
    #[arg(long)]
    buffer_size: Option<usize>,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

impl Args {
    /// CLI flags win over file and env.
    fn apply(&self, config: &mut RelayConfig) {
        if let Some(host) = &self.host {
            config.host = host.clone();
        }
        if let Some(port) = self.port {
            config.port = port;
        }
        if let Some(max_clients) = self.max_clients {
            config.max_clients = max_clients;
        }
        if let Some(buffer_size) = self.buffer_size {
            config.buffer_size = buffer_size;
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Setup logging
    let default_directive = if args.debug {
        "chat_relay=debug,relay=debug,info"
    } else {
        "chat_relay=info,relay=info,warn"
    };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_directive));
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(env_filter)
        .init();

    if let Some(path) = &args.config {
        if !path.exists() {
            bail!("config file not found: {}", path.display());
        }
    }

    let mut config = RelayConfig::from_figment(&load_config(args.config.as_deref()))
        .context("Failed to load configuration")?;
    args.apply(&mut config);

    let server = match Server::bind(config).await {
        Ok(server) => server,
        Err(e) => {
            error!(error = %e, "relay failed to start");
            return Err(e).context("Failed to start relay");
        }
    };

    let summary = server.run(shutdown_signal()).await;
    info!(
        closed = summary.closed_connections,
        accepted = summary.stats.accepted,
        rejected = summary.stats.rejected,
        messages = summary.stats.messages_received,
        bytes_relayed = summary.stats.bytes_relayed,
        uptime_secs = summary.stats.uptime_secs,
        "shutdown complete"
    );
    Ok(())
}

/// Resolves on Ctrl-C, or SIGTERM on unix.
async fn shutdown_signal() {
    let interrupt = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = interrupt => info!("received interrupt"),
        () = terminate => info!("received terminate"),
    }
}
