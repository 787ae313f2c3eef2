use anyhow::{bail, Result};
use clap::Parser;
use grpclb_core::StoreConfig;
use grpclb_etcd::Registrar;
use std::path::PathBuf;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

/// Demo provider: serves hello requests and registers itself for discovery
#[derive(Parser, Debug)]
#[command(name = "grpclb-server")]
struct Args {
    /// Port to listen on
    #[arg(long, default_value = "")]
    port: String,

    /// Host the instance is reachable at
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    /// Service name to register under
    #[arg(long, default_value = "user-center")]
    service: String,

    /// Lease TTL in seconds
    #[arg(long, default_value_t = 5)]
    ttl: i64,

    /// etcd endpoints, comma separated
    #[arg(long, value_delimiter = ',')]
    etcd: Vec<String>,

    /// YAML file with store settings
    #[arg(long)]
    config: Option<PathBuf>,

    /// Emit logs as JSON
    #[arg(long)]
    json_logs: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(args.json_logs);

    if args.port.trim().is_empty() {
        error!("--port is required");
        bail!("server port must not be empty");
    }

    let addr = format!("{}:{}", args.host, args.port.trim());
    let listener = match TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(e) => {
            error!("Failed to listen on {}: {}", addr, e);
            return Err(e.into());
        }
    };
    info!("Listening on {}", addr);

    let config = StoreConfig::load(args.config.as_deref(), &args.etcd)?;
    let registrar = match Registrar::connect(&config, &args.service, &addr, args.ttl).await {
        Ok(registrar) => registrar,
        Err(e) => {
            error!("Service registration failed: {}", e);
            return Err(e.into());
        }
    };

    let served = tokio::spawn(serve(listener, addr.clone()));

    shutdown_signal().await;
    info!("Shutdown signal received, deregistering {}", registrar.key());

    served.abort();
    if let Err(e) = registrar.close().await {
        error!("Failed to deregister: {}", e);
        return Err(e.into());
    }

    Ok(())
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if json {
        tracing_subscriber::fmt().with_env_filter(filter).json().init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

/// Resolve on Ctrl-C, or SIGTERM where available
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}

/// Accept connections in a loop
async fn serve(listener: TcpListener, addr: String) {
    loop {
        match listener.accept().await {
            Ok((stream, peer_addr)) => {
                let addr = addr.clone();
                tokio::spawn(async move {
                    if let Err(e) = handle_connection(stream, &addr).await {
                        debug!("Error serving connection from {}: {}", peer_addr, e);
                    }
                });
            }
            Err(e) => {
                warn!("Error accepting connection: {}", e);
            }
        }
    }
}

/// Answer each request line with the serving instance's address
async fn handle_connection(stream: TcpStream, addr: &str) -> std::io::Result<()> {
    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();

    while let Some(line) = lines.next_line().await? {
        info!("Request {:?} handled by {}", line, addr);
        writer
            .write_all(format!("server {} received the request\n", addr).as_bytes())
            .await?;
    }
    Ok(())
}
