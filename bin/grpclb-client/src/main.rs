use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use grpclb_balancer::{LoadBalancer, LoadBalancingStrategy};
use grpclb_core::{Address, Resolver, StoreConfig, Target};
use grpclb_etcd::{DiscoveryMetrics, DiscoveryState, Discoverer};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Clone, Copy, Debug, ValueEnum)]
enum Strategy {
    RoundRobin,
    Random,
}

impl From<Strategy> for LoadBalancingStrategy {
    fn from(s: Strategy) -> Self {
        match s {
            Strategy::RoundRobin => LoadBalancingStrategy::RoundRobin,
            Strategy::Random => LoadBalancingStrategy::Random,
        }
    }
}

/// Demo consumer: discovers instances and spreads requests across them
#[derive(Parser, Debug)]
#[command(name = "grpclb-client")]
struct Args {
    /// Resolver target, `scheme://authority/service`
    #[arg(long, default_value = "grpc-load-balance:///user-center")]
    target: String,

    /// Number of requests to send
    #[arg(long, default_value_t = 100)]
    requests: usize,

    /// Pause between requests, in milliseconds
    #[arg(long, default_value_t = 1000)]
    interval_ms: u64,

    /// Instance selection policy
    #[arg(long, value_enum, default_value_t = Strategy::RoundRobin)]
    strategy: Strategy,

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

    info!("Starting grpclb-client...");

    let target = Target::parse(&args.target)?;
    let config = StoreConfig::load(args.config.as_deref(), &args.etcd)?;
    let metrics = DiscoveryMetrics::new()?;

    let discoverer = match Discoverer::connect(&config).await {
        Ok(discoverer) => discoverer.with_scheme(target.scheme.clone()).with_metrics(metrics.clone()),
        Err(e) => {
            error!("Failed to connect to etcd: {}", e);
            return Err(e.into());
        }
    };

    let balancer = Arc::new(LoadBalancer::new(args.strategy.into()));
    discoverer
        .build(&target, balancer.clone())
        .await
        .with_context(|| format!("resolving {}", target))?;

    let mut state = discoverer.subscribe_state();
    tokio::spawn(async move {
        while state.changed().await.is_ok() {
            let current = *state.borrow();
            if current == DiscoveryState::Closed {
                warn!("Discovery stopped; addresses will no longer update");
            } else {
                info!("Discovery state: {}", current);
            }
        }
    });

    let interval = Duration::from_millis(args.interval_ms);
    for i in 0..args.requests {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Shutdown signal received, exiting...");
                break;
            }
            _ = send_once(&balancer, i) => {}
        }
        tokio::time::sleep(interval).await;
    }

    discoverer.close().await;
    match metrics.gather() {
        Ok(text) => debug!("Discovery metrics:\n{}", text),
        Err(e) => debug!("Failed to gather metrics: {}", e),
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

async fn send_once(balancer: &LoadBalancer, seq: usize) {
    let Some(addr) = balancer.pick() else {
        warn!("Request {}: no instances available, service temporarily unavailable", seq);
        return;
    };

    match tokio::time::timeout(Duration::from_secs(3), call(&addr, seq)).await {
        Ok(Ok(reply)) => println!("{}", reply),
        Ok(Err(e)) => warn!("Request {} to {} failed: {}", seq, addr, e),
        Err(_) => warn!("Request {} to {} timed out", seq, addr),
    }
}

/// Send one hello line and read the reply
async fn call(addr: &Address, seq: usize) -> Result<String> {
    let stream = TcpStream::connect(addr.as_str()).await?;
    let (reader, mut writer) = stream.into_split();
    writer.write_all(format!("hello {}\n", seq).as_bytes()).await?;

    let mut lines = BufReader::new(reader).lines();
    let reply = lines
        .next_line()
        .await?
        .context("connection closed before reply")?;
    Ok(reply)
}
