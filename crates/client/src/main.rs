//! NodeLink client
//!
//! Command-line front end: probe nodes, ping, send a query, or serve the
//! HTTP health endpoint.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use client::{logging, Config, NodeClient};
use protocol::query_fields;

/// NodeLink client - talk to the fastest reachable node.
#[derive(Parser, Debug)]
#[command(name = "nodelink")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands.
#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Probe every candidate node and show reachability and latency
    Probe,

    /// Connect and measure round-trip latency
    Ping {
        /// Number of pings to send
        #[arg(long, short = 'n', default_value = "1")]
        count: u32,
    },

    /// Send a query and print the response
    Request {
        /// Value of the `q` field
        query: String,

        /// Seconds to wait for the response (defaults to the configured value)
        #[arg(long, short)]
        timeout: Option<u64>,
    },

    /// Serve the HTTP health endpoint
    Serve {
        /// Port to listen on (overrides config and PORT)
        #[arg(long, short)]
        port: Option<u16>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => Config::load(path)?,
        None => Config::load_default()?,
    };
    let overrides = config.apply_env_overrides()?;
    if cli.verbose {
        config.client.log_level = "debug".to_string();
    }
    config.validate()?;

    let _log_guard = logging::init(&config.client.log_level, config.client.log_dir.as_deref())?;
    for env in &overrides {
        env.log();
    }
    if let Some(path) = &cli.config {
        tracing::debug!("Using config file: {:?}", path);
    }

    let client = Arc::new(NodeClient::from_config(&config)?);

    let result = match cli.command {
        Commands::Probe => run_probe(&client).await,
        Commands::Ping { count } => run_ping(&client, count).await,
        Commands::Request { query, timeout } => {
            let timeout = timeout
                .map(Duration::from_secs)
                .unwrap_or_else(|| config.session.receive_timeout());
            run_request(&client, &query, timeout).await
        }
        Commands::Serve { port } => {
            let port = port.unwrap_or(config.http.port);
            let addr: SocketAddr = format!("{}:{}", config.http.bind, port)
                .parse()
                .with_context(|| format!("Invalid bind address: {}:{}", config.http.bind, port))?;
            run_serve(Arc::clone(&client), addr).await
        }
    };

    client.close().await;
    result
}

async fn run_probe(client: &NodeClient) -> anyhow::Result<()> {
    let candidates = client.probe().await;

    println!("{:<40} {:<10} {:>12}", "NODE", "STATUS", "LATENCY");
    println!("{}", "-".repeat(64));
    for candidate in &candidates {
        let status = if candidate.reachable { "up" } else { "down" };
        let latency = if candidate.reachable {
            format!("{:.3} ms", candidate.latency_secs() * 1000.0)
        } else {
            "-".to_string()
        };
        println!("{:<40} {:<10} {:>12}", candidate.addr(), status, latency);
    }

    if let Some(selected) = client.selected().await {
        println!();
        println!("Selected: {}", selected.addr());
    }
    Ok(())
}

async fn run_ping(client: &NodeClient, count: u32) -> anyhow::Result<()> {
    client.connect().await?;

    let mut failures = 0u32;
    for seq in 1..=count {
        match client.ping().await {
            Ok(latency) => println!(
                "ping {}: {:.3} ms",
                seq,
                latency.as_secs_f64() * 1000.0
            ),
            Err(e) => {
                failures += 1;
                eprintln!("ping {}: {}", seq, e);
                if e.is_connection_loss() {
                    break;
                }
            }
        }
        if seq < count {
            tokio::time::sleep(Duration::from_secs(1)).await;
        }
    }

    if failures > 0 {
        anyhow::bail!("{} of {} pings failed", failures, count);
    }
    Ok(())
}

async fn run_request(client: &NodeClient, query: &str, timeout: Duration) -> anyhow::Result<()> {
    let response = client.request(query_fields(query), timeout).await?;

    let body = serde_json::to_string_pretty(response.fields())
        .context("Failed to render response")?;
    println!("{}", body);
    Ok(())
}

async fn run_serve(client: Arc<NodeClient>, addr: SocketAddr) -> anyhow::Result<()> {
    if let Err(e) = client.connect().await {
        tracing::warn!(error = %e, "Initial connection failed; will retry on first health check");
    }

    client::health::serve(client, addr, wait_for_shutdown_signal())
        .await
        .context("Health endpoint failed")?;
    tracing::info!("Health endpoint stopped");
    Ok(())
}

/// Wait for a shutdown signal (SIGTERM or SIGINT).
async fn wait_for_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = sigterm.recv() => tracing::info!("Received SIGTERM"),
                    _ = tokio::signal::ctrl_c() => tracing::info!("Received SIGINT"),
                }
                return;
            }
            Err(e) => tracing::warn!(error = %e, "Failed to register SIGTERM handler"),
        }
    }

    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for Ctrl-C");
    }
}
