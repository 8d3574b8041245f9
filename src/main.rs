//! netprobe: a network diagnostics server
//!
//! Clients connect over TCP, register a name and age, then issue
//! line-oriented commands:
//! - ICMP echo probes (`/ping`)
//! - TCP port probes and range scans (`/port`, `/res_time`)
//! - A shared in-memory user registry (`/get`, `/post`)
//!
//! Configuration comes from CLI arguments or a TOML file.

mod config;
mod probes;
mod protocol;
mod registry;
mod server;
mod session;

use config::Config;
use server::Server;
use tracing::info;
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let config = Config::load()?;

    // Initialize logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    info!(
        listen = %config.listen,
        workers = ?config.workers,
        max_sessions = config.max_sessions,
        ping_timeout_ms = config.ping_timeout_ms,
        port_timeout_ms = config.port_timeout_ms,
        idle_timeout_secs = config.idle_timeout_secs,
        "Starting netprobe server"
    );

    let mut builder = tokio::runtime::Builder::new_multi_thread();
    builder.enable_all();
    if let Some(workers) = config.workers {
        builder.worker_threads(workers);
    }
    let runtime = builder.build()?;

    runtime.block_on(async move { Server::new(config).run().await })
}
