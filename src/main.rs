//! memprobe: fan-out latency probe for a memcached service
//!
//! Serves a small HTTP surface:
//! - `/mem?count=N` fires N concurrent lookups of one key and waits for all
//! - `/think`, `/chan` run CPU and task-handoff baselines
//! - `/stats` reports probe counters
//!
//! Configuration via CLI arguments or TOML file.

mod client;
mod config;
mod http;
mod probe;
mod protocol;
mod report;
mod workload;

use client::MemcacheClient;
use config::Config;
use probe::Prober;
use std::sync::Arc;
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
        cache_server = %config.cache_server,
        key = %config.key,
        deadline_secs = config.deadline.as_secs(),
        pool_size = config.pool_size,
        max_count = config.max_count,
        max_in_flight = ?config.max_in_flight,
        report = ?config.report,
        "Starting memprobe"
    );

    let mut builder = tokio::runtime::Builder::new_multi_thread();
    if let Some(workers) = config.workers {
        builder.worker_threads(workers);
    }
    let runtime = builder.enable_all().build()?;

    runtime.block_on(run(config))
}

/// Build the probe state once and serve until shutdown.
async fn run(config: Config) -> Result<(), Box<dyn std::error::Error>> {
    let client = Arc::new(MemcacheClient::new(
        config.cache_server.clone(),
        config.pool_size,
    ));
    let prober = Prober::new(client, config.key.clone(), config.deadline)
        .with_max_in_flight(config.max_in_flight);

    let state = http::AppState {
        prober: Arc::new(prober),
        report: config.report,
        max_count: config.max_count,
    };

    let listener = tokio::net::TcpListener::bind(&config.listen).await?;
    info!(address = %config.listen, "HTTP server listening");

    http::serve(listener, state).await?;
    Ok(())
}
