//! Standalone broker daemon.
//!
//! Runs the eventbuf broker as its own process so durable queues in other
//! processes can use it as an external broker.

use std::time::Duration;

use clap::Parser;
use tokio::signal;
use tracing::info;

use eventbuf::broker::server::{Broker, BrokerOptions};

/// eventbuf broker daemon.
#[derive(Debug, Parser)]
#[command(name = "eventbuf-broker", version, about = "Standalone eventbuf broker")]
struct Cli {
    /// Listen address (host:port; port 0 picks a free port)
    #[arg(short, long, default_value = "127.0.0.1:4150")]
    addr: String,

    /// Requeue wait for unacknowledged messages, in milliseconds
    #[arg(long, default_value_t = 30_000)]
    requeue_wait_ms: u64,

    /// Requeue sweep interval, in milliseconds
    #[arg(long, default_value_t = 250)]
    sweep_interval_ms: u64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    eventbuf::logging::init_logging();
    let cli = Cli::parse();

    let broker = Broker::bind(BrokerOptions {
        bind_addr: cli.addr,
        requeue_wait: Duration::from_millis(cli.requeue_wait_ms),
        sweep_interval: Duration::from_millis(cli.sweep_interval_ms),
    })
    .await?;
    info!(addr = %broker.addr(), "broker running, Ctrl+C to stop");

    signal::ctrl_c().await?;
    info!("shutting down");
    broker.shutdown();
    Ok(())
}
