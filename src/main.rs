//! synping: TCP handshake latency monitor.
//!
//! Usage:
//!   synping <HOST> [-I <IFACE>] [-p <PORT>] [-i <MS>] [-t <MS>] [-c <N>] [--output json|pretty]

use clap::Parser;
use synping::cli::{self, Cli};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    // Initialise logging (RUST_LOG=debug etc.)
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    if let Err(e) = cli::run_ping(&cli).await {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}
