//! coop-uring: echo server and client on a single-threaded io_uring runtime
//!
//! Server mode accepts connections on a multishot acceptor and echoes
//! everything back, disconnecting clients that stay quiet for too long.
//! Client mode connects, sends a list of messages and checks each echo.
//!
//! Configuration via CLI arguments or TOML file.

use coop_uring::config::{Config, Mode};
use coop_uring::echo;
use coop_uring::Ring;
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
        mode = ?config.mode,
        sq_entries = config.ring.sq_entries,
        "Starting coop-uring"
    );

    let ring = Ring::new(&config.ring)?;

    match config.mode {
        Mode::Server => run_server(&ring, config),
        Mode::Client => run_client(&ring, config),
    }
}

/// Run the echo server until accepting fails for good.
fn run_server(ring: &Ring, config: Config) -> Result<(), Box<dyn std::error::Error>> {
    info!(
        host = %config.server.host,
        port = %config.server.port,
        max_connections = config.server.max_connections,
        "Running echo server"
    );
    ring.block_on(echo::run_echo_server(ring.handle(), config.server))??;
    Ok(())
}

/// Run the echo client once.
fn run_client(ring: &Ring, config: Config) -> Result<(), Box<dyn std::error::Error>> {
    info!(
        host = %config.client.host,
        port = %config.client.port,
        messages = config.client.messages.len(),
        "Running echo client"
    );
    let round_trips = ring.block_on(echo::run_echo_client(ring.handle(), config.client))??;
    info!(round_trips, "Echo client finished");
    Ok(())
}
