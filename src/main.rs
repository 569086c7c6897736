//! gabriel-roundtrip: a Gabriel cognitive engine server
//!
//! Clients stream camera frames over TCP; each frame is handed to one of
//! three engines:
//! - `roundtrip`: echo the image back unchanged
//! - `rotate`: rotate the image and re-encode as JPEG
//! - `crash`: rotate, dump to disk, then fault (exercises fault reporting)
//!
//! Features:
//! - Gabriel protobuf messages over length-prefixed TCP frames
//! - Token-based per-client flow control
//! - Bounded engine concurrency with a per-frame timeout
//! - Configuration via CLI arguments or TOML file

mod config;
mod engine;
mod frame;
mod protocol;
mod server;

use config::Config;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
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
        engine = ?config.engine,
        source = %config.source,
        workers = config.workers,
        tokens = config.tokens,
        timeout_secs = config.timeout.as_secs(),
        "Starting gabriel-roundtrip server"
    );

    let factory = engine::factory(&config);
    server::run(config, factory).await
}
