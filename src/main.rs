//! Mesh chat relay server binary
//!
//! Usage: relay-server [peer-port] [status-port] [--config <file>] [--id <name>]
//!                     [--control-port <port>] [--peer-port <port>] [--status-port <port>]
//!                     [--bind <addr>] [--advertise <ip>]

use std::sync::Arc;

use relay_server::{Config, Server};
use signal_hook::consts::{SIGINT, SIGTERM};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or("info"),
    )
    .init();

    let args: Vec<String> = std::env::args().collect();
    let config = Config::from_args(&args)?;

    log::info!("Relay server starting...");
    log::info!("  ID:           {}", config.server_id);
    log::info!("  Control port: {}", config.control_port);
    log::info!("  Peer port:    {}", config.peer_port);
    log::info!("  Status port:  {}", config.status_port);
    log::info!("  Max peers:    {}", config.max_peers);

    let mut server = Server::bind(&config)?;

    // Graceful shutdown: the loop checks the flag once per iteration
    let shutdown = server.shutdown_handle();
    signal_hook::flag::register(SIGINT, Arc::clone(&shutdown))?;
    signal_hook::flag::register(SIGTERM, Arc::clone(&shutdown))?;

    server.run()?;
    log::info!("Relay server stopped");
    Ok(())
}
