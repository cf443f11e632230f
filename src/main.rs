//! Synchronized-watching Room Server - Entry Point
//!
//! Loads configuration, starts the room registry and its sweeper, and accepts
//! WebSocket connections.

use std::env;
use std::sync::Arc;

use tokio::net::TcpListener;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use syncroom::{handle_connection, Config, MemoryDatabase, Rooms};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Use RUST_LOG env var to control log level
    // e.g., RUST_LOG=debug or RUST_LOG=syncroom=trace
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("syncroom=info")),
        )
        .init();

    let mut config = Config::from_env()?;
    // Bind address from the command line wins over the environment
    if let Some(addr) = env::args().nth(1) {
        config.bind_addr = addr;
    }
    let config = Arc::new(config);
    info!(?config, "Configuration loaded");

    let rooms = Arc::new(Rooms::new(
        Arc::new(MemoryDatabase::new()),
        Arc::clone(&config),
    ));
    rooms.spawn_sweeper();
    info!("Room sweeper started, every {:?}", config.sweep_interval);

    let listener = TcpListener::bind(&config.bind_addr).await?;
    info!("Room server listening on {}", config.bind_addr);

    // Connection accept loop
    loop {
        match listener.accept().await {
            Ok((stream, addr)) => {
                info!("New connection from {}", addr);
                let rooms = Arc::clone(&rooms);

                tokio::spawn(async move {
                    if let Err(e) = handle_connection(stream, rooms).await {
                        error!("Connection handler error: {}", e);
                    }
                });
            }
            Err(e) => {
                error!("Failed to accept connection: {}", e);
            }
        }
    }
}
