//! Chat Relay Server - Entry Point
//!
//! Reads the optional listen port and runs the accept loop.

use std::env;
use std::sync::Arc;

use tracing::info;
use tracing_subscriber::EnvFilter;

use chat_relay::{ChatServer, ServerConfig};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Use RUST_LOG env var to control log level
    // e.g., RUST_LOG=debug or RUST_LOG=chat_relay=trace
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("chat_relay=info")),
        )
        .init();

    // Port from command line or default
    let config = ServerConfig::from_args(env::args().skip(1))?;
    info!("Starting chat relay on {}", config.bind_addr());

    let server = Arc::new(ChatServer::new(config));
    server.start().await?;

    Ok(())
}
