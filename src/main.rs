//! Multi-user TCP Chat Server - Entry Point
//!
//! Binds the listening socket and runs the accept loop until Ctrl-C.

use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::EnvFilter;

use chat_hub::{Config, Listener};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Use RUST_LOG env var to control log level
    // e.g., RUST_LOG=debug or RUST_LOG=chat_hub=trace
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("chat_hub=info")),
        )
        .init();

    let config = Config::from_env();

    let socket = TcpListener::bind(&config.addr).await?;
    let listener = Listener::new(socket, config.session)?;
    info!("Chat server listening on {}", listener.local_addr()?);

    listener.run_until_ctrl_c().await?;

    info!("Chat server stopped");
    Ok(())
}
