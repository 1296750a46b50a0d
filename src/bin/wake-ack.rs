//! wake-ack - answer a single wake request, then exit
//!
//! Usage:
//!   wake-ack <address> <port>    Listen on the given address
//!   wake-ack                     Listen on server-ip/server-port from ./server.properties
//!
//! Meant to run in place of a stopped backend: the host's supervisor starts
//! the real backend once this process exits.

use anyhow::Context;
use tracing::info;
use wakegate::ack::{listen_address_from_file, AckListener};
use wakegate::admin::{PKG_NAME, VERSION};

const PROPERTIES_FILE: &str = "server.properties";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("wakegate=info".parse().expect("valid log directive")),
        )
        .init();

    info!(name = PKG_NAME, version = VERSION, "Starting wake acknowledgment listener");

    let args: Vec<String> = std::env::args().skip(1).collect();
    let (address, port) = match args.as_slice() {
        [address, port, ..] => {
            let port = port
                .parse()
                .with_context(|| format!("Invalid port '{}'", port))?;
            (address.clone(), port)
        }
        _ => listen_address_from_file(PROPERTIES_FILE)
            .with_context(|| format!("Failed to read {}", PROPERTIES_FILE))?,
    };

    let listener = AckListener::bind(&address, port)
        .await
        .with_context(|| format!("Failed to listen on {}:{}", address, port))?;
    let peer = listener.accept_one().await?;

    info!(%peer, "Wake acknowledged, exiting");
    Ok(())
}
