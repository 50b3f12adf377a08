//! Minimal server that echoes every message it receives back to its sender,
//! reliable messages back reliably and unreliable messages back unreliably.
//! Run with a connect token generator of your own; this binary only speaks
//! the wire protocol, it doesn't issue tokens.

use std::net::SocketAddr;
use std::time::Duration;

use gamenet_server::config::ServerConfig;
use gamenet_server::{Connection, Server};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let listen_address: SocketAddr = "0.0.0.0:40000".parse()?;
    let config = ServerConfig {
        listen_address,
        public_address: listen_address,
        protocol_id: 0x6761_6d65_6e65_74, // arbitrary, must match whatever issues connect tokens
        private_key: [0u8; 32],
        timeout: Duration::from_secs(15),
        max_packet_size_bytes: 1200,
        max_clients: 64,
        client_inbound_capacity: 128,
    };

    let server = Server::bind(config).await?;
    tracing::info!(address = %server.local_addr(), "echo server listening");

    loop {
        let Some(connection) = server.accept().await else {
            break;
        };
        tokio::spawn(run_echo(connection));
    }

    Ok(())
}

async fn run_echo(mut connection: Connection) {
    let address = connection.instance.address();
    tracing::info!(%address, "client connected");

    while let Some(message) = connection.messages.recv().await {
        if let Err(err) = connection.instance.send(&message, true) {
            tracing::warn!(%address, %err, "failed to echo message back");
        }
    }

    tracing::info!(%address, "client disconnected");
}
