//! One-shot acknowledgment listener.
//!
//! Stands in for a backend's control endpoint while the backend itself is
//! down: it answers the first wake request with `200 OK` and exits, so the
//! host's supervisor can start the real backend on the same port.

use std::net::SocketAddr;
use std::path::Path;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tracing::{debug, info};

const ACK_RESPONSE: &[u8] = b"HTTP/1.1 200 OK\r\n\r\n";

pub struct AckListener {
    listener: TcpListener,
}

impl AckListener {
    pub async fn bind(addr: &str, port: u16) -> anyhow::Result<Self> {
        let listener = TcpListener::bind((addr, port)).await?;
        info!(addr = %listener.local_addr()?, "Waiting for wake request");
        Ok(Self { listener })
    }

    pub fn local_addr(&self) -> anyhow::Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept exactly one connection, acknowledge it and close.
    ///
    /// Returns the address of the peer that sent the wake request.
    pub async fn accept_one(self) -> anyhow::Result<SocketAddr> {
        let (mut stream, peer) = self.listener.accept().await?;

        // The request content is irrelevant; read what has arrived so the
        // peer does not see a reset before our response.
        let mut buf = [0u8; 1024];
        let read = stream.read(&mut buf).await.unwrap_or(0);
        debug!(%peer, bytes = read, "Received wake request");

        stream.write_all(ACK_RESPONSE).await?;
        stream.shutdown().await?;

        info!(%peer, "Acknowledged wake request");
        Ok(peer)
    }
}

/// Where to listen, read from a backend's `server.properties`.
///
/// An empty `server-ip` means every interface. `server-port` defaults to 25565.
pub fn listen_address(properties: &str) -> (String, u16) {
    let mut address = String::new();
    let mut port = 25565;

    for line in properties.lines() {
        let line = line.trim();
        if line.starts_with('#') {
            continue;
        }
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        match key.trim() {
            "server-ip" => address = value.trim().to_string(),
            "server-port" => {
                if let Ok(parsed) = value.trim().parse() {
                    port = parsed;
                }
            }
            _ => {}
        }
    }

    if address.is_empty() {
        address = "0.0.0.0".to_string();
    }
    (address, port)
}

/// Read [`listen_address`] from a properties file
pub fn listen_address_from_file(path: impl AsRef<Path>) -> anyhow::Result<(String, u16)> {
    let content = std::fs::read_to_string(path)?;
    Ok(listen_address(&content))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpStream;

    #[tokio::test]
    async fn test_acknowledges_single_request() {
        let ack = AckListener::bind("127.0.0.1", 0).await.unwrap();
        let addr = ack.local_addr().unwrap();
        let handle = tokio::spawn(ack.accept_one());

        let mut client = TcpStream::connect(addr).await.unwrap();
        client
            .write_all(b"GET /start HTTP/1.1\r\nHost: localhost\r\n\r\n")
            .await
            .unwrap();
        let mut response = Vec::new();
        client.read_to_end(&mut response).await.unwrap();

        assert_eq!(response, ACK_RESPONSE);
        let peer = handle.await.unwrap().unwrap();
        assert_eq!(peer, client.local_addr().unwrap());

        // The listener is gone once the request was acknowledged
        assert!(TcpStream::connect(addr).await.is_err());
    }

    #[test]
    fn test_listen_address_from_properties() {
        let properties = "#Minecraft server properties\nserver-ip=10.0.0.2\nserver-port=25566\nmotd=hi\n";
        assert_eq!(listen_address(properties), ("10.0.0.2".to_string(), 25566));
    }

    #[test]
    fn test_listen_address_defaults() {
        assert_eq!(listen_address("server-ip=\n"), ("0.0.0.0".to_string(), 25565));
        assert_eq!(
            listen_address("server-port=not-a-port\n"),
            ("0.0.0.0".to_string(), 25565)
        );
    }

    #[test]
    fn test_listen_address_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("server.properties");
        std::fs::write(&path, "server-port=25570\n").unwrap();
        assert_eq!(
            listen_address_from_file(&path).unwrap(),
            ("0.0.0.0".to_string(), 25570)
        );
    }
}
