//! Bounded-latency reachability checks against backends

use crate::backend::Backend;
use crate::config::ProbeKind;
use crate::error::WakeError;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tracing::debug;

/// Outcome of a single probe
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reachability {
    Reachable,
    /// Not confirmed reachable; carries the reason for logging
    Unreachable(WakeError),
}

impl Reachability {
    pub fn is_reachable(&self) -> bool {
        matches!(self, Reachability::Reachable)
    }
}

/// A single reachability check. Implementations do not need to enforce a
/// deadline themselves; [`probe`] races every check against its timeout.
#[async_trait]
pub trait HealthProbe: Send + Sync {
    async fn check(&self, backend: &Backend, version_hint: Option<i32>) -> Result<(), WakeError>;
}

pub type SharedProbe = Arc<dyn HealthProbe>;

/// Probe `backend` once, returning within `timeout` whatever the remote does.
pub async fn probe(
    checker: &dyn HealthProbe,
    backend: &Backend,
    timeout: Duration,
    version_hint: Option<i32>,
) -> Reachability {
    match tokio::time::timeout(timeout, checker.check(backend, version_hint)).await {
        Ok(Ok(())) => {
            debug!(backend = %backend.name, "Probe succeeded");
            Reachability::Reachable
        }
        Ok(Err(e)) => {
            debug!(backend = %backend.name, error = %e, "Probe failed");
            Reachability::Unreachable(e)
        }
        Err(_) => {
            debug!(backend = %backend.name, timeout_ms = timeout.as_millis() as u64, "Probe timed out");
            Reachability::Unreachable(WakeError::ProbeTimeout {
                backend: backend.name.clone(),
                timeout,
            })
        }
    }
}

/// Build the probe selected in configuration
pub fn from_kind(kind: &ProbeKind) -> SharedProbe {
    match kind {
        ProbeKind::Tcp => Arc::new(TcpProbe),
        ProbeKind::Http => Arc::new(HttpProbe),
    }
}

/// Reachable when a TCP connection to the backend address succeeds
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpProbe;

#[async_trait]
impl HealthProbe for TcpProbe {
    async fn check(&self, backend: &Backend, _version_hint: Option<i32>) -> Result<(), WakeError> {
        TcpStream::connect(backend.address())
            .await
            .map(|_| ())
            .map_err(|e| WakeError::ProbeTransportError {
                backend: backend.name.clone(),
                reason: e.to_string(),
            })
    }
}

/// Longest status line the HTTP probe will read
const MAX_STATUS_LINE: u64 = 1024;

/// Reachable when `GET <health_path>` answers with a 2xx status
#[derive(Debug, Clone, Copy, Default)]
pub struct HttpProbe;

#[async_trait]
impl HealthProbe for HttpProbe {
    async fn check(&self, backend: &Backend, version_hint: Option<i32>) -> Result<(), WakeError> {
        let transport = |e: std::io::Error| WakeError::ProbeTransportError {
            backend: backend.name.clone(),
            reason: e.to_string(),
        };

        let host_port = backend.address();
        let mut stream = TcpStream::connect(&host_port).await.map_err(transport)?;

        let mut request = format!(
            "GET {} HTTP/1.1\r\nHost: {}\r\nConnection: close\r\n",
            backend.health_path, host_port
        );
        if let Some(version) = version_hint {
            request.push_str(&format!("X-Protocol-Version: {}\r\n", version));
        }
        request.push_str("\r\n");

        stream.write_all(request.as_bytes()).await.map_err(transport)?;

        let mut reader = BufReader::new(stream.take(MAX_STATUS_LINE));
        let mut status_line = String::new();
        reader.read_line(&mut status_line).await.map_err(transport)?;
        if !status_line.ends_with('\n') {
            return Err(WakeError::ProbeTransportError {
                backend: backend.name.clone(),
                reason: format!("status line truncated after {} bytes", status_line.len()),
            });
        }

        // Format: "HTTP/1.1 200 OK\r\n"
        let status = status_line
            .split_whitespace()
            .nth(1)
            .and_then(|code| code.parse::<u16>().ok());

        match status {
            Some(code) if (200..300).contains(&code) => Ok(()),
            Some(code) => Err(WakeError::ProbeTransportError {
                backend: backend.name.clone(),
                reason: format!("HTTP {}", code),
            }),
            None => Err(WakeError::ProbeTransportError {
                backend: backend.name.clone(),
                reason: format!("malformed status line: {:?}", status_line.trim_end()),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    struct HangingProbe;

    #[async_trait]
    impl HealthProbe for HangingProbe {
        async fn check(&self, _backend: &Backend, _hint: Option<i32>) -> Result<(), WakeError> {
            futures::future::pending().await
        }
    }

    async fn serve_once(
        response: impl AsRef<[u8]> + Send + 'static,
    ) -> (u16, tokio::task::JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let handle = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 1024];
            let n = stream.read(&mut buf).await.unwrap();
            stream.write_all(response.as_ref()).await.unwrap();
            String::from_utf8_lossy(&buf[..n]).to_string()
        });
        (port, handle)
    }

    #[tokio::test(start_paused = true)]
    async fn test_hanging_probe_returns_at_deadline() {
        let backend = Backend::new("lobby-2", "127.0.0.1", 1);
        let start = tokio::time::Instant::now();

        let result = probe(&HangingProbe, &backend, Duration::from_secs(3), None).await;

        assert_eq!(start.elapsed(), Duration::from_secs(3));
        assert!(matches!(
            result,
            Reachability::Unreachable(WakeError::ProbeTimeout { .. })
        ));
    }

    #[tokio::test]
    async fn test_tcp_probe_reachable() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let backend = Backend::new("lobby-1", "127.0.0.1", port);

        let result = probe(&TcpProbe, &backend, Duration::from_secs(2), None).await;
        assert!(result.is_reachable());
    }

    #[tokio::test]
    async fn test_tcp_probe_refused() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        let backend = Backend::new("lobby-1", "127.0.0.1", port);

        let result = probe(&TcpProbe, &backend, Duration::from_secs(2), None).await;
        assert!(matches!(
            result,
            Reachability::Unreachable(WakeError::ProbeTransportError { .. })
        ));
    }

    #[tokio::test]
    async fn test_http_probe_sends_version_hint() {
        let (port, handle) = serve_once("HTTP/1.1 200 OK\r\nContent-Length: 0\r\n\r\n").await;
        let backend = Backend::new("lobby-1", "127.0.0.1", port);

        let result = probe(&HttpProbe, &backend, Duration::from_secs(2), Some(765)).await;
        assert!(result.is_reachable());

        let request = handle.await.unwrap();
        assert!(request.starts_with("GET /health HTTP/1.1"));
        assert!(request.contains("X-Protocol-Version: 765"));
    }

    #[tokio::test]
    async fn test_http_probe_non_success_status() {
        let (port, _handle) = serve_once("HTTP/1.1 503 Service Unavailable\r\n\r\n").await;
        let backend = Backend::new("lobby-1", "127.0.0.1", port);

        match probe(&HttpProbe, &backend, Duration::from_secs(2), None).await {
            Reachability::Unreachable(WakeError::ProbeTransportError { reason, .. }) => {
                assert_eq!(reason, "HTTP 503");
            }
            other => panic!("unexpected probe result: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_http_probe_caps_status_line() {
        let mut response = b"HTTP/1.1 200 ".to_vec();
        response.extend(std::iter::repeat(b'x').take(8192));
        let (port, _handle) = serve_once(response).await;
        let backend = Backend::new("lobby-1", "127.0.0.1", port);

        match probe(&HttpProbe, &backend, Duration::from_secs(2), None).await {
            Reachability::Unreachable(WakeError::ProbeTransportError { reason, .. }) => {
                assert_eq!(reason, "status line truncated after 1024 bytes");
            }
            other => panic!("unexpected probe result: {:?}", other),
        }
    }
}
