//! Out-of-band wake signals sent to a backend's control endpoint

use crate::backend::Backend;
use crate::error::WakeError;
use async_trait::async_trait;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// Result of one wake request
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", content = "reason", rename_all = "snake_case")]
pub enum WakeOutcome {
    /// The endpoint acknowledged the request; the backend may still be starting
    Accepted,
    /// The endpoint answered with a non-success status
    Rejected(String),
    /// The endpoint could not be reached or spoke garbage
    TransportError(String),
}

impl WakeOutcome {
    pub fn is_accepted(&self) -> bool {
        matches!(self, WakeOutcome::Accepted)
    }

    /// The error this outcome represents, if any
    pub fn error(&self, backend: &str) -> Option<WakeError> {
        match self {
            WakeOutcome::Accepted => None,
            WakeOutcome::Rejected(reason) => Some(WakeError::WakeRejected {
                backend: backend.to_string(),
                reason: reason.clone(),
            }),
            WakeOutcome::TransportError(reason) => Some(WakeError::WakeTransportError {
                backend: backend.to_string(),
                reason: reason.clone(),
            }),
        }
    }
}

/// Delivers the "start this backend" signal
#[async_trait]
pub trait WakeSender: Send + Sync {
    async fn send_wake(&self, backend: &Backend) -> WakeOutcome;
}

pub type SharedSender = Arc<dyn WakeSender>;

/// Sends `GET http://<host>:<port>/<control-path>` with no body
pub struct HttpWakeSender {
    http_client: reqwest::Client,
}

impl HttpWakeSender {
    pub fn new(timeout: Duration) -> anyhow::Result<Self> {
        let http_client = reqwest::Client::builder()
            .timeout(timeout)
            .connect_timeout(timeout)
            .build()?;
        Ok(Self { http_client })
    }
}

#[async_trait]
impl WakeSender for HttpWakeSender {
    async fn send_wake(&self, backend: &Backend) -> WakeOutcome {
        let url = match reqwest::Url::parse(&backend.control_url()) {
            Ok(url) => url,
            Err(e) => {
                return WakeOutcome::TransportError(format!(
                    "invalid control URL {}: {}",
                    backend.control_url(),
                    e
                ))
            }
        };

        debug!(backend = %backend.name, %url, "Sending wake request");

        let response = match self.http_client.get(url.clone()).send().await {
            Ok(response) => response,
            Err(e) => return WakeOutcome::TransportError(e.to_string()),
        };

        let status = response.status();
        if status.is_success() {
            info!(backend = %backend.name, %url, "Sent wake request");
            WakeOutcome::Accepted
        } else {
            WakeOutcome::Rejected(format!("HTTP {}", status.as_u16()))
        }
    }
}
