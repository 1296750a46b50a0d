//! Client sessions and the routing substrate that owns them
//!
//! The core never owns a session. It holds a [`SessionId`] and talks to the
//! proxy through [`RoutingSubstrate`], which may forget a session at any time.

use crate::backend::Backend;
use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Identity of one client connection attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(Uuid);

impl SessionId {
    pub fn new_v4() -> Self {
        Self(Uuid::new_v4())
    }
}

impl From<Uuid> for SessionId {
    fn from(id: Uuid) -> Self {
        Self(id)
    }
}

impl FromStr for SessionId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// The proxy that owns client connections.
///
/// Callbacks must not block: they run on the poll task of the session.
#[async_trait]
pub trait RoutingSubstrate: Send + Sync {
    /// Whether any client is currently connected to `backend`
    fn has_active_clients(&self, backend: &str) -> bool;

    /// Whether `session` is still known to the proxy
    fn is_connected(&self, session: SessionId) -> bool;

    /// Connect the client to `backend`
    async fn finalize(&self, session: SessionId, backend: &Backend);

    /// Tell the client `backend` is starting and when it is checked next
    async fn show_waiting(&self, session: SessionId, backend: &str, next_check: Duration);

    /// Tell the client `backend` did not come up and waiting stopped
    async fn wait_expired(&self, session: SessionId, backend: &str);
}

pub type SharedSubstrate = Arc<dyn RoutingSubstrate>;

/// Callback payload posted by [`WebhookSubstrate`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SessionEvent {
    Finalize {
        session: SessionId,
        backend: String,
        address: String,
    },
    Waiting {
        session: SessionId,
        backend: String,
        next_check_secs: u64,
    },
    Expired {
        session: SessionId,
        backend: String,
    },
}

impl SessionEvent {
    pub fn session(&self) -> SessionId {
        match self {
            SessionEvent::Finalize { session, .. }
            | SessionEvent::Waiting { session, .. }
            | SessionEvent::Expired { session, .. } => *session,
        }
    }
}

/// What the daemon knows about a session reported by the proxy
#[derive(Debug, Clone, Default, Serialize)]
pub struct SessionInfo {
    /// Backend the session is currently routed to, if any
    pub backend: Option<String>,
}

/// Substrate for standalone deployment.
///
/// The proxy reports sessions through the admin API; outcomes are posted as
/// JSON [`SessionEvent`]s to `callback_url`.
pub struct WebhookSubstrate {
    sessions: DashMap<SessionId, SessionInfo>,
    callback_url: Option<String>,
    http_client: reqwest::Client,
}

impl WebhookSubstrate {
    pub fn new(callback_url: Option<String>, timeout: Duration) -> anyhow::Result<Self> {
        let http_client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            sessions: DashMap::new(),
            callback_url,
            http_client,
        })
    }

    /// Record that the proxy knows `session`
    pub fn register(&self, session: SessionId) {
        self.sessions.entry(session).or_default();
    }

    /// Record that `session` is now routed to `backend`
    pub fn set_backend(&self, session: SessionId, backend: &str) {
        self.sessions.entry(session).or_default().backend = Some(backend.to_string());
    }

    /// Forget `session`; returns true if it was known
    pub fn remove(&self, session: SessionId) -> bool {
        self.sessions.remove(&session).is_some()
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    async fn post(&self, event: SessionEvent) {
        let Some(url) = &self.callback_url else {
            debug!(session = %event.session(), ?event, "No callback URL configured, dropping event");
            return;
        };

        let result = self
            .http_client
            .post(url)
            .header("User-Agent", "Wakegate/1.0")
            .json(&event)
            .send()
            .await;

        match result {
            Ok(response) if response.status().is_success() => {
                debug!(session = %event.session(), %url, "Session event delivered");
            }
            Ok(response) => {
                warn!(session = %event.session(), %url, status = %response.status(), "Callback rejected session event");
            }
            Err(e) => {
                warn!(session = %event.session(), %url, error = %e, "Failed to deliver session event");
            }
        }
    }
}

#[async_trait]
impl RoutingSubstrate for WebhookSubstrate {
    fn has_active_clients(&self, backend: &str) -> bool {
        self.sessions
            .iter()
            .any(|entry| entry.value().backend.as_deref() == Some(backend))
    }

    fn is_connected(&self, session: SessionId) -> bool {
        self.sessions.contains_key(&session)
    }

    async fn finalize(&self, session: SessionId, backend: &Backend) {
        self.set_backend(session, &backend.name);
        info!(%session, backend = %backend.name, "Routing session to backend");
        self.post(SessionEvent::Finalize {
            session,
            backend: backend.name.clone(),
            address: backend.address(),
        })
        .await;
    }

    async fn show_waiting(&self, session: SessionId, backend: &str, next_check: Duration) {
        self.post(SessionEvent::Waiting {
            session,
            backend: backend.to_string(),
            next_check_secs: next_check.as_secs(),
        })
        .await;
    }

    async fn wait_expired(&self, session: SessionId, backend: &str) {
        self.post(SessionEvent::Expired {
            session,
            backend: backend.to_string(),
        })
        .await;
    }
}
