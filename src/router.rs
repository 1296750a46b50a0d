//! Initial route selection for connecting clients.
//!
//! A client asking for a cold backend is parked on the first configured
//! fallback (a holding backend that is always up) while the requested
//! backend is woken. Once the poll task finalizes, the substrate moves the
//! client from the fallback to the requested backend.

use crate::backend::BackendRegistry;
use crate::coordinator::{WakeCoordinator, WakeDispatch};
use crate::probe;
use crate::session::SessionId;
use parking_lot::RwLock;
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, info};

/// Where a connecting client should go first
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "route", rename_all = "snake_case")]
pub enum RouteDecision {
    /// Nothing requested or unknown backend; the proxy keeps its own choice
    Unchanged,
    /// The requested backend is up, connect directly
    Direct { backend: String },
    /// Park on `fallback` while `backend` starts
    Fallback {
        backend: String,
        fallback: String,
        dispatch: WakeDispatch,
    },
    /// No usable fallback; the client waits on the requested backend
    NoFallback {
        backend: String,
        dispatch: WakeDispatch,
    },
}

pub struct InitialRouter {
    coordinator: Arc<WakeCoordinator>,
    registry: Arc<dyn BackendRegistry>,
    fallback_order: RwLock<Vec<String>>,
}

impl InitialRouter {
    pub fn new(
        coordinator: Arc<WakeCoordinator>,
        registry: Arc<dyn BackendRegistry>,
        fallback_order: Vec<String>,
    ) -> Self {
        Self {
            coordinator,
            registry,
            fallback_order: RwLock::new(fallback_order),
        }
    }

    pub fn fallback_order(&self) -> Vec<String> {
        self.fallback_order.read().clone()
    }

    pub fn set_fallback_order(&self, order: Vec<String>) {
        *self.fallback_order.write() = order;
    }

    /// Pick the first route for `session`, waking `requested` if it is down.
    ///
    /// `client_version` is forwarded to the probe; without it the backend's
    /// configured protocol version is used.
    pub async fn select_initial_route(
        &self,
        session: SessionId,
        requested: Option<&str>,
        client_version: Option<i32>,
    ) -> RouteDecision {
        let Some(name) = requested else {
            return RouteDecision::Unchanged;
        };
        let Some(backend) = self.registry.resolve(name) else {
            debug!(%session, backend = name, "Requested backend is not configured");
            return RouteDecision::Unchanged;
        };

        if self.coordinator.substrate().has_active_clients(&backend.name) {
            return RouteDecision::Direct {
                backend: backend.name,
            };
        }

        let reachability = probe::probe(
            self.coordinator.probe().as_ref(),
            &backend,
            self.coordinator.timings().selection_probe_timeout,
            client_version.or(backend.protocol_version),
        )
        .await;
        if reachability.is_reachable() {
            return RouteDecision::Direct {
                backend: backend.name,
            };
        }

        let fallback = self
            .fallback_order()
            .into_iter()
            .find(|candidate| candidate != &backend.name && self.registry.resolve(candidate).is_some());

        let name = backend.name.clone();
        let dispatch = self.coordinator.ensure_started(session, backend).await;

        match fallback {
            Some(fallback) => {
                info!(%session, backend = %name, %fallback, "Parking session on fallback");
                RouteDecision::Fallback {
                    backend: name,
                    fallback,
                    dispatch,
                }
            }
            None => RouteDecision::NoFallback {
                backend: name,
                dispatch,
            },
        }
    }

    /// The client moved off `previous`. Leaving a fallback on its own means
    /// the client no longer needs to be routed, so its wait ends.
    pub fn on_server_switch(&self, session: SessionId, previous: Option<&str>) -> bool {
        let Some(previous) = previous else {
            return false;
        };
        if !self.fallback_order.read().iter().any(|name| name == previous) {
            return false;
        }
        self.coordinator.on_route_changed(session)
    }
}
