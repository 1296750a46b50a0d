use crate::backend::Backend;
use crate::config::WakeTimings;
use crate::poll::{PollContext, PollTask};
use crate::probe::SharedProbe;
use crate::registry::{TaskInfo, TaskRegistry};
use crate::session::{SessionId, SharedSubstrate};
use crate::throttle::{WakeRecordInfo, WakeThrottle};
use crate::wake::{SharedSender, WakeOutcome};
use parking_lot::RwLock;
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// What `ensure_started` did about the wake signal
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "wake", rename_all = "snake_case")]
pub enum WakeDispatch {
    /// This call sent the wake signal
    Sent { result: WakeOutcome },
    /// A wake for the backend is still within its cooldown
    AlreadyInFlight,
}

/// Entry point of the wake-and-reconnect orchestration.
///
/// Owns nothing global: the throttle, task registry, probe, sender and
/// substrate are all passed in, and the same instances may be shared with
/// other components (the admin API reads the registry and throttle).
///
/// ```ignore
/// let coordinator = WakeCoordinator::new(registry, throttle, probe, sender, substrate, timings);
/// coordinator.ensure_started(session, backend).await;
/// ```
pub struct WakeCoordinator {
    ctx: PollContext,
    sender: SharedSender,
    timings: RwLock<WakeTimings>,
}

impl WakeCoordinator {
    pub fn new(
        registry: Arc<TaskRegistry>,
        throttle: Arc<WakeThrottle>,
        probe: SharedProbe,
        sender: SharedSender,
        substrate: SharedSubstrate,
        timings: WakeTimings,
    ) -> Arc<Self> {
        throttle.set_cooldown(timings.wake_cooldown);
        Arc::new(Self {
            ctx: PollContext {
                registry,
                throttle,
                probe,
                substrate,
            },
            sender,
            timings: RwLock::new(timings),
        })
    }

    pub fn timings(&self) -> WakeTimings {
        self.timings.read().clone()
    }

    /// Apply reloaded timings; running tasks keep the timings they started with
    pub fn apply_timings(&self, timings: WakeTimings) {
        self.ctx.throttle.set_cooldown(timings.wake_cooldown);
        *self.timings.write() = timings;
    }

    pub fn probe(&self) -> &SharedProbe {
        &self.ctx.probe
    }

    pub fn substrate(&self) -> &SharedSubstrate {
        &self.ctx.substrate
    }

    /// Hold `session` until `backend` is reachable, waking it if needed.
    ///
    /// The poll task is registered before the wake request goes out, so the
    /// client is already waiting even if the request stalls. Wake failures
    /// clear the throttle and are logged; the poll continues regardless.
    pub async fn ensure_started(&self, session: SessionId, backend: Backend) -> WakeDispatch {
        let timings = self.timings();
        PollTask::spawn(self.ctx.clone(), session, backend.clone(), timings);
        info!(%session, backend = %backend.name, "Session waiting for backend");

        let Some(token) = self.ctx.throttle.try_mark(&backend.name) else {
            debug!(%session, backend = %backend.name, "Wake already in flight, not sending another");
            return WakeDispatch::AlreadyInFlight;
        };

        let result = self.sender.send_wake(&backend).await;
        if let Some(error) = result.error(&backend.name) {
            // Only our own record; a newer wake may own the slot by now
            self.ctx.throttle.clear_if(&backend.name, token);
            warn!(
                %session,
                backend = %backend.name,
                url = %backend.control_url(),
                %error,
                "Wake signal failed, throttle cleared"
            );
        }

        WakeDispatch::Sent { result }
    }

    /// Stop waiting for `session`. A no-op if it has no live task.
    pub fn cancel(&self, session: SessionId) -> bool {
        self.ctx.registry.cancel(session)
    }

    /// The client went away
    pub fn on_disconnect(&self, session: SessionId) -> bool {
        let cancelled = self.cancel(session);
        if cancelled {
            debug!(%session, "Session disconnected while waiting");
        }
        cancelled
    }

    /// The client's route was resolved through another path
    pub fn on_route_changed(&self, session: SessionId) -> bool {
        let cancelled = self.cancel(session);
        if cancelled {
            debug!(%session, "Session route changed while waiting");
        }
        cancelled
    }

    /// Cancel every waiting session
    pub fn shutdown(&self) -> usize {
        let cancelled = self.ctx.registry.cancel_all();
        if cancelled > 0 {
            info!(cancelled, "Cancelled waiting sessions");
        }
        cancelled
    }

    pub fn task(&self, session: SessionId) -> Option<TaskInfo> {
        self.ctx.registry.get(session)
    }

    pub fn pending_tasks(&self) -> Vec<TaskInfo> {
        self.ctx.registry.list()
    }

    pub fn throttled_backends(&self) -> Vec<WakeRecordInfo> {
        self.ctx.throttle.live_records()
    }

    pub fn purge_expired(&self) -> usize {
        self.ctx.throttle.purge_expired()
    }
}
