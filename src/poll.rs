//! Per-client poll task: probe the target backend until it answers, then
//! route the client there; report wait status in between.
//!
//! ```text
//! Scheduled -> Probing -> Succeeded
//!                 |  ^
//!                 v  |
//!               Waiting -> Expired (attempt ceiling)
//!
//! any state -> Cancelled
//! ```

use crate::backend::Backend;
use crate::config::WakeTimings;
use crate::error::WakeError;
use crate::probe::{self, Reachability, SharedProbe};
use crate::registry::{TaskEntry, TaskRegistry};
use crate::session::{SessionId, SharedSubstrate};
use crate::throttle::WakeThrottle;
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// State of a poll task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PollState {
    /// Waiting for the initial delay before the first probe
    #[default]
    Scheduled,
    /// A probe is in flight
    Probing,
    /// Last probe failed, next one is scheduled
    Waiting,
    /// Backend answered and the client was routed to it
    Succeeded,
    /// Stopped by disconnect, route change, supersede or a stale session
    Cancelled,
    /// Gave up after the attempt ceiling
    Expired,
}

impl PollState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            PollState::Succeeded | PollState::Cancelled | PollState::Expired
        )
    }
}

/// Progress shared between a running task and its registry entry
#[derive(Debug, Default)]
pub struct PollProgress {
    attempts: AtomicU32,
    state: Mutex<PollState>,
}

impl PollProgress {
    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }

    pub fn state(&self) -> PollState {
        *self.state.lock()
    }

    fn record_attempt(&self) -> u32 {
        self.attempts.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn set_state(&self, state: PollState) {
        *self.state.lock() = state;
    }
}

/// Collaborators every poll task needs
#[derive(Clone)]
pub struct PollContext {
    pub registry: Arc<TaskRegistry>,
    pub throttle: Arc<WakeThrottle>,
    pub probe: SharedProbe,
    pub substrate: SharedSubstrate,
}

enum Step {
    /// Probe again after the poll interval
    Retry,
    Finish(PollState),
}

/// One client's wait for one backend
pub struct PollTask {
    session: SessionId,
    backend: Backend,
    generation: u64,
    timings: WakeTimings,
    progress: Arc<PollProgress>,
    cancel_rx: watch::Receiver<bool>,
    ctx: PollContext,
}

impl PollTask {
    /// Build a task and install it in the registry, superseding any previous
    /// task of the session. The task does nothing until [`run`](Self::run).
    pub fn register(
        ctx: PollContext,
        session: SessionId,
        backend: Backend,
        timings: WakeTimings,
    ) -> Self {
        let generation = ctx.registry.next_generation();
        let progress = Arc::new(PollProgress::default());
        let (cancel_tx, cancel_rx) = watch::channel(false);

        let entry = TaskEntry::new(generation, &backend.name, Arc::clone(&progress), cancel_tx);
        ctx.registry.set(session, entry);

        Self {
            session,
            backend,
            generation,
            timings,
            progress,
            cancel_rx,
            ctx,
        }
    }

    /// Register and spawn a task on the runtime
    pub fn spawn(
        ctx: PollContext,
        session: SessionId,
        backend: Backend,
        timings: WakeTimings,
    ) -> tokio::task::JoinHandle<PollState> {
        let task = Self::register(ctx, session, backend, timings);
        tokio::spawn(task.run())
    }

    /// Drive the state machine to a terminal state
    pub async fn run(mut self) -> PollState {
        debug!(
            session = %self.session,
            backend = %self.backend.name,
            generation = self.generation,
            delay_ms = self.timings.initial_poll_delay.as_millis() as u64,
            "Poll task scheduled"
        );

        let mut delay = self.timings.initial_poll_delay;
        loop {
            if !self.sleep_unless_cancelled(delay).await {
                return self.finish(PollState::Cancelled);
            }

            match self.probe_once().await {
                Step::Retry => delay = self.timings.poll_interval,
                Step::Finish(state) => return self.finish(state),
            }
        }
    }

    fn finish(&self, state: PollState) -> PollState {
        self.progress.set_state(state);
        debug!(
            session = %self.session,
            backend = %self.backend.name,
            ?state,
            attempts = self.progress.attempts(),
            "Poll task finished"
        );
        state
    }

    fn is_cancelled(&self) -> bool {
        *self.cancel_rx.borrow() || !self.ctx.registry.is_current(self.session, self.generation)
    }

    /// Sleep for `delay`; returns false if the task was cancelled meanwhile
    async fn sleep_unless_cancelled(&mut self, delay: Duration) -> bool {
        if self.is_cancelled() {
            return false;
        }

        tokio::select! {
            _ = tokio::time::sleep(delay) => !self.is_cancelled(),
            // Err means the registry entry (and its sender) is gone
            _ = self.cancel_rx.changed() => false,
        }
    }

    async fn probe_once(&mut self) -> Step {
        let session = self.session;

        if !self.ctx.substrate.is_connected(session) {
            let reason = WakeError::StaleSession {
                session: session.to_string(),
            };
            debug!(backend = %self.backend.name, %reason, "Dropping poll task");
            self.ctx.registry.complete(session, self.generation);
            return Step::Finish(PollState::Cancelled);
        }

        self.progress.set_state(PollState::Probing);
        let result = probe::probe(
            self.ctx.probe.as_ref(),
            &self.backend,
            self.timings.probe_timeout,
            self.backend.protocol_version,
        )
        .await;

        match result {
            Reachability::Reachable => self.succeed().await,
            Reachability::Unreachable(reason) => self.wait(reason).await,
        }
    }

    async fn succeed(&mut self) -> Step {
        // Claiming the registry entry is what makes this the one live task
        if !self.ctx.registry.complete(self.session, self.generation) {
            debug!(
                session = %self.session,
                backend = %self.backend.name,
                "Discarding probe result of cancelled poll task"
            );
            return Step::Finish(PollState::Cancelled);
        }

        self.progress.set_state(PollState::Succeeded);
        self.ctx.throttle.clear(&self.backend.name);
        self.ctx.substrate.finalize(self.session, &self.backend).await;

        info!(
            session = %self.session,
            backend = %self.backend.name,
            attempts = self.progress.attempts(),
            "Backend reachable, session routed"
        );
        Step::Finish(PollState::Succeeded)
    }

    async fn wait(&mut self, reason: WakeError) -> Step {
        if self.is_cancelled() {
            return Step::Finish(PollState::Cancelled);
        }

        let attempts = self.progress.record_attempt();
        debug!(
            session = %self.session,
            backend = %self.backend.name,
            attempts,
            %reason,
            "Backend not reachable yet"
        );

        if let Some(max) = self.timings.max_poll_attempts {
            if attempts >= max {
                if !self.ctx.registry.complete(self.session, self.generation) {
                    return Step::Finish(PollState::Cancelled);
                }
                warn!(
                    session = %self.session,
                    backend = %self.backend.name,
                    attempts,
                    "Backend did not become reachable, giving up"
                );
                self.progress.set_state(PollState::Expired);
                self.ctx
                    .substrate
                    .wait_expired(self.session, &self.backend.name)
                    .await;
                return Step::Finish(PollState::Expired);
            }
        }

        self.progress.set_state(PollState::Waiting);
        self.ctx
            .substrate
            .show_waiting(self.session, &self.backend.name, self.timings.poll_interval)
            .await;
        Step::Retry
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::probe::HealthProbe;
    use crate::session::RoutingSubstrate;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use tokio::time::Instant;

    /// Answers with a scripted sequence, then keeps repeating the last answer
    struct ScriptedProbe {
        answers: Mutex<VecDeque<bool>>,
        calls: AtomicU32,
    }

    impl ScriptedProbe {
        fn new(answers: &[bool]) -> Arc<Self> {
            Arc::new(Self {
                answers: Mutex::new(answers.iter().copied().collect()),
                calls: AtomicU32::new(0),
            })
        }
    }

    #[async_trait]
    impl HealthProbe for ScriptedProbe {
        async fn check(&self, backend: &Backend, _hint: Option<i32>) -> Result<(), WakeError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let mut answers = self.answers.lock();
            let reachable = if answers.len() > 1 {
                answers.pop_front().unwrap_or(false)
            } else {
                answers.front().copied().unwrap_or(false)
            };
            if reachable {
                Ok(())
            } else {
                Err(WakeError::ProbeTransportError {
                    backend: backend.name.clone(),
                    reason: "connection refused".to_string(),
                })
            }
        }
    }

    #[derive(Default)]
    struct RecordingSubstrate {
        connected: Mutex<bool>,
        finalized: Mutex<Vec<(SessionId, String)>>,
        waiting: Mutex<Vec<(String, Instant)>>,
        expired: Mutex<Vec<String>>,
        throttle: Mutex<Option<Arc<WakeThrottle>>>,
        throttled_at_finalize: Mutex<Vec<bool>>,
    }

    impl RecordingSubstrate {
        fn connected() -> Arc<Self> {
            let substrate = Self::default();
            *substrate.connected.lock() = true;
            Arc::new(substrate)
        }
    }

    #[async_trait]
    impl RoutingSubstrate for RecordingSubstrate {
        fn has_active_clients(&self, _backend: &str) -> bool {
            false
        }

        fn is_connected(&self, _session: SessionId) -> bool {
            *self.connected.lock()
        }

        async fn finalize(&self, session: SessionId, backend: &Backend) {
            if let Some(throttle) = self.throttle.lock().as_ref() {
                self.throttled_at_finalize
                    .lock()
                    .push(throttle.is_live(&backend.name));
            }
            self.finalized.lock().push((session, backend.name.clone()));
        }

        async fn show_waiting(&self, _session: SessionId, backend: &str, _next: Duration) {
            self.waiting.lock().push((backend.to_string(), Instant::now()));
        }

        async fn wait_expired(&self, _session: SessionId, backend: &str) {
            self.expired.lock().push(backend.to_string());
        }
    }

    fn context(probe: Arc<ScriptedProbe>, substrate: Arc<RecordingSubstrate>) -> PollContext {
        PollContext {
            registry: Arc::new(TaskRegistry::new()),
            throttle: Arc::new(WakeThrottle::new(Duration::from_secs(120))),
            probe,
            substrate,
        }
    }

    fn timings(max_poll_attempts: Option<u32>) -> WakeTimings {
        WakeTimings {
            max_poll_attempts,
            ..WakeTimings::default()
        }
    }

    fn lobby() -> Backend {
        Backend::new("lobby-2", "127.0.0.1", 25566)
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_finalizes_once_and_clears_throttle() {
        let probe = ScriptedProbe::new(&[false, true]);
        let substrate = RecordingSubstrate::connected();
        let ctx = context(Arc::clone(&probe), Arc::clone(&substrate));
        ctx.throttle.try_mark("lobby-2");
        let session = SessionId::new_v4();
        let start = Instant::now();

        let state = PollTask::spawn(ctx.clone(), session, lobby(), timings(None))
            .await
            .unwrap();

        assert_eq!(state, PollState::Succeeded);
        assert_eq!(start.elapsed(), Duration::from_secs(11));
        assert_eq!(probe.calls.load(Ordering::SeqCst), 2);
        assert_eq!(*substrate.finalized.lock(), vec![(session, "lobby-2".to_string())]);
        assert_eq!(substrate.waiting.lock().len(), 1);
        assert!(ctx.registry.get(session).is_none());
        assert!(!ctx.throttle.is_live("lobby-2"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_throttle_cleared_before_client_is_routed() {
        let probe = ScriptedProbe::new(&[true]);
        let substrate = RecordingSubstrate::connected();
        let ctx = context(probe, Arc::clone(&substrate));
        *substrate.throttle.lock() = Some(Arc::clone(&ctx.throttle));
        ctx.throttle.try_mark("lobby-2");

        let state = PollTask::spawn(ctx, SessionId::new_v4(), lobby(), timings(None))
            .await
            .unwrap();

        assert_eq!(state, PollState::Succeeded);
        assert_eq!(*substrate.throttled_at_finalize.lock(), vec![false]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unreachable_notifies_once_per_interval() {
        let probe = ScriptedProbe::new(&[false]);
        let substrate = RecordingSubstrate::connected();
        let ctx = context(probe, Arc::clone(&substrate));
        let session = SessionId::new_v4();
        let start = Instant::now();

        let handle = PollTask::spawn(ctx.clone(), session, lobby(), timings(None));
        // Probes at t=1, 11, 21, 31; the next would be at t=41
        tokio::time::sleep(Duration::from_secs(35)).await;
        ctx.registry.cancel(session);

        assert_eq!(handle.await.unwrap(), PollState::Cancelled);
        let waiting = substrate.waiting.lock();
        assert_eq!(waiting.len(), 4);
        let offsets: Vec<u64> = waiting
            .iter()
            .map(|(_, at)| at.duration_since(start).as_secs())
            .collect();
        assert_eq!(offsets, vec![1, 11, 21, 31]);
        assert!(substrate.finalized.lock().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_attempt_ceiling_expires_task() {
        let probe = ScriptedProbe::new(&[false]);
        let substrate = RecordingSubstrate::connected();
        let ctx = context(Arc::clone(&probe), Arc::clone(&substrate));
        let session = SessionId::new_v4();

        let state = PollTask::spawn(ctx.clone(), session, lobby(), timings(Some(3)))
            .await
            .unwrap();

        assert_eq!(state, PollState::Expired);
        assert_eq!(probe.calls.load(Ordering::SeqCst), 3);
        assert_eq!(substrate.waiting.lock().len(), 2);
        assert_eq!(*substrate.expired.lock(), vec!["lobby-2".to_string()]);
        assert!(ctx.registry.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_session_cancels_without_probing() {
        let probe = ScriptedProbe::new(&[true]);
        let substrate = Arc::new(RecordingSubstrate::default());
        let ctx = context(Arc::clone(&probe), Arc::clone(&substrate));
        let session = SessionId::new_v4();

        let state = PollTask::spawn(ctx.clone(), session, lobby(), timings(None))
            .await
            .unwrap();

        assert_eq!(state, PollState::Cancelled);
        assert_eq!(probe.calls.load(Ordering::SeqCst), 0);
        assert!(substrate.finalized.lock().is_empty());
        assert!(ctx.registry.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_superseded_task_cannot_finalize() {
        let probe = ScriptedProbe::new(&[true]);
        let substrate = RecordingSubstrate::connected();
        let ctx = context(probe, Arc::clone(&substrate));
        let session = SessionId::new_v4();

        let mut old = PollTask::register(ctx.clone(), session, lobby(), timings(None));
        let new = PollTask::register(
            ctx.clone(),
            session,
            Backend::new("lobby-3", "127.0.0.1", 25567),
            timings(None),
        );

        // The old task's probe result arrives after it was superseded
        assert!(matches!(old.succeed().await, Step::Finish(PollState::Cancelled)));
        assert_eq!(new.run().await, PollState::Succeeded);
        assert_eq!(*substrate.finalized.lock(), vec![(session, "lobby-3".to_string())]);
    }

    #[test]
    fn test_terminal_states() {
        assert!(PollState::Succeeded.is_terminal());
        assert!(PollState::Cancelled.is_terminal());
        assert!(PollState::Expired.is_terminal());
        assert!(!PollState::Waiting.is_terminal());
        assert!(!PollState::Probing.is_terminal());
    }
}
