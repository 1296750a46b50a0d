//! Registry of live poll tasks, at most one per client session

use crate::poll::{PollProgress, PollState};
use crate::session::SessionId;
use dashmap::DashMap;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::debug;

/// Registry-side handle of a running poll task
pub struct TaskEntry {
    /// Unique per task instance; stale results carry an old generation
    pub generation: u64,
    /// Name of the backend the session is waiting for
    pub backend: String,
    started_at: Instant,
    progress: Arc<PollProgress>,
    cancel_tx: watch::Sender<bool>,
}

impl TaskEntry {
    pub fn new(
        generation: u64,
        backend: &str,
        progress: Arc<PollProgress>,
        cancel_tx: watch::Sender<bool>,
    ) -> Self {
        Self {
            generation,
            backend: backend.to_string(),
            started_at: Instant::now(),
            progress,
            cancel_tx,
        }
    }

    /// Suppress the task's next tick. A probe already in flight completes
    /// and its result is discarded.
    fn cancel(&self) {
        self.cancel_tx.send_replace(true);
    }

    fn info(&self, session: SessionId) -> TaskInfo {
        TaskInfo {
            session,
            backend: self.backend.clone(),
            generation: self.generation,
            state: self.progress.state(),
            attempts: self.progress.attempts(),
            age_secs: self.started_at.elapsed().as_secs(),
        }
    }
}

/// Diagnostic snapshot of a live poll task
#[derive(Debug, Clone, Serialize)]
pub struct TaskInfo {
    pub session: SessionId,
    pub backend: String,
    pub generation: u64,
    pub state: PollState,
    pub attempts: u32,
    pub age_secs: u64,
}

/// Session id to live poll task.
///
/// Every operation is atomic per session, so client events and the tasks'
/// own timers may race freely.
#[derive(Default)]
pub struct TaskRegistry {
    tasks: DashMap<SessionId, TaskEntry>,
    generations: AtomicU64,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate a generation tag for a new task instance
    pub fn next_generation(&self) -> u64 {
        self.generations.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Install `entry` for `session`, cancelling any task it supersedes.
    ///
    /// Returns the generation of the superseded task, if there was one.
    pub fn set(&self, session: SessionId, entry: TaskEntry) -> Option<u64> {
        let previous = self.tasks.insert(session, entry)?;
        previous.cancel();
        debug!(
            %session,
            backend = %previous.backend,
            generation = previous.generation,
            "Superseded poll task"
        );
        Some(previous.generation)
    }

    /// Stop and remove the task for `session`. A no-op if there is none.
    pub fn cancel(&self, session: SessionId) -> bool {
        match self.tasks.remove(&session) {
            Some((_, entry)) => {
                entry.cancel();
                debug!(%session, backend = %entry.backend, "Cancelled poll task");
                true
            }
            None => false,
        }
    }

    /// Remove the entry for `session` only if it is still `generation`.
    ///
    /// This is how a task claims its own terminal transition: whoever removes
    /// the entry owns the outcome, so a superseded task can never finalize.
    pub fn complete(&self, session: SessionId, generation: u64) -> bool {
        self.tasks
            .remove_if(&session, |_, entry| entry.generation == generation)
            .is_some()
    }

    /// Whether `generation` is the live task for `session`
    pub fn is_current(&self, session: SessionId, generation: u64) -> bool {
        self.tasks
            .get(&session)
            .map(|entry| entry.generation == generation)
            .unwrap_or(false)
    }

    pub fn get(&self, session: SessionId) -> Option<TaskInfo> {
        self.tasks.get(&session).map(|entry| entry.info(session))
    }

    /// All live tasks, oldest session id first
    pub fn list(&self) -> Vec<TaskInfo> {
        let mut tasks: Vec<TaskInfo> = self
            .tasks
            .iter()
            .map(|entry| entry.value().info(*entry.key()))
            .collect();
        tasks.sort_by_key(|task| task.session);
        tasks
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Cancel every task, returning how many were live
    pub fn cancel_all(&self) -> usize {
        let sessions: Vec<SessionId> = self.tasks.iter().map(|entry| *entry.key()).collect();
        sessions
            .into_iter()
            .filter(|session| self.cancel(*session))
            .count()
    }
}
