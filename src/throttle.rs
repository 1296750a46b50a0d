//! Per-backend deduplication of wake signals
//!
//! A wake record lives for one cooldown window. While it is live, further
//! wake attempts for the same backend are no-ops; once it expires (or is
//! cleared) the next attempt establishes a fresh record.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::RwLock;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

/// Cap for cooldowns too large to represent as an instant
const FAR_FUTURE: Duration = Duration::from_secs(86400 * 365 * 30);

/// Identifies the record a successful `try_mark` created
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WakeToken(u64);

/// A wake signal considered in flight for one backend
#[derive(Debug, Clone, Copy)]
pub struct WakeRecord {
    pub issued_at: Instant,
    pub expires_at: Instant,
    token: WakeToken,
}

impl WakeRecord {
    fn new(now: Instant, cooldown: Duration, token: WakeToken) -> Self {
        let expires_at = now
            .checked_add(cooldown)
            .unwrap_or_else(|| now + FAR_FUTURE);
        Self {
            issued_at: now,
            expires_at,
            token,
        }
    }

    fn is_live(&self, now: Instant) -> bool {
        now < self.expires_at
    }
}

/// Snapshot of a live record for diagnostics
#[derive(Debug, Clone, Serialize)]
pub struct WakeRecordInfo {
    pub backend: String,
    pub age_secs: u64,
    pub expires_in_secs: u64,
}

/// Expiring map of backend name to wake record
pub struct WakeThrottle {
    records: DashMap<String, WakeRecord>,
    cooldown: RwLock<Duration>,
    next_token: AtomicU64,
}

impl WakeThrottle {
    pub fn new(cooldown: Duration) -> Self {
        Self {
            records: DashMap::new(),
            cooldown: RwLock::new(cooldown),
            next_token: AtomicU64::new(1),
        }
    }

    pub fn cooldown(&self) -> Duration {
        *self.cooldown.read()
    }

    /// Change the cooldown for records established from now on
    pub fn set_cooldown(&self, cooldown: Duration) {
        *self.cooldown.write() = cooldown;
    }

    /// Establish a wake record for `backend`.
    ///
    /// Returns a token if this call created the record and the caller should
    /// send the wake signal, `None` if a live record already exists. Atomic
    /// per name.
    pub fn try_mark(&self, backend: &str) -> Option<WakeToken> {
        let now = Instant::now();
        let cooldown = self.cooldown();

        match self.records.entry(backend.to_string()) {
            Entry::Occupied(mut entry) => {
                if entry.get().is_live(now) {
                    debug!(backend, "Wake already in flight");
                    None
                } else {
                    let token = self.issue_token();
                    entry.insert(WakeRecord::new(now, cooldown, token));
                    Some(token)
                }
            }
            Entry::Vacant(entry) => {
                let token = self.issue_token();
                entry.insert(WakeRecord::new(now, cooldown, token));
                Some(token)
            }
        }
    }

    fn issue_token(&self) -> WakeToken {
        WakeToken(self.next_token.fetch_add(1, Ordering::Relaxed))
    }

    /// Remove the record for `backend` only if it is the one `token` created.
    /// A record established by a later `try_mark` is left alone.
    pub fn clear_if(&self, backend: &str, token: WakeToken) -> bool {
        self.records
            .remove_if(backend, |_, record| record.token == token)
            .is_some()
    }

    /// Remove the record for `backend` early. Returns true if one was live.
    pub fn clear(&self, backend: &str) -> bool {
        let now = Instant::now();
        self.records
            .remove(backend)
            .map(|(_, record)| record.is_live(now))
            .unwrap_or(false)
    }

    pub fn is_live(&self, backend: &str) -> bool {
        let now = Instant::now();
        self.records
            .get(backend)
            .map(|record| record.is_live(now))
            .unwrap_or(false)
    }

    /// Drop expired records, returning how many were removed
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.records.len();
        self.records.retain(|_, record| record.is_live(now));
        before.saturating_sub(self.records.len())
    }

    /// Live records, sorted by backend name
    pub fn live_records(&self) -> Vec<WakeRecordInfo> {
        let now = Instant::now();
        let mut records: Vec<WakeRecordInfo> = self
            .records
            .iter()
            .filter(|entry| entry.value().is_live(now))
            .map(|entry| WakeRecordInfo {
                backend: entry.key().clone(),
                age_secs: now.duration_since(entry.value().issued_at).as_secs(),
                expires_in_secs: entry.value().expires_at.duration_since(now).as_secs(),
            })
            .collect();
        records.sort_by(|a, b| a.backend.cmp(&b.backend));
        records
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    const COOLDOWN: Duration = Duration::from_secs(120);

    #[tokio::test(start_paused = true)]
    async fn test_mark_is_deduplicated_within_cooldown() {
        let throttle = WakeThrottle::new(COOLDOWN);

        assert!(throttle.try_mark("lobby-2").is_some());
        assert!(throttle.try_mark("lobby-2").is_none());
        assert!(throttle.try_mark("lobby-3").is_some());

        tokio::time::advance(Duration::from_secs(119)).await;
        assert!(throttle.try_mark("lobby-2").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_record_expires_without_clear() {
        let throttle = WakeThrottle::new(COOLDOWN);
        assert!(throttle.try_mark("lobby-2").is_some());

        tokio::time::advance(COOLDOWN).await;

        assert!(!throttle.is_live("lobby-2"));
        assert!(throttle.try_mark("lobby-2").is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_clear_allows_new_mark() {
        let throttle = WakeThrottle::new(COOLDOWN);
        assert!(throttle.try_mark("lobby-2").is_some());

        assert!(throttle.clear("lobby-2"));
        assert!(!throttle.clear("lobby-2"));
        assert!(throttle.try_mark("lobby-2").is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_clear_if_leaves_newer_record() {
        let throttle = WakeThrottle::new(COOLDOWN);
        let stale = throttle.try_mark("lobby-2").unwrap();
        throttle.clear("lobby-2");
        let current = throttle.try_mark("lobby-2").unwrap();
        assert_ne!(stale, current);

        assert!(!throttle.clear_if("lobby-2", stale));
        assert!(throttle.is_live("lobby-2"));

        assert!(throttle.clear_if("lobby-2", current));
        assert!(!throttle.is_live("lobby-2"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_huge_cooldown_does_not_overflow() {
        let throttle = WakeThrottle::new(Duration::from_secs(i64::MAX as u64));

        assert!(throttle.try_mark("lobby-2").is_some());
        assert!(throttle.is_live("lobby-2"));
        assert!(throttle.try_mark("lobby-2").is_none());
        assert_eq!(throttle.live_records().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_purge_expired() {
        let throttle = WakeThrottle::new(COOLDOWN);
        throttle.try_mark("lobby-1");
        tokio::time::advance(Duration::from_secs(60)).await;
        throttle.try_mark("lobby-2");
        tokio::time::advance(Duration::from_secs(60)).await;

        assert_eq!(throttle.purge_expired(), 1);
        let live = throttle.live_records();
        assert_eq!(live.len(), 1);
        assert_eq!(live[0].backend, "lobby-2");
        assert_eq!(live[0].age_secs, 60);
        assert_eq!(live[0].expires_in_secs, 60);
    }

    #[tokio::test(start_paused = true)]
    async fn test_set_cooldown_applies_to_new_records() {
        let throttle = WakeThrottle::new(COOLDOWN);
        throttle.set_cooldown(Duration::from_secs(10));
        throttle.try_mark("lobby-2");

        tokio::time::advance(Duration::from_secs(10)).await;
        assert!(throttle.try_mark("lobby-2").is_some());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_marks_produce_one_winner() {
        let throttle = Arc::new(WakeThrottle::new(COOLDOWN));
        let barrier = Arc::new(tokio::sync::Barrier::new(16));

        let handles: Vec<_> = (0..16)
            .map(|_| {
                let throttle = Arc::clone(&throttle);
                let barrier = Arc::clone(&barrier);
                tokio::spawn(async move {
                    barrier.wait().await;
                    throttle.try_mark("lobby-2").is_some()
                })
            })
            .collect();

        let mut winners = 0;
        for handle in handles {
            if handle.await.unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
    }
}
