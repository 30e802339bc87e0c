//! Per-rule forwarding counters

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::info;

/// Aggregate counters for one forward rule, shared by its listener loop and
/// every relay session it spawned
#[derive(Debug, Default)]
pub struct ForwardStats {
    rule: String,
    accepted: AtomicU64,
    rejected: AtomicU64,
    open_failures: AtomicU64,
    /// Sessions that ended for any reason, open failures included
    completed: AtomicU64,
    active: AtomicUsize,
    bytes_up: AtomicU64,
    bytes_down: AtomicU64,
}

/// Point-in-time copy of [`ForwardStats`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForwardStatsSnapshot {
    pub rule: String,
    pub accepted: u64,
    pub rejected: u64,
    pub open_failures: u64,
    /// Ended sessions, whether they relayed, failed to open or were closed
    /// by shutdown
    pub completed: u64,
    pub active: usize,
    pub bytes_up: u64,
    pub bytes_down: u64,
}

impl ForwardStats {
    pub fn new(rule: impl Into<String>) -> Self {
        Self {
            rule: rule.into(),
            ..Default::default()
        }
    }

    pub fn rule(&self) -> &str {
        &self.rule
    }

    pub fn record_accepted(&self) {
        self.accepted.fetch_add(1, Ordering::Relaxed);
    }

    /// Connection turned away by the admission gate
    pub fn record_rejected(&self) {
        self.rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_open_failure(&self) {
        self.open_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_transfer(&self, bytes_up: u64, bytes_down: u64) {
        self.bytes_up.fetch_add(bytes_up, Ordering::Relaxed);
        self.bytes_down.fetch_add(bytes_down, Ordering::Relaxed);
    }

    /// Count a live session until the returned guard is dropped
    pub fn session_started(self: &Arc<Self>) -> ActiveSession {
        self.active.fetch_add(1, Ordering::Relaxed);
        ActiveSession {
            stats: Arc::clone(self),
        }
    }

    pub fn active(&self) -> usize {
        self.active.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> ForwardStatsSnapshot {
        ForwardStatsSnapshot {
            rule: self.rule.clone(),
            accepted: self.accepted.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            open_failures: self.open_failures.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
            active: self.active(),
            bytes_up: self.bytes_up.load(Ordering::Relaxed),
            bytes_down: self.bytes_down.load(Ordering::Relaxed),
        }
    }

    pub fn log_summary(&self) {
        let s = self.snapshot();
        info!(
            rule = %s.rule,
            accepted = s.accepted,
            rejected = s.rejected,
            open_failures = s.open_failures,
            completed = s.completed,
            active = s.active,
            bytes_up = s.bytes_up,
            bytes_down = s.bytes_down,
            "Forward rule summary"
        );
    }
}

/// Guard held by a running relay session
#[derive(Debug)]
pub struct ActiveSession {
    stats: Arc<ForwardStats>,
}

impl Drop for ActiveSession {
    fn drop(&mut self) {
        self.stats.active.fetch_sub(1, Ordering::Relaxed);
        self.stats.completed.fetch_add(1, Ordering::Relaxed);
    }
}
