//! Shared dispatch state for the proxy listeners
//!
//! Each inbound connection moves through
//! `accepted -> key_extracted -> resolved -> forwarding -> closed`, and can be
//! rejected from any non-terminal stage. The listeners log the stage on every
//! transition; this module holds the vocabulary, the counters, the dependency
//! bundle handed to connection tasks and the tracker used to drain them.

use crate::config::Timeouts;
use crate::pool::ConnectionPool;
use crate::records::RecordStore;
use parking_lot::Mutex;
use serde::Serialize;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Accepted,
    KeyExtracted,
    Resolved,
    Forwarding,
    Closed,
    Rejected,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Accepted => "accepted",
            Stage::KeyExtracted => "key_extracted",
            Stage::Resolved => "resolved",
            Stage::Forwarding => "forwarding",
            Stage::Closed => "closed",
            Stage::Rejected => "rejected",
        }
    }
}

/// Dispatch counters, shared by both proxy listeners
#[derive(Debug, Default)]
pub struct DispatchStats {
    accepted: AtomicU64,
    rejected: AtomicU64,
    forwarded: AtomicU64,
    upstream_failures: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub accepted: u64,
    pub rejected: u64,
    pub forwarded: u64,
    pub upstream_failures: u64,
}

impl DispatchStats {
    pub fn record_accepted(&self) {
        self.accepted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_rejected(&self) {
        self.rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_forwarded(&self) {
        self.forwarded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_upstream_failure(&self) {
        self.upstream_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            accepted: self.accepted.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            forwarded: self.forwarded.load(Ordering::Relaxed),
            upstream_failures: self.upstream_failures.load(Ordering::Relaxed),
        }
    }
}

/// Owns every live connection task so shutdown can wait for them
#[derive(Debug, Default)]
pub struct ConnectionTracker {
    tasks: Mutex<JoinSet<()>>,
    /// Set once a drain has finished; later tasks are never started
    closed: AtomicBool,
}

impl ConnectionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Spawn a connection task
    pub fn spawn<F>(&self, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let mut tasks = self.tasks.lock();
        if self.closed.load(Ordering::Acquire) {
            debug!("Connection task refused after drain");
            return;
        }
        // Reap finished connections so the set stays small
        while tasks.try_join_next().is_some() {}
        tasks.spawn(task);
    }

    /// Number of tasks not yet reaped
    pub fn active(&self) -> usize {
        let mut tasks = self.tasks.lock();
        while tasks.try_join_next().is_some() {}
        tasks.len()
    }

    /// Wait up to `grace` for tracked tasks, then abort the rest.
    ///
    /// Tasks spawned while draining (upgrades of in-flight requests) are
    /// waited for under the same deadline. Once this returns the tracker
    /// accepts no new tasks. Returns the number of tasks that had to be aborted.
    pub async fn drain(&self, grace: Duration) -> usize {
        let deadline = tokio::time::Instant::now() + grace;
        let mut announced = false;

        loop {
            let mut tasks = {
                let mut guard = self.tasks.lock();
                if guard.is_empty() {
                    self.closed.store(true, Ordering::Release);
                    return 0;
                }
                std::mem::take(&mut *guard)
            };

            if !announced {
                info!(connections = tasks.len(), grace_secs = grace.as_secs(), "Draining connections");
                announced = true;
            }

            let finished = tokio::time::timeout_at(deadline, async {
                while tasks.join_next().await.is_some() {}
            })
            .await;
            if finished.is_ok() {
                continue;
            }

            let mut late = {
                let mut guard = self.tasks.lock();
                self.closed.store(true, Ordering::Release);
                std::mem::take(&mut *guard)
            };
            let remaining = tasks.len() + late.len();
            warn!(connections = remaining, "Grace period elapsed, closing remaining connections");
            tasks.shutdown().await;
            late.shutdown().await;
            return remaining;
        }
    }
}

/// Resolves once shutdown has been signalled. Pends forever if the sender is gone.
pub async fn shutdown_signalled(rx: &mut watch::Receiver<bool>) {
    loop {
        if *rx.borrow_and_update() {
            return;
        }
        if rx.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

/// Dependencies handed to every proxy connection task
#[derive(Clone)]
pub struct DispatchContext {
    pub records: RecordStore,
    pub pool: Arc<ConnectionPool>,
    pub stats: Arc<DispatchStats>,
    pub tracker: Arc<ConnectionTracker>,
    pub timeouts: Timeouts,
    pub shutdown: watch::Receiver<bool>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_names() {
        assert_eq!(Stage::Accepted.as_str(), "accepted");
        assert_eq!(Stage::KeyExtracted.as_str(), "key_extracted");
        assert_eq!(Stage::Rejected.as_str(), "rejected");
    }

    #[test]
    fn test_stats_snapshot() {
        let stats = DispatchStats::default();
        stats.record_accepted();
        stats.record_accepted();
        stats.record_rejected();
        stats.record_forwarded();
        stats.record_upstream_failure();

        assert_eq!(
            stats.snapshot(),
            StatsSnapshot {
                accepted: 2,
                rejected: 1,
                forwarded: 1,
                upstream_failures: 1,
            }
        );
    }

    #[tokio::test]
    async fn test_shutdown_signalled() {
        let (tx, mut rx) = watch::channel(false);
        let waiter = tokio::spawn(async move { shutdown_signalled(&mut rx).await });

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!waiter.is_finished());

        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_drain_waits_for_short_tasks() {
        let tracker = ConnectionTracker::new();
        let (tx, rx) = tokio::sync::oneshot::channel();
        tracker.spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            let _ = tx.send(());
        });

        let aborted = tracker.drain(Duration::from_secs(5)).await;
        assert_eq!(aborted, 0);
        assert!(rx.await.is_ok());
    }

    #[tokio::test]
    async fn test_drain_aborts_after_grace() {
        let tracker = ConnectionTracker::new();
        tracker.spawn(async {
            tokio::time::sleep(Duration::from_secs(3600)).await;
        });
        tracker.spawn(async {});

        let aborted = tracker.drain(Duration::from_millis(50)).await;
        assert_eq!(aborted, 1);
        assert_eq!(tracker.active(), 0);
    }

    #[tokio::test]
    async fn test_drain_covers_tasks_spawned_while_draining() {
        let tracker = Arc::new(ConnectionTracker::new());
        let inner = Arc::clone(&tracker);
        tracker.spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            inner.spawn(async {
                tokio::time::sleep(Duration::from_secs(3600)).await;
            });
        });

        let aborted = tracker.drain(Duration::from_millis(200)).await;
        assert_eq!(aborted, 1);
        assert_eq!(tracker.active(), 0);
    }

    #[tokio::test]
    async fn test_no_tasks_start_after_drain() {
        let tracker = ConnectionTracker::new();
        assert_eq!(tracker.drain(Duration::from_millis(10)).await, 0);

        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        tracker.spawn(async move {
            let _ = tx.send(());
        });
        assert!(rx.await.is_err());
        assert_eq!(tracker.active(), 0);
    }
}
