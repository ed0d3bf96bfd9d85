//! OSD availability tracking with exponential back-off.
//!
//! Every OSD talks to many remote OSDs. When a remote node fails to answer,
//! it is put on back-off for a while so that callers can skip it when picking
//! where to read from. The tracker is purely advisory: it never blocks an
//! operation, callers decide whether to consult it.
//!
//! # How It Works
//!
//! - A node is available unless the current time lies within
//!   `[last_failed_access, last_failed_access + current_timeout)`.
//! - The first failure backs a node off for `initial_timeout`; every further
//!   failure doubles the timeout. The timeout never shrinks.
//! - Entries are created lazily on first query or failure. The
//!   [`AvailabilityReaper`] evicts entries not queried for `max_last_access`.
//!
//! The tracker is shared by many connection handlers, so it is backed by a
//! [`DashMap`] and every entry update happens under that entry's shard lock.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::types::NodeId;

/// Default back-off after the first failure: 60 seconds.
pub const DEFAULT_INITIAL_TIMEOUT_MS: u64 = 60_000;
/// Default reaper wake-up interval: 1 hour.
pub const DEFAULT_CLEANUP_INTERVAL_MS: u64 = 3_600_000;
/// Default idle age after which an entry is evicted: 1 day.
pub const DEFAULT_MAX_LAST_ACCESS_MS: u64 = 86_400_000;

/// Configuration for [`ServiceAvailability`] and its reaper.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AvailabilityConfig {
    /// Back-off applied after the first failure, in milliseconds.
    pub initial_timeout_ms: u64,
    /// How often the reaper sweeps idle entries, in milliseconds.
    pub cleanup_interval_ms: u64,
    /// Entries not queried for this long are evicted, in milliseconds.
    pub max_last_access_ms: u64,
}

impl Default for AvailabilityConfig {
    fn default() -> Self {
        Self {
            initial_timeout_ms: DEFAULT_INITIAL_TIMEOUT_MS,
            cleanup_interval_ms: DEFAULT_CLEANUP_INTERVAL_MS,
            max_last_access_ms: DEFAULT_MAX_LAST_ACCESS_MS,
        }
    }
}

impl AvailabilityConfig {
    fn initial_timeout(&self) -> Duration {
        Duration::from_millis(self.initial_timeout_ms)
    }

    fn cleanup_interval(&self) -> Duration {
        Duration::from_millis(self.cleanup_interval_ms)
    }

    fn max_last_access(&self) -> Duration {
        Duration::from_millis(self.max_last_access_ms)
    }
}

#[derive(Debug, Clone, Copy)]
struct ServiceEntry {
    last_access: Instant,
    last_failed_access: Option<Instant>,
    current_timeout: Duration,
}

impl ServiceEntry {
    fn new(now: Instant, initial_timeout: Duration) -> Self {
        Self {
            last_access: now,
            last_failed_access: None,
            current_timeout: initial_timeout,
        }
    }

    fn is_backed_off(&self, now: Instant) -> bool {
        match self.last_failed_access {
            Some(failed_at) => now.saturating_duration_since(failed_at) < self.current_timeout,
            None => false,
        }
    }
}

/// Thread-safe tracker of which remote OSDs are currently backed off.
#[derive(Debug)]
pub struct ServiceAvailability {
    config: AvailabilityConfig,
    entries: DashMap<NodeId, ServiceEntry>,
}

impl ServiceAvailability {
    /// Create an empty tracker.
    pub fn new(config: AvailabilityConfig) -> Self {
        Self {
            config,
            entries: DashMap::new(),
        }
    }

    /// Configuration in use.
    pub fn config(&self) -> &AvailabilityConfig {
        &self.config
    }

    /// Whether `node` may be contacted now. Refreshes the node's access time.
    pub fn is_available(&self, node: &NodeId) -> bool {
        let now = Instant::now();
        let mut entry = self
            .entries
            .entry(node.clone())
            .or_insert_with(|| ServiceEntry::new(now, self.config.initial_timeout()));
        entry.last_access = now;
        !entry.is_backed_off(now)
    }

    /// Record a failed access to `node` and extend its back-off.
    pub fn mark_unavailable(&self, node: &NodeId) {
        let now = Instant::now();
        let mut entry = self
            .entries
            .entry(node.clone())
            .or_insert_with(|| ServiceEntry::new(now, self.config.initial_timeout()));
        if entry.last_failed_access.is_some() {
            entry.current_timeout = entry.current_timeout.saturating_mul(2);
        }
        entry.last_failed_access = Some(now);
        entry.last_access = now;
        debug!(
            node = %node,
            timeout_ms = entry.current_timeout.as_millis() as u64,
            "OSD marked unavailable"
        );
    }

    /// Current back-off timeout of `node`, if it is tracked.
    pub fn current_timeout(&self, node: &NodeId) -> Option<Duration> {
        self.entries.get(node).map(|entry| entry.current_timeout)
    }

    /// Evict entries not accessed for `max_last_access`. Returns the number evicted.
    pub fn sweep(&self) -> usize {
        let now = Instant::now();
        let max_age = self.config.max_last_access();
        let before = self.entries.len();
        self.entries
            .retain(|_, entry| now.saturating_duration_since(entry.last_access) < max_age);
        before.saturating_sub(self.entries.len())
    }

    /// Number of tracked nodes.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no node is tracked.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for ServiceAvailability {
    fn default() -> Self {
        Self::new(AvailabilityConfig::default())
    }
}

/// Background task that periodically evicts idle entries from a tracker.
///
/// The task stops when [`AvailabilityReaper::shutdown`] is called or the
/// reaper is dropped.
pub struct AvailabilityReaper {
    shutdown_tx: watch::Sender<bool>,
    handle: Option<JoinHandle<()>>,
}

impl AvailabilityReaper {
    /// Spawn the reaper for `tracker` on the current tokio runtime.
    pub fn spawn(tracker: Arc<ServiceAvailability>) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(Self::run(tracker, shutdown_rx));
        Self {
            shutdown_tx,
            handle: Some(handle),
        }
    }

    async fn run(tracker: Arc<ServiceAvailability>, mut shutdown_rx: watch::Receiver<bool>) {
        let interval = tracker.config().cleanup_interval();
        info!(interval_ms = interval.as_millis() as u64, "OSD availability reaper started");
        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {
                    let evicted = tracker.sweep();
                    if evicted > 0 {
                        debug!(evicted, remaining = tracker.len(), "evicted idle OSD availability entries");
                    }
                }
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        break;
                    }
                }
            }
        }
        info!("OSD availability reaper stopped");
    }

    /// Whether the reaper task is still running.
    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Stop the reaper and wait for the task to exit.
    ///
    /// Returns `false` if the task panicked or was aborted.
    pub async fn shutdown(mut self) -> bool {
        let _ = self.shutdown_tx.send(true);
        let Some(handle) = self.handle.take() else {
            return true;
        };
        match handle.await {
            Ok(()) => true,
            Err(e) => {
                warn!(error = %e, "OSD availability reaper task failed");
                false
            }
        }
    }
}

impl Drop for AvailabilityReaper {
    fn drop(&mut self) {
        let _ = self.shutdown_tx.send(true);
    }
}
