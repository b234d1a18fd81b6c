//! Heartbeat Tracker (spec.md §4.3).

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use fleet_common::HostId;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, info};

use crate::host_matcher::HostMatcher;
use crate::registry::AgentRegistry;

/// Wall-clock instant the control plane began accepting connections (spec
/// GLOSSARY "Process-start epoch"). Gates `online` derivation so stale
/// records don't read as healthy immediately after a restart.
#[derive(Debug, Clone, Copy)]
pub struct ProcessStartEpoch(pub DateTime<Utc>);

impl ProcessStartEpoch {
    pub fn now() -> Self {
        Self(Utc::now())
    }
}

/// Periodic sweeper: every `heartbeat_timeout / 2`, walk the Registry and
/// hand any stale connection to `handle_disconnect` (spec §4.3).
pub struct HeartbeatTracker {
    registry: Arc<AgentRegistry>,
    host_matcher: Arc<HostMatcher>,
    process_start: ProcessStartEpoch,
    heartbeat_timeout: Duration,
}

impl HeartbeatTracker {
    pub fn new(
        registry: Arc<AgentRegistry>,
        host_matcher: Arc<HostMatcher>,
        process_start: ProcessStartEpoch,
        heartbeat_timeout: Duration,
    ) -> Self {
        Self {
            registry,
            host_matcher,
            process_start,
            heartbeat_timeout,
        }
    }

    /// spec §5 "Host online gate": online iff a heartbeat arrived after
    /// `process_start` and within `heartbeat_timeout` of now.
    pub fn is_online(&self, last_heartbeat_at: DateTime<Utc>) -> bool {
        if last_heartbeat_at <= self.process_start.0 {
            return false;
        }
        match Utc::now().signed_duration_since(last_heartbeat_at).to_std() {
            Ok(age) => age < self.heartbeat_timeout,
            Err(_) => true,
        }
    }

    /// Spawn the sweeper task. Returns a handle that stops it when the
    /// returned `StopHandle` (or its clone) is dropped/`stop`-ed.
    pub fn spawn_sweeper(self: Arc<Self>) -> SweeperHandle {
        let stop = Arc::new(AtomicBool::new(false));
        let stop_clone = stop.clone();
        let period = self.heartbeat_timeout / 2;
        let tracker = self;

        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(period.max(Duration::from_millis(1)));
            loop {
                interval.tick().await;
                if stop_clone.load(Ordering::Relaxed) {
                    break;
                }
                tracker.sweep_once().await;
            }
        });

        SweeperHandle { stop, handle }
    }

    async fn sweep_once(&self) {
        for conn in self.registry.list() {
            if conn.is_online(self.process_start.0, self.heartbeat_timeout) {
                continue;
            }
            info!(agent_id = %conn.agent_id, "heartbeat timeout, disconnecting agent");
            if let Some(removed) = self.registry.handle_disconnect(&conn.agent_id) {
                if let Some(host_id) = removed.host_id() {
                    self.mark_host_offline(&host_id).await;
                }
            }
        }
    }

    async fn mark_host_offline(&self, host_id: &HostId) {
        debug!(%host_id, "marking host offline after heartbeat timeout");
        self.host_matcher.mark_offline(host_id).await;
    }
}

pub struct SweeperHandle {
    stop: Arc<AtomicBool>,
    handle: tokio::task::JoinHandle<()>,
}

impl SweeperHandle {
    pub fn stop(self) {
        self.stop.store(true, Ordering::Relaxed);
        self.handle.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host_matcher::InMemoryHostStore;
    use chrono::Duration as ChronoDuration;

    #[test]
    fn scenario_s6_restart_then_heartbeat() {
        let process_start = ProcessStartEpoch(Utc::now());
        let heartbeat_timeout = Duration::from_secs(30);
        let registry = Arc::new(AgentRegistry::new());
        let host_matcher = Arc::new(HostMatcher::new(Arc::new(InMemoryHostStore::new())));
        let tracker = HeartbeatTracker::new(registry, host_matcher, process_start, heartbeat_timeout);

        let stale_heartbeat = process_start.0 - ChronoDuration::seconds(10);
        assert!(!tracker.is_online(stale_heartbeat));

        let fresh_heartbeat = process_start.0 + ChronoDuration::seconds(6);
        assert!(tracker.is_online(fresh_heartbeat));
    }
}
