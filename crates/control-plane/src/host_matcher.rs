//! Host Matcher (spec.md §4.4) and the `HostStore` collaborator it's built
//! on. The real relational store lives outside this core (spec §1); the
//! `HostStore` trait is the injected seam (§9 "Global mutable state...
//! expose as injected collaborators") and `InMemoryHostStore` is the
//! reference implementation used for tests and for running the core
//! standalone.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fleet_common::{AgentId, HostId};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// Durable logical Host record (spec §3 "Host").
#[derive(Debug, Clone, PartialEq)]
pub struct Host {
    pub host_id: HostId,
    pub ip_address: String,
    pub agent_id: Option<AgentId>,
    pub agent_version: String,
    pub os_type: String,
    pub arch: String,
    pub cpu_cores: u32,
    pub total_memory_bytes: u64,
    pub total_disk_bytes: u64,
    pub agent_status: AgentStatus,
    pub cpu_usage_percent: f64,
    pub memory_usage_percent: f64,
    pub disk_usage_percent: f64,
    pub last_heartbeat: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentStatus {
    NotInstalled,
    Installed,
    Offline,
}

impl Host {
    fn new(host_id: HostId, ip_address: String) -> Self {
        Self {
            host_id,
            ip_address,
            agent_id: None,
            agent_version: String::new(),
            os_type: String::new(),
            arch: String::new(),
            cpu_cores: 0,
            total_memory_bytes: 0,
            total_disk_bytes: 0,
            agent_status: AgentStatus::NotInstalled,
            cpu_usage_percent: 0.0,
            memory_usage_percent: 0.0,
            disk_usage_percent: 0.0,
            last_heartbeat: None,
        }
    }
}

/// Fields pushed into a Host on Agent registration (spec §4.4).
pub struct RegistrationUpdate {
    pub agent_id: AgentId,
    pub agent_version: String,
    pub os_type: String,
    pub arch: String,
    pub cpu_cores: u32,
    pub total_memory_bytes: u64,
    pub total_disk_bytes: u64,
}

/// Fields pushed into a Host on every heartbeat (spec §4.4).
pub struct HeartbeatUpdate {
    pub cpu_usage_percent: f64,
    pub memory_usage_percent: f64,
    pub disk_usage_percent: f64,
    pub last_heartbeat: DateTime<Utc>,
}

#[async_trait]
pub trait HostStore: Send + Sync {
    async fn find_by_ip(&self, ip_address: &str) -> Option<HostId>;
    async fn apply_registration(&self, host_id: &HostId, update: RegistrationUpdate);
    async fn apply_heartbeat(&self, host_id: &HostId, update: HeartbeatUpdate);
    async fn mark_offline(&self, host_id: &HostId);
    async fn get(&self, host_id: &HostId) -> Option<Host>;
}

/// In-memory `HostStore`, keyed by IP address. Sufficient for running the
/// core standalone and for tests; the production deployment's relational
/// store is out of scope (spec §1).
#[derive(Default)]
pub struct InMemoryHostStore {
    by_ip: RwLock<HashMap<String, HostId>>,
    hosts: RwLock<HashMap<HostId, Host>>,
}

impl InMemoryHostStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a Host record ahead of any Agent registering against it, the
    /// way an operator would provision a host before installing an Agent.
    pub fn seed(&self, host_id: HostId, ip_address: impl Into<String>) {
        let ip_address = ip_address.into();
        self.by_ip.write().insert(ip_address.clone(), host_id.clone());
        self.hosts
            .write()
            .insert(host_id.clone(), Host::new(host_id, ip_address));
    }
}

#[async_trait]
impl HostStore for InMemoryHostStore {
    async fn find_by_ip(&self, ip_address: &str) -> Option<HostId> {
        self.by_ip.read().get(ip_address).cloned()
    }

    async fn apply_registration(&self, host_id: &HostId, update: RegistrationUpdate) {
        let mut hosts = self.hosts.write();
        if let Some(host) = hosts.get_mut(host_id) {
            host.agent_id = Some(update.agent_id);
            host.agent_version = update.agent_version;
            host.os_type = update.os_type;
            host.arch = update.arch;
            host.cpu_cores = update.cpu_cores;
            host.total_memory_bytes = update.total_memory_bytes;
            host.total_disk_bytes = update.total_disk_bytes;
            host.agent_status = AgentStatus::Installed;
        }
    }

    async fn apply_heartbeat(&self, host_id: &HostId, update: HeartbeatUpdate) {
        let mut hosts = self.hosts.write();
        if let Some(host) = hosts.get_mut(host_id) {
            host.cpu_usage_percent = update.cpu_usage_percent;
            host.memory_usage_percent = update.memory_usage_percent;
            host.disk_usage_percent = update.disk_usage_percent;
            host.last_heartbeat = Some(update.last_heartbeat);
        }
    }

    async fn mark_offline(&self, host_id: &HostId) {
        let mut hosts = self.hosts.write();
        if let Some(host) = hosts.get_mut(host_id) {
            host.agent_status = AgentStatus::Offline;
        }
    }

    async fn get(&self, host_id: &HostId) -> Option<Host> {
        self.hosts.read().get(host_id).cloned()
    }
}

/// Binds an Agent registration to a logical Host by IP (spec §4.4). A
/// failure to match is non-fatal: registration still succeeds with no
/// `host_id` on the Connection.
pub struct HostMatcher {
    store: Arc<dyn HostStore>,
}

impl HostMatcher {
    pub fn new(store: Arc<dyn HostStore>) -> Self {
        Self { store }
    }

    pub async fn match_registration(
        &self,
        ip_address: &str,
        agent_id: AgentId,
        agent_version: String,
        os_type: String,
        arch: String,
        system_info: Option<&fleet_wire::SystemInfo>,
    ) -> Option<HostId> {
        let host_id = self.store.find_by_ip(ip_address).await?;
        let (cpu_cores, total_memory_bytes, total_disk_bytes) = system_info
            .map(|s| (s.cpu_cores, s.total_memory_bytes, s.total_disk_bytes))
            .unwrap_or_default();
        self.store
            .apply_registration(
                &host_id,
                RegistrationUpdate {
                    agent_id,
                    agent_version,
                    os_type,
                    arch,
                    cpu_cores,
                    total_memory_bytes,
                    total_disk_bytes,
                },
            )
            .await;
        debug!(%host_id, ip = %ip_address, "matched agent registration to host");
        Some(host_id)
    }

    pub async fn record_heartbeat(
        &self,
        host_id: &HostId,
        cpu_usage_percent: f64,
        memory_usage_percent: f64,
        disk_usage_percent: f64,
    ) {
        self.store
            .apply_heartbeat(
                host_id,
                HeartbeatUpdate {
                    cpu_usage_percent,
                    memory_usage_percent,
                    disk_usage_percent,
                    last_heartbeat: Utc::now(),
                },
            )
            .await;
    }

    pub async fn mark_offline(&self, host_id: &HostId) {
        self.store.mark_offline(host_id).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn matches_by_ip_and_updates_fields() {
        let store = Arc::new(InMemoryHostStore::new());
        store.seed(HostId::new("host-1"), "10.0.0.5");
        let matcher = HostMatcher::new(store.clone());

        let host_id = matcher
            .match_registration(
                "10.0.0.5",
                AgentId::new("agent-ab12cd34"),
                "1.0.0".to_string(),
                "linux".to_string(),
                "x86_64".to_string(),
                None,
            )
            .await
            .expect("ip match");

        let host = store.get(&host_id).await.unwrap();
        assert_eq!(host.agent_id, Some(AgentId::new("agent-ab12cd34")));
        assert_eq!(host.agent_status, AgentStatus::Installed);
    }

    #[tokio::test]
    async fn unmatched_ip_is_non_fatal() {
        let store = Arc::new(InMemoryHostStore::new());
        let matcher = HostMatcher::new(store);
        let result = matcher
            .match_registration(
                "192.168.1.1",
                AgentId::new("agent-x"),
                "1.0.0".to_string(),
                "linux".to_string(),
                "x86_64".to_string(),
                None,
            )
            .await;
        assert!(result.is_none());
    }
}
