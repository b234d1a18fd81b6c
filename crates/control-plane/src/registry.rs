//! Agent Registry (spec.md §4.2): the only process-wide mutable structure
//! in the control plane core (§5, §9 "Global mutable state").

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use fleet_common::{AgentId, CommandId, HostId};
use fleet_wire::{RegisterRequest, SystemInfo};
use parking_lot::RwLock;
use tokio::sync::mpsc;
use tonic::Status;
use tracing::{debug, info, warn};

use crate::errors::ControlPlaneError;
use crate::metrics::OrchestrationMetrics;
use crate::waiter::{CommandOutcome, Waiter};

/// Lifecycle state of an `AgentConnection` (spec §3, verbatim).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Registering,
    Connected,
    Streaming,
    Draining,
    Disconnected,
}

pub type OutboundSender = mpsc::Sender<Result<fleet_wire::pb::CommandRequest, Status>>;

/// One record for a currently (or recently) connected Agent.
pub struct AgentConnection {
    pub agent_id: AgentId,
    pub hostname: String,
    pub ip_address: String,
    pub os_type: String,
    pub arch: String,
    pub agent_version: String,
    pub system_info: Option<SystemInfo>,
    pub registered_at: DateTime<Utc>,

    host_id: RwLock<Option<HostId>>,
    state: RwLock<ConnectionState>,
    last_heartbeat_at: RwLock<DateTime<Utc>>,
    outbound: RwLock<Option<OutboundSender>>,

    /// Commands dispatched to this Agent that have not yet reached a
    /// terminal status (spec §3 "in_flight").
    pub in_flight: DashMap<CommandId, Arc<Waiter>>,
}

impl AgentConnection {
    fn new(agent_id: AgentId, req: &RegisterRequest) -> Self {
        let now = Utc::now();
        Self {
            agent_id,
            hostname: req.hostname.clone(),
            ip_address: req.ip_address.clone(),
            os_type: req.os_type.clone(),
            arch: req.arch.clone(),
            agent_version: req.agent_version.clone(),
            system_info: req.system_info.clone(),
            registered_at: now,
            host_id: RwLock::new(None),
            state: RwLock::new(ConnectionState::Registering),
            last_heartbeat_at: RwLock::new(now),
            outbound: RwLock::new(None),
            in_flight: DashMap::new(),
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.read()
    }

    pub fn set_state(&self, state: ConnectionState) {
        *self.state.write() = state;
    }

    pub fn host_id(&self) -> Option<HostId> {
        self.host_id.read().clone()
    }

    pub fn set_host_id(&self, host_id: HostId) {
        *self.host_id.write() = Some(host_id);
    }

    pub fn last_heartbeat_at(&self) -> DateTime<Utc> {
        *self.last_heartbeat_at.read()
    }

    pub fn touch_heartbeat(&self) {
        *self.last_heartbeat_at.write() = Utc::now();
    }

    /// spec §4.3: online iff a heartbeat arrived after `process_start` and
    /// within `heartbeat_timeout` of `now`.
    pub fn is_online(&self, process_start: DateTime<Utc>, heartbeat_timeout: Duration) -> bool {
        let last = self.last_heartbeat_at();
        if last <= process_start {
            return false;
        }
        let age = Utc::now().signed_duration_since(last);
        match age.to_std() {
            Ok(age) => age < heartbeat_timeout,
            Err(_) => true, // negative duration: heartbeat in the "future" (clock skew) counts as fresh
        }
    }

    pub fn attach_stream(&self, sender: OutboundSender) {
        *self.outbound.write() = Some(sender);
        self.set_state(ConnectionState::Streaming);
    }

    pub fn outbound(&self) -> Option<OutboundSender> {
        self.outbound.read().clone()
    }

    /// Fail every in-flight waiter on this connection with `outcome`, and
    /// drop them from the map. Used on supersession and disconnect. Returns
    /// the number of waiters cleared, so the caller can keep the
    /// `in_flight_commands` gauge honest.
    fn fail_all_in_flight(&self, status: fleet_wire::CommandStatus, error: String) -> usize {
        let mut cleared = 0usize;
        for entry in self.in_flight.iter() {
            entry.value().resolve(CommandOutcome {
                status,
                output: entry.value().accumulated_output(),
                error: Some(error.clone()),
            });
            cleared += 1;
        }
        self.in_flight.clear();
        cleared
    }
}

/// Mint a stable-looking agent id the way the spec's worked examples read:
/// `agent-` followed by 8 lowercase hex digits.
fn mint_agent_id(hostname: &str, ip: &str) -> AgentId {
    let mut hasher = DefaultHasher::new();
    hostname.hash(&mut hasher);
    ip.hash(&mut hasher);
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    nanos.hash(&mut hasher);
    let digest = hasher.finish() as u32;
    AgentId::new(format!("agent-{digest:08x}"))
}

/// Guards membership of currently-known Agent connections.
#[derive(Default)]
pub struct AgentRegistry {
    connections: DashMap<AgentId, Arc<AgentConnection>>,
    metrics: RwLock<Option<Arc<OrchestrationMetrics>>>,
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach the control plane's metrics surface so registrations and
    /// disconnects keep the `connected_agents` gauge current.
    pub fn with_metrics(self, metrics: Arc<OrchestrationMetrics>) -> Self {
        *self.metrics.write() = Some(metrics);
        self
    }

    fn report_connected_count(&self) {
        if let Some(metrics) = self.metrics.read().as_ref() {
            metrics.connected_agents.set(self.connections.len() as i64);
        }
    }

    /// Keep `in_flight_commands` honest when a batch of waiters is failed
    /// out from under the Dispatcher/Correlator (supersession, disconnect):
    /// those two only ever decrement the commands they resolve themselves,
    /// so a registry-driven clear must account for the rest.
    fn report_in_flight_cleared(&self, cleared: usize) {
        if cleared == 0 {
            return;
        }
        if let Some(metrics) = self.metrics.read().as_ref() {
            metrics.in_flight_commands.sub(cleared as i64);
        }
    }

    /// spec §4.2 `register`: mint an id if absent, install or supersede the
    /// existing record, and return the new connection.
    pub fn register(&self, mut req: RegisterRequest) -> Arc<AgentConnection> {
        if req.agent_id.trim().is_empty() {
            req.agent_id = mint_agent_id(&req.hostname, &req.ip_address).into_string();
        }
        let agent_id = AgentId::new(req.agent_id.clone());

        if let Some((_, previous)) = self.connections.remove(&agent_id) {
            warn!(%agent_id, "registration supersedes existing connection");
            previous.set_state(ConnectionState::Disconnected);
            let cleared = previous.fail_all_in_flight(
                fleet_wire::CommandStatus::Failed,
                "agent connection superseded by a newer registration".to_string(),
            );
            self.report_in_flight_cleared(cleared);
        }

        let conn = Arc::new(AgentConnection::new(agent_id.clone(), &req));
        conn.set_state(ConnectionState::Connected);
        self.connections.insert(agent_id.clone(), conn.clone());
        self.report_connected_count();
        info!(%agent_id, hostname = %conn.hostname, ip = %conn.ip_address, "agent registered");
        conn
    }

    pub fn get(&self, agent_id: &AgentId) -> Option<Arc<AgentConnection>> {
        self.connections.get(agent_id).map(|e| e.value().clone())
    }

    /// spec §4.2 `set_stream`: attach outbound handles once `CommandStream`
    /// identifies itself. Fails if there was no prior registration.
    pub fn set_stream(
        &self,
        agent_id: &AgentId,
        sender: OutboundSender,
    ) -> Result<Arc<AgentConnection>, ControlPlaneError> {
        let conn = self
            .get(agent_id)
            .ok_or_else(|| ControlPlaneError::AgentNotFound(agent_id.clone()))?;
        conn.attach_stream(sender);
        Ok(conn)
    }

    /// spec §4.2 `handle_disconnect`: remove the connection, fail its
    /// waiters, and hand the removed record back so a caller can mark the
    /// bound Host offline. Returns `None` if already gone.
    pub fn handle_disconnect(&self, agent_id: &AgentId) -> Option<Arc<AgentConnection>> {
        let (_, conn) = self.connections.remove(agent_id)?;
        conn.set_state(ConnectionState::Disconnected);
        let cleared = conn.fail_all_in_flight(
            fleet_wire::CommandStatus::Failed,
            "agent stream disconnected".to_string(),
        );
        self.report_in_flight_cleared(cleared);
        self.report_connected_count();
        debug!(%agent_id, "agent connection removed from registry");
        Some(conn)
    }

    pub fn list(&self) -> Vec<Arc<AgentConnection>> {
        self.connections.iter().map(|e| e.value().clone()).collect()
    }
}
