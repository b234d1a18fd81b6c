//! Command Dispatcher (spec.md §4.5).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use fleet_common::{AgentId, CommandId};
use fleet_wire::{CommandRequest, CommandStatus};
use tokio::sync::oneshot;
use tokio::time::sleep;
use tracing::{debug, warn};

use crate::audit::{AuditStore, CommandLogEntry, CommandLogUpdate};
use crate::errors::ControlPlaneError;
use crate::metrics::OrchestrationMetrics;
use crate::registry::{AgentRegistry, ConnectionState};
use crate::waiter::{CommandOutcome, Waiter};

/// Grace period given to a downstream cancel before the local waiter is
/// resolved regardless of whether a response arrived (spec §5).
const CANCEL_GRACE: Duration = Duration::from_secs(2);

/// Command-type reserved for cancellation frames (spec §9 Open Question:
/// "existing code uses [a distinct command-type] implicitly").
pub const CANCEL_COMMAND_TYPE: &str = "__cancel__";
pub const CANCEL_TARGET_PARAM: &str = "target_command_id";

/// Handle returned by `dispatch`; await it for the terminal outcome.
pub struct CommandHandle {
    pub command_id: CommandId,
    receiver: oneshot::Receiver<CommandOutcome>,
}

impl CommandHandle {
    pub async fn wait(self) -> Result<CommandOutcome, ControlPlaneError> {
        self.receiver
            .await
            .map_err(|_| ControlPlaneError::Internal("waiter dropped without resolution".into()))
    }
}

pub struct CommandDispatcher<A: AuditStore + 'static> {
    registry: Arc<AgentRegistry>,
    audit: Arc<A>,
    metrics: Option<Arc<OrchestrationMetrics>>,
}

impl<A: AuditStore + 'static> CommandDispatcher<A> {
    pub fn new(registry: Arc<AgentRegistry>, audit: Arc<A>) -> Self {
        Self {
            registry,
            audit,
            metrics: None,
        }
    }

    /// Attach the control plane's metrics surface so successful dispatches
    /// update `commands_dispatched_total` and `in_flight_commands`.
    pub fn with_metrics(mut self, metrics: Arc<OrchestrationMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// spec §4.5 steps 1-5, plus the timeout task from step 6/§5.
    pub async fn dispatch(
        &self,
        agent_id: &AgentId,
        command_type: impl Into<String>,
        parameters: HashMap<String, String>,
        timeout: Duration,
        created_by: impl Into<String>,
    ) -> Result<CommandHandle, ControlPlaneError> {
        let command_type = command_type.into();
        let command_id = CommandId::new();

        let conn = self.registry.get(agent_id);
        let host_id = conn.as_ref().and_then(|c| c.host_id());

        self.audit
            .create_command_log(CommandLogEntry::pending(
                command_id,
                agent_id.clone(),
                host_id,
                command_type.clone(),
                parameters.clone(),
                created_by,
            ))
            .await;

        let conn = match conn {
            Some(conn) if conn.state() == ConnectionState::Streaming => conn,
            _ => {
                self.fail_audit_row(command_id, "agent is not connected").await;
                return Err(ControlPlaneError::AgentUnavailable(agent_id.clone()));
            }
        };

        let sender = match conn.outbound() {
            Some(sender) => sender,
            None => {
                self.fail_audit_row(command_id, "agent has no outbound stream").await;
                return Err(ControlPlaneError::AgentUnavailable(agent_id.clone()));
            }
        };

        let (done_tx, done_rx) = oneshot::channel();
        let waiter = Arc::new(Waiter::new(done_tx));
        conn.in_flight.insert(command_id, waiter.clone());

        let wire_request = CommandRequest {
            command_id: command_id.to_string(),
            command_type,
            parameters,
            timeout_ms: timeout.as_millis() as u64,
        };

        if sender
            .send(Ok(wire_request.into()))
            .await
            .is_err()
        {
            conn.in_flight.remove(&command_id);
            self.fail_audit_row(command_id, "agent outbound stream closed").await;
            return Err(ControlPlaneError::AgentUnavailable(agent_id.clone()));
        }

        let handle = self.spawn_timeout(conn.agent_id.clone(), command_id, waiter.clone(), timeout);
        waiter.set_timeout_handle(handle);

        if let Some(metrics) = &self.metrics {
            metrics.commands_dispatched_total.inc();
            metrics.in_flight_commands.inc();
        }

        Ok(CommandHandle {
            command_id,
            receiver: done_rx,
        })
    }

    fn spawn_timeout(
        &self,
        agent_id: AgentId,
        command_id: CommandId,
        waiter: Arc<Waiter>,
        timeout: Duration,
    ) -> tokio::task::JoinHandle<()> {
        let registry = self.registry.clone();
        let audit = self.audit.clone();
        let metrics = self.metrics.clone();
        tokio::spawn(async move {
            sleep(timeout).await;
            if waiter.is_resolved() {
                return;
            }
            let Some(conn) = registry.get(&agent_id) else {
                return;
            };
            if conn.in_flight.remove(&command_id).is_none() {
                return;
            }
            if let Some(metrics) = &metrics {
                metrics.in_flight_commands.dec();
            }
            warn!(%agent_id, %command_id, "command dispatch timed out");
            waiter.resolve(CommandOutcome {
                status: CommandStatus::Failed,
                output: waiter.accumulated_output(),
                error: Some(format!("command {command_id} timed out after {timeout:?}")),
            });
            audit
                .update_command_log(
                    &command_id,
                    CommandLogUpdate {
                        status: Some(CommandStatus::Failed),
                        error: Some(format!("timed out after {timeout:?}")),
                        finished_at: Some(chrono::Utc::now()),
                        ..Default::default()
                    },
                )
                .await;
        })
    }

    /// spec §4.5 point 6 / §5: send the cancel command-type, then resolve
    /// the local waiter `Cancelled` after a grace period regardless of
    /// whether the Agent replied.
    pub async fn cancel(
        &self,
        agent_id: &AgentId,
        command_id: CommandId,
    ) -> Result<(), ControlPlaneError> {
        let conn = self
            .registry
            .get(agent_id)
            .ok_or_else(|| ControlPlaneError::AgentNotFound(agent_id.clone()))?;

        let Some(sender) = conn.outbound() else {
            return Err(ControlPlaneError::AgentUnavailable(agent_id.clone()));
        };

        let mut params = HashMap::new();
        params.insert(CANCEL_TARGET_PARAM.to_string(), command_id.to_string());
        let cancel_request = CommandRequest {
            command_id: CommandId::new().to_string(),
            command_type: CANCEL_COMMAND_TYPE.to_string(),
            parameters: params,
            timeout_ms: CANCEL_GRACE.as_millis() as u64,
        };
        let _ = sender.send(Ok(cancel_request.into())).await;

        let registry = self.registry.clone();
        let audit = self.audit.clone();
        let metrics = self.metrics.clone();
        let agent_id = agent_id.clone();
        tokio::spawn(async move {
            sleep(CANCEL_GRACE).await;
            let Some(conn) = registry.get(&agent_id) else {
                return;
            };
            let Some((_, waiter)) = conn.in_flight.remove(&command_id) else {
                return;
            };
            if let Some(metrics) = &metrics {
                metrics.in_flight_commands.dec();
            }
            debug!(%agent_id, %command_id, "cancel grace period elapsed, resolving locally");
            waiter.resolve(CommandOutcome {
                status: CommandStatus::Cancelled,
                output: waiter.accumulated_output(),
                error: None,
            });
            audit
                .update_command_log(
                    &command_id,
                    CommandLogUpdate {
                        status: Some(CommandStatus::Cancelled),
                        finished_at: Some(chrono::Utc::now()),
                        ..Default::default()
                    },
                )
                .await;
        });
        Ok(())
    }

    async fn fail_audit_row(&self, command_id: CommandId, error: &str) {
        self.audit
            .update_command_log(
                &command_id,
                CommandLogUpdate {
                    status: Some(CommandStatus::Failed),
                    error: Some(error.to_string()),
                    finished_at: Some(chrono::Utc::now()),
                    ..Default::default()
                },
            )
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::InMemoryAuditStore;
    use crate::registry::ConnectionState;
    use fleet_wire::RegisterRequest;
    use tokio::sync::mpsc;

    fn sample_request(agent_id: &str) -> RegisterRequest {
        RegisterRequest {
            agent_id: agent_id.to_string(),
            hostname: "h1".to_string(),
            ip_address: "10.0.0.5".to_string(),
            os_type: "linux".to_string(),
            arch: "x86_64".to_string(),
            agent_version: "1.0.0".to_string(),
            system_info: None,
        }
    }

    #[tokio::test]
    async fn dispatch_fails_when_agent_not_streaming() {
        let registry = Arc::new(AgentRegistry::new());
        registry.register(sample_request("agent-1"));
        let audit = Arc::new(InMemoryAuditStore::new());
        let dispatcher = CommandDispatcher::new(registry, audit);

        let result = dispatcher
            .dispatch(
                &AgentId::new("agent-1"),
                "precheck",
                HashMap::new(),
                Duration::from_secs(5),
                "test",
            )
            .await;
        assert!(matches!(result, Err(ControlPlaneError::AgentUnavailable(_))));
    }

    #[tokio::test]
    async fn dispatch_sends_request_and_tracks_in_flight() {
        let registry = Arc::new(AgentRegistry::new());
        let conn = registry.register(sample_request("agent-1"));
        let (tx, mut rx) = mpsc::channel(8);
        conn.attach_stream(tx);
        assert_eq!(conn.state(), ConnectionState::Streaming);

        let audit = Arc::new(InMemoryAuditStore::new());
        let dispatcher = CommandDispatcher::new(registry.clone(), audit);

        let handle = dispatcher
            .dispatch(
                &AgentId::new("agent-1"),
                "precheck",
                HashMap::new(),
                Duration::from_secs(5),
                "test",
            )
            .await
            .unwrap();

        let sent = rx.recv().await.unwrap().unwrap();
        assert_eq!(sent.command_id, handle.command_id.to_string());
        assert_eq!(conn.in_flight.len(), 1);
    }
}
