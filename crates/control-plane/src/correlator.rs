//! Response Correlator (spec.md §4.6): drives the receive side of
//! `CommandStream`.

use chrono::Utc;
use fleet_common::{AgentId, CommandId};
use fleet_wire::CommandResponse;
use std::sync::Arc;
use tracing::debug;

use crate::audit::{AuditStore, CommandLogUpdate};
use crate::metrics::OrchestrationMetrics;
use crate::registry::AgentRegistry;
use crate::waiter::CommandOutcome;

pub struct ResponseCorrelator<A: AuditStore + 'static> {
    registry: Arc<AgentRegistry>,
    audit: Arc<A>,
    metrics: Option<Arc<OrchestrationMetrics>>,
}

impl<A: AuditStore + 'static> ResponseCorrelator<A> {
    pub fn new(registry: Arc<AgentRegistry>, audit: Arc<A>) -> Self {
        Self {
            registry,
            audit,
            metrics: None,
        }
    }

    /// Attach the control plane's metrics surface so every processed
    /// response updates `command_responses_total`, and terminal ones also
    /// decrement `in_flight_commands`.
    pub fn with_metrics(mut self, metrics: Arc<OrchestrationMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// spec §4.6 steps 1-5. `command_id` must already have been parsed by
    /// the caller (non-init frames only).
    pub async fn handle_response(&self, agent_id: &AgentId, command_id: CommandId, response: CommandResponse) {
        let Some(conn) = self.registry.get(agent_id) else {
            debug!(%agent_id, %command_id, "response for unknown agent, dropping");
            return;
        };

        let Some(waiter) = conn.in_flight.get(&command_id).map(|e| e.value().clone()) else {
            debug!(%agent_id, %command_id, "late or duplicate response, dropping");
            return;
        };

        // spec §4.6: "out-of-order older progress is ignored" — only the
        // progress *value* is suppressed, not the rest of the frame. A
        // terminal frame (e.g. a Failed frame carrying progress:0 after a
        // prior Running frame reported higher progress) must still update
        // status/output/error/finished_at and resolve the waiter.
        let progress = waiter.accept_progress(response.progress);
        if progress.is_none() {
            debug!(%agent_id, %command_id, progress = response.progress, "stale progress value ignored, rest of frame still applied");
        }

        let output = waiter.append_output(&response.output);
        let just_started = response.status == fleet_wire::CommandStatus::Running && waiter.mark_started();
        let is_terminal = response.status.is_terminal();
        let now = Utc::now();

        self.audit
            .update_command_log(
                &command_id,
                CommandLogUpdate {
                    status: Some(response.status),
                    progress,
                    append_output: if response.output.is_empty() {
                        None
                    } else {
                        Some(response.output.clone())
                    },
                    error: if response.error.is_empty() {
                        None
                    } else {
                        Some(response.error.clone())
                    },
                    started_at: if just_started { Some(now) } else { None },
                    finished_at: if is_terminal { Some(now) } else { None },
                },
            )
            .await;

        if let Some(metrics) = &self.metrics {
            metrics.command_responses_total.inc();
        }

        if is_terminal {
            conn.in_flight.remove(&command_id);
            if let Some(metrics) = &self.metrics {
                metrics.in_flight_commands.dec();
            }
            waiter.resolve(CommandOutcome {
                status: response.status,
                output,
                error: if response.error.is_empty() {
                    None
                } else {
                    Some(response.error)
                },
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::{CommandLogEntry, InMemoryAuditStore};
    use crate::registry::ConnectionState;
    use fleet_wire::{CommandStatus, RegisterRequest};
    use std::collections::HashMap;
    use tokio::sync::{mpsc, oneshot};

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

    async fn streaming_agent_with_waiter(
        registry: &Arc<AgentRegistry>,
        audit: &Arc<InMemoryAuditStore>,
    ) -> (AgentId, CommandId, oneshot::Receiver<CommandOutcome>) {
        let conn = registry.register(sample_request("agent-1"));
        let (tx, _rx) = mpsc::channel(8);
        conn.attach_stream(tx);
        assert_eq!(conn.state(), ConnectionState::Streaming);

        let command_id = CommandId::new();
        audit
            .create_command_log(CommandLogEntry::pending(
                command_id,
                conn.agent_id.clone(),
                None,
                "precheck".to_string(),
                HashMap::new(),
                "test",
            ))
            .await;
        let (done_tx, done_rx) = oneshot::channel();
        conn.in_flight
            .insert(command_id, Arc::new(crate::waiter::Waiter::new(done_tx)));
        (conn.agent_id.clone(), command_id, done_rx)
    }

    #[tokio::test]
    async fn scenario_s1_happy_path() {
        let registry = Arc::new(AgentRegistry::new());
        let audit = Arc::new(InMemoryAuditStore::new());
        let (agent_id, command_id, done_rx) =
            streaming_agent_with_waiter(&registry, &audit).await;
        let correlator = ResponseCorrelator::new(registry.clone(), audit.clone());

        correlator
            .handle_response(
                &agent_id,
                command_id,
                CommandResponse {
                    command_id: command_id.to_string(),
                    status: CommandStatus::Running,
                    progress: 50,
                    output: "checking port".to_string(),
                    error: String::new(),
                },
            )
            .await;
        correlator
            .handle_response(
                &agent_id,
                command_id,
                CommandResponse {
                    command_id: command_id.to_string(),
                    status: CommandStatus::Success,
                    progress: 100,
                    output: "ok".to_string(),
                    error: String::new(),
                },
            )
            .await;

        let outcome = done_rx.await.unwrap();
        assert_eq!(outcome.status, CommandStatus::Success);
        assert_eq!(outcome.output, "checking portok");

        let row = audit.get_command_log(&command_id).await.unwrap();
        assert_eq!(row.status, CommandStatus::Success);
        assert_eq!(row.progress, 100);
        assert!(row.started_at.is_some());
        assert!(row.finished_at.is_some());
        assert!(row.started_at.unwrap() <= row.finished_at.unwrap());
        assert!(row.output.contains("checking port"));
        assert!(row.output.contains("ok"));
    }

    #[tokio::test]
    async fn stale_progress_is_ignored() {
        let registry = Arc::new(AgentRegistry::new());
        let audit = Arc::new(InMemoryAuditStore::new());
        let (agent_id, command_id, _done_rx) =
            streaming_agent_with_waiter(&registry, &audit).await;
        let correlator = ResponseCorrelator::new(registry.clone(), audit.clone());

        correlator
            .handle_response(
                &agent_id,
                command_id,
                CommandResponse {
                    command_id: command_id.to_string(),
                    status: CommandStatus::Running,
                    progress: 80,
                    output: String::new(),
                    error: String::new(),
                },
            )
            .await;
        correlator
            .handle_response(
                &agent_id,
                command_id,
                CommandResponse {
                    command_id: command_id.to_string(),
                    status: CommandStatus::Running,
                    progress: 40,
                    output: String::new(),
                    error: String::new(),
                },
            )
            .await;

        let row = audit.get_command_log(&command_id).await.unwrap();
        assert_eq!(row.progress, 80);
    }

    /// A terminal frame with a regressed `progress` (e.g. `Failed` carrying
    /// `progress:0` after a prior `Running` frame reported higher progress)
    /// must still update status/error/finished_at and resolve the waiter —
    /// only the stale progress value is dropped.
    #[tokio::test]
    async fn terminal_frame_with_regressed_progress_still_resolves() {
        let registry = Arc::new(AgentRegistry::new());
        let audit = Arc::new(InMemoryAuditStore::new());
        let (agent_id, command_id, done_rx) =
            streaming_agent_with_waiter(&registry, &audit).await;
        let correlator = ResponseCorrelator::new(registry.clone(), audit.clone());

        correlator
            .handle_response(
                &agent_id,
                command_id,
                CommandResponse {
                    command_id: command_id.to_string(),
                    status: CommandStatus::Running,
                    progress: 80,
                    output: String::new(),
                    error: String::new(),
                },
            )
            .await;
        correlator
            .handle_response(
                &agent_id,
                command_id,
                CommandResponse {
                    command_id: command_id.to_string(),
                    status: CommandStatus::Failed,
                    progress: 0,
                    output: String::new(),
                    error: "handler crashed".to_string(),
                },
            )
            .await;

        let outcome = done_rx.await.unwrap();
        assert_eq!(outcome.status, CommandStatus::Failed);
        assert_eq!(outcome.error.as_deref(), Some("handler crashed"));

        let row = audit.get_command_log(&command_id).await.unwrap();
        assert_eq!(row.status, CommandStatus::Failed);
        assert_eq!(row.progress, 80, "stale progress value is dropped, not the frame");
        assert_eq!(row.error.as_deref(), Some("handler crashed"));
        assert!(row.finished_at.is_some());
        assert!(registry.get(&agent_id).unwrap().in_flight.is_empty());
    }

    #[tokio::test]
    async fn unknown_command_id_is_dropped_silently() {
        let registry = Arc::new(AgentRegistry::new());
        let audit = Arc::new(InMemoryAuditStore::new());
        let (agent_id, _command_id, _done_rx) =
            streaming_agent_with_waiter(&registry, &audit).await;
        let correlator = ResponseCorrelator::new(registry, audit);

        correlator
            .handle_response(
                &agent_id,
                CommandId::new(),
                CommandResponse {
                    command_id: "late".to_string(),
                    status: CommandStatus::Success,
                    progress: 100,
                    output: "late".to_string(),
                    error: String::new(),
                },
            )
            .await;
    }
}
