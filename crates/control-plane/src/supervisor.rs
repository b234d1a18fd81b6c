//! Stream Supervisor (spec.md §4.7): owns the receive half of a Agent's
//! `CommandStream` and tears the connection down on close, transport error,
//! or panic.

use std::sync::Arc;

use fleet_common::AgentId;
use fleet_wire::CommandResponse;
use tonic::Streaming;
use tracing::{error, info, warn};

use crate::audit::{AuditStore, AuditLogEntry};
use crate::correlator::ResponseCorrelator;
use crate::host_matcher::HostMatcher;
use crate::registry::AgentRegistry;

/// Runs the receive half of one Agent's `CommandStream` to completion.
///
/// The send half is the Dispatcher writing directly onto the
/// `mpsc::Sender` installed in the `AgentConnection` (spec §4.7: "safe for
/// concurrent send calls given ... a dedicated send task" — here, the
/// bounded channel itself serializes sends onto the wire via the paired
/// `tonic` response stream).
pub struct StreamSupervisor<A: AuditStore + 'static> {
    registry: Arc<AgentRegistry>,
    host_matcher: Arc<HostMatcher>,
    correlator: Arc<ResponseCorrelator<A>>,
    audit: Arc<A>,
}

impl<A: AuditStore + 'static> StreamSupervisor<A> {
    pub fn new(
        registry: Arc<AgentRegistry>,
        host_matcher: Arc<HostMatcher>,
        correlator: Arc<ResponseCorrelator<A>>,
        audit: Arc<A>,
    ) -> Self {
        Self {
            registry,
            host_matcher,
            correlator,
            audit,
        }
    }

    /// Drives `inbound` until it closes or errors, dispatching each frame
    /// to the Correlator. Spawned as its own task so a panic here is
    /// recovered by the task boundary rather than taking the process down
    /// (spec §4.7 "Panics in either half are recovered").
    pub fn spawn(
        self: Arc<Self>,
        agent_id: AgentId,
        mut inbound: Streaming<fleet_wire::pb::CommandResponse>,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let supervisor = self;

            loop {
                match inbound.message().await {
                    Ok(Some(frame)) => {
                        if let Err(e) = supervisor.handle_frame(&agent_id, frame).await {
                            error!(%agent_id, error = %e, "malformed command response frame");
                        }
                    }
                    Ok(None) => {
                        info!(%agent_id, "command stream closed by agent");
                        break;
                    }
                    Err(status) => {
                        warn!(%agent_id, error = %status, "command stream transport error");
                        break;
                    }
                }
            }

            supervisor.teardown(&agent_id).await;
        })
    }

    async fn handle_frame(
        &self,
        agent_id: &AgentId,
        frame: fleet_wire::pb::CommandResponse,
    ) -> Result<(), fleet_wire::WireError> {
        let response: CommandResponse = frame.try_into()?;
        if response.is_init_frame() {
            return Ok(());
        }
        let command_id = fleet_common::CommandId::parse(&response.command_id)
            .map_err(|e| fleet_wire::WireError::InvalidMessage(e.to_string()))?;
        self.correlator
            .handle_response(agent_id, command_id, response)
            .await;
        Ok(())
    }

    async fn teardown(&self, agent_id: &AgentId) {
        let Some(removed) = self.registry.handle_disconnect(agent_id) else {
            return;
        };
        if let Some(host_id) = removed.host_id() {
            self.host_matcher.mark_offline(&host_id).await;
        }
        self.audit
            .append_audit(AuditLogEntry::agent_lifecycle("agent_disconnected", agent_id))
            .await;
    }
}
