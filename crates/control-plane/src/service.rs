//! Wires the Registry, Host Matcher, Dispatcher, Correlator, Stream
//! Supervisor, and Audit Writer together behind the `AgentOrchestration`
//! gRPC service (spec.md §4.1).

use std::pin::Pin;
use std::sync::Arc;

use fleet_common::AgentId;
use fleet_wire::pb::agent_orchestration_server::AgentOrchestration;
use fleet_wire::{pb, CommandResponse, HeartbeatRequest, RegisterConfig, RegisterRequest, RegisterResponse};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::Stream;
use tonic::{Request, Response, Status, Streaming};
use tracing::{info, warn};

use crate::audit::{AuditLogEntry, AuditStore};
use crate::correlator::ResponseCorrelator;
use crate::host_matcher::HostMatcher;
use crate::metrics::OrchestrationMetrics;
use crate::registry::AgentRegistry;
use crate::supervisor::StreamSupervisor;

/// Registration response config pushed to every Agent (spec §6).
#[derive(Debug, Clone)]
pub struct RegistrationConfig {
    pub heartbeat_interval_secs: u64,
    pub log_level: String,
}

pub struct OrchestrationService<A: AuditStore + 'static> {
    registry: Arc<AgentRegistry>,
    host_matcher: Arc<HostMatcher>,
    audit: Arc<A>,
    supervisor: Arc<StreamSupervisor<A>>,
    registration_config: RegistrationConfig,
    /// Log entries at this level or above are persisted to the audit trail
    /// (spec §4.1 point 4: "persists selected ones").
    persisted_log_level: fleet_wire::LogLevel,
    outbound_buffer: usize,
}

impl<A: AuditStore + 'static> OrchestrationService<A> {
    pub fn new(
        registry: Arc<AgentRegistry>,
        host_matcher: Arc<HostMatcher>,
        audit: Arc<A>,
        registration_config: RegistrationConfig,
    ) -> Self {
        Self::with_metrics(registry, host_matcher, audit, registration_config, None)
    }

    /// Same wiring as `new`, plus attaching the control plane's metrics
    /// surface to the Correlator that this service's Supervisor drives.
    pub fn with_metrics(
        registry: Arc<AgentRegistry>,
        host_matcher: Arc<HostMatcher>,
        audit: Arc<A>,
        registration_config: RegistrationConfig,
        metrics: Option<Arc<OrchestrationMetrics>>,
    ) -> Self {
        let mut correlator = ResponseCorrelator::new(registry.clone(), audit.clone());
        if let Some(metrics) = metrics {
            correlator = correlator.with_metrics(metrics);
        }
        let correlator = Arc::new(correlator);
        let supervisor = Arc::new(StreamSupervisor::new(
            registry.clone(),
            host_matcher.clone(),
            correlator,
            audit.clone(),
        ));
        Self {
            registry,
            host_matcher,
            audit,
            supervisor,
            registration_config,
            persisted_log_level: fleet_wire::LogLevel::Warn,
            outbound_buffer: 32,
        }
    }
}

type CommandStreamResponseStream = Pin<Box<dyn Stream<Item = Result<pb::CommandRequest, Status>> + Send>>;

#[tonic::async_trait]
impl<A: AuditStore + 'static> AgentOrchestration for OrchestrationService<A> {
    type CommandStreamStream = CommandStreamResponseStream;

    async fn register(
        &self,
        request: Request<pb::RegisterRequest>,
    ) -> Result<Response<pb::RegisterResponse>, Status> {
        let req: RegisterRequest = request.into_inner().into();

        if req.ip_address.trim().is_empty() {
            return Ok(Response::new(
                RegisterResponse {
                    success: false,
                    message: "ip_address is required".to_string(),
                    assigned_id: String::new(),
                    config: None,
                }
                .into(),
            ));
        }

        let ip_address = req.ip_address.clone();
        let agent_version = req.agent_version.clone();
        let os_type = req.os_type.clone();
        let arch = req.arch.clone();
        let system_info = req.system_info.clone();

        let conn = self.registry.register(req);

        if let Some(host_id) = self
            .host_matcher
            .match_registration(
                &ip_address,
                conn.agent_id.clone(),
                agent_version,
                os_type,
                arch,
                system_info.as_ref(),
            )
            .await
        {
            conn.set_host_id(host_id);
        }

        self.audit
            .append_audit(AuditLogEntry::agent_lifecycle("agent_registered", &conn.agent_id))
            .await;

        Ok(Response::new(
            RegisterResponse {
                success: true,
                message: "registered".to_string(),
                assigned_id: conn.agent_id.to_string(),
                config: Some(RegisterConfig {
                    heartbeat_interval_secs: self.registration_config.heartbeat_interval_secs,
                    log_level: self.registration_config.log_level.clone(),
                }),
            }
            .into(),
        ))
    }

    async fn heartbeat(
        &self,
        request: Request<pb::HeartbeatRequest>,
    ) -> Result<Response<pb::HeartbeatResponse>, Status> {
        let req: HeartbeatRequest = request
            .into_inner()
            .try_into()
            .map_err(|e: fleet_wire::WireError| Status::from(e))?;

        let agent_id = AgentId::new(req.agent_id.clone());
        let conn = self
            .registry
            .get(&agent_id)
            .ok_or_else(|| Status::not_found("agent not found, please re-register"))?;

        conn.touch_heartbeat();

        if let (Some(host_id), Some(usage)) = (conn.host_id(), req.resource_usage.clone()) {
            self.host_matcher
                .record_heartbeat(
                    &host_id,
                    usage.cpu_percent,
                    usage.memory_percent,
                    usage.disk_percent,
                )
                .await;
        }

        Ok(Response::new(
            fleet_wire::HeartbeatResponse {
                success: true,
                server_time_ms: chrono::Utc::now().timestamp_millis() as u64,
                message: String::new(),
            }
            .into(),
        ))
    }

    async fn command_stream(
        &self,
        request: Request<Streaming<pb::CommandResponse>>,
    ) -> Result<Response<Self::CommandStreamStream>, Status> {
        let mut inbound = request.into_inner();

        let first = inbound
            .message()
            .await?
            .ok_or_else(|| Status::invalid_argument("command stream closed before init frame"))?;
        let init: CommandResponse = first
            .try_into()
            .map_err(|e: fleet_wire::WireError| Status::from(e))?;
        if !init.is_init_frame() {
            return Err(Status::invalid_argument(
                "first CommandStream frame must be the init frame",
            ));
        }
        if init.output.trim().is_empty() {
            return Err(Status::invalid_argument(
                "init frame must carry the agent's id in `output`",
            ));
        }
        let agent_id = AgentId::new(init.output.clone());

        let (tx, rx) = mpsc::channel(self.outbound_buffer);
        self.registry
            .set_stream(&agent_id, tx)
            .map_err(Status::from)?;
        info!(%agent_id, "command stream established");

        self.supervisor.clone().spawn(agent_id, inbound);

        Ok(Response::new(Box::pin(ReceiverStream::new(rx))))
    }

    async fn log_stream(
        &self,
        request: Request<Streaming<pb::LogEntry>>,
    ) -> Result<Response<pb::LogStreamResponse>, Status> {
        use tokio_stream::StreamExt;

        let mut inbound = request.into_inner();
        let mut received_count: u64 = 0;

        while let Some(frame) = inbound.next().await {
            let frame = frame?;
            let entry: fleet_wire::LogEntry = match frame.try_into() {
                Ok(entry) => entry,
                Err(e) => {
                    warn!(error = %e, "dropping malformed log entry");
                    continue;
                }
            };
            received_count += 1;

            if level_rank(entry.level) >= level_rank(self.persisted_log_level) {
                let mut details = entry.fields.clone();
                details.insert("message".to_string(), entry.message.clone());
                self.audit
                    .append_audit(AuditLogEntry {
                        user_id: None,
                        username: None,
                        action: "agent_log".to_string(),
                        resource_type: "agent".to_string(),
                        resource_id: entry.agent_id.clone(),
                        resource_name: entry.agent_id.clone(),
                        trigger: crate::audit::AuditTrigger::Auto,
                        details,
                        ip_address: None,
                        user_agent: None,
                        created_at: chrono::Utc::now(),
                    })
                    .await;
            }
        }

        Ok(Response::new(
            fleet_wire::LogStreamResponse { received_count }.into(),
        ))
    }
}

fn level_rank(level: fleet_wire::LogLevel) -> u8 {
    match level {
        fleet_wire::LogLevel::Debug => 0,
        fleet_wire::LogLevel::Info => 1,
        fleet_wire::LogLevel::Warn => 2,
        fleet_wire::LogLevel::Error => 3,
    }
}
