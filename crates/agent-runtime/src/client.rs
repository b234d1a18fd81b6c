//! Control-plane client: the Agent side of the wire contract (spec.md
//! §4.1). Owns `Register`, drives a periodic `Heartbeat`, and runs the
//! bidirectional `CommandStream` that the Executor and Event Reporter
//! attach to.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use fleet_config::AgentRuntimeConfig;
use fleet_wire::pb::agent_orchestration_client::AgentOrchestrationClient;
use fleet_wire::{
    pb, CommandResponse, HeartbeatRequest, LogEntry, LogLevel, ProcessStatus, RegisterRequest,
    RegisterResponse, ResourceUsage, SystemInfo, AGENT_INIT_COMMAND_ID,
};
use sysinfo::System;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt;
use tonic::transport::{Certificate, Channel, ClientTlsConfig, Endpoint};
use tonic::Request;
use tracing::{info, warn};

use crate::errors::AgentRuntimeError;
use crate::executor::{CommandExecutor, ProgressReporter};
use crate::reporter::{EventReporter, ReportError, ReportSink};

/// Connection to the control plane's `AgentOrchestration` service, plus
/// the identity this process registered under.
pub struct AgentClient {
    inner: AgentOrchestrationClient<Channel>,
    config: AgentRuntimeConfig,
}

impl AgentClient {
    pub async fn connect(config: AgentRuntimeConfig) -> Result<Self, AgentRuntimeError> {
        let scheme = if config.tls_enabled { "https" } else { "http" };
        let endpoint = format!("{scheme}://{}", config.control_plane_addr);
        let mut endpoint = Endpoint::from_shared(endpoint)
            .map_err(|e| AgentRuntimeError::RegistrationRejected(e.to_string()))?;

        if config.tls_enabled {
            endpoint = endpoint
                .tls_config(client_tls_config(&config).await?)
                .map_err(|e| AgentRuntimeError::RegistrationRejected(e.to_string()))?;
        }

        let channel = endpoint.connect().await?;
        let inner = AgentOrchestrationClient::new(channel)
            .max_decoding_message_size(config.max_message_size)
            .max_encoding_message_size(config.max_message_size);
        Ok(Self { inner, config })
    }

    /// spec §4.1 point 1. A missing `ip_address` is rejected by the
    /// server with `success=false`, not an RPC error.
    pub async fn register(
        &mut self,
        hostname: String,
        ip_address: String,
        os_type: String,
        arch: String,
        agent_version: String,
    ) -> Result<RegisterResponse, AgentRuntimeError> {
        let req = RegisterRequest {
            agent_id: self.config.agent_id.clone().unwrap_or_default(),
            hostname,
            ip_address,
            os_type,
            arch,
            agent_version,
            system_info: Some(local_system_info()),
        };

        let response: RegisterResponse = self
            .inner
            .register(Request::new(req.into()))
            .await?
            .into_inner()
            .into();

        if !response.success {
            return Err(AgentRuntimeError::RegistrationRejected(response.message));
        }
        info!(agent_id = %response.assigned_id, "registered with control plane");
        Ok(response)
    }

    /// spec §4.3: sent on `heartbeat_interval` (as pushed by the
    /// registration response); `NotFound` means the Agent must re-register.
    pub async fn heartbeat_once(
        &mut self,
        agent_id: &str,
        processes: Vec<ProcessStatus>,
    ) -> Result<(), AgentRuntimeError> {
        let req = HeartbeatRequest {
            agent_id: agent_id.to_string(),
            timestamp_ms: chrono::Utc::now().timestamp_millis() as u64,
            resource_usage: Some(local_resource_usage()),
            processes,
        };
        self.inner.heartbeat(Request::new(req.try_into().map_err(
            |e: fleet_wire::WireError| AgentRuntimeError::RegistrationRejected(e.to_string()),
        )?)).await?;
        Ok(())
    }

    pub fn spawn_heartbeat_loop(
        mut self_client: Self,
        agent_id: String,
        interval: Duration,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval.max(Duration::from_millis(1)));
            loop {
                ticker.tick().await;
                if let Err(err) = self_client.heartbeat_once(&agent_id, Vec::new()).await {
                    warn!(%agent_id, error = %err, "heartbeat failed");
                }
            }
        })
    }

    /// spec §4.1 point 3: open the bidirectional stream, identify it with
    /// the `AGENT_INIT` frame, then drive `CommandRequest` frames through
    /// the Executor and stream its responses back.
    pub async fn run_command_stream(
        &mut self,
        agent_id: String,
        executor: Arc<CommandExecutor>,
        reporter: Arc<EventReporter>,
    ) -> Result<(), AgentRuntimeError> {
        let (tx, rx) = mpsc::channel::<pb::CommandResponse>(self.config.batch_size.max(32));

        let init = CommandResponse {
            command_id: AGENT_INIT_COMMAND_ID.to_string(),
            status: fleet_wire::CommandStatus::Running,
            progress: 0,
            output: agent_id.clone(),
            error: String::new(),
        };
        tx.send(init.try_into().map_err(|e: fleet_wire::WireError| {
            AgentRuntimeError::RegistrationRejected(e.to_string())
        })?)
            .await
            .map_err(|_| AgentRuntimeError::RegistrationRejected("outbound channel closed".into()))?;

        let outbound = ReceiverStream::new(rx);
        let response = self.inner.command_stream(Request::new(outbound)).await?;
        let mut inbound = response.into_inner();

        reporter.set_connected(true);
        info!(%agent_id, "command stream established");

        loop {
            match inbound.next().await {
                Some(Ok(frame)) => {
                    let command: fleet_wire::CommandRequest = frame.into();
                    let executor = executor.clone();
                    let tx = tx.clone();
                    let agent_id = agent_id.clone();
                    tokio::spawn(async move {
                        let progress = ProgressReporter::new(command.command_id.clone(), tx.clone());
                        let terminal = executor.execute(agent_id, command, progress).await;
                        if let Ok(wire) = fleet_wire::pb::CommandResponse::try_from(terminal) {
                            let _ = tx.send(wire).await;
                        }
                    });
                }
                Some(Err(status)) => {
                    warn!(%agent_id, error = %status, "command stream transport error");
                    break;
                }
                None => {
                    info!(%agent_id, "command stream closed by control plane");
                    break;
                }
            }
        }

        reporter.set_connected(false);
        Ok(())
    }

    /// spec §4.1 point 4: client-streaming upload of structured log
    /// entries. Kept open for the life of the connection and used as the
    /// Event Reporter's `ReportSink` (§9 Open Question: the specification
    /// leaves the exact upload RPC unstated; this core reuses `LogStream`
    /// rather than inventing a fifth RPC).
    pub async fn attach_log_sink(
        &mut self,
        agent_id: String,
        reporter: &Arc<EventReporter>,
    ) -> Result<tokio::task::JoinHandle<()>, AgentRuntimeError> {
        let (tx, rx) = mpsc::channel::<pb::LogEntry>(256);
        reporter.attach_sink(Arc::new(LogStreamSink {
            agent_id,
            sender: tx,
        }));

        let outbound = ReceiverStream::new(rx);
        let mut client = self.inner.clone();
        Ok(tokio::spawn(async move {
            match client.log_stream(Request::new(outbound)).await {
                Ok(response) => {
                    info!(received = response.into_inner().received_count, "log stream closed");
                }
                Err(status) => warn!(error = %status, "log stream failed"),
            }
        }))
    }
}

struct LogStreamSink {
    agent_id: String,
    sender: mpsc::Sender<pb::LogEntry>,
}

#[async_trait]
impl ReportSink for LogStreamSink {
    async fn report(&self, batch: Vec<crate::reporter::ProcessEvent>) -> Result<(), ReportError> {
        for event in batch {
            let mut fields: HashMap<String, String> = event.details;
            fields.insert("pid".to_string(), event.pid.to_string());
            fields.insert("install_dir".to_string(), event.install_dir);
            fields.insert("role".to_string(), event.role);
            fields.insert("cluster_id".to_string(), event.cluster_id);
            fields.insert("node_id".to_string(), event.node_id);
            fields.insert("host_id".to_string(), event.host_id);

            let entry = LogEntry {
                agent_id: self.agent_id.clone(),
                level: LogLevel::Info,
                message: format!("{:?}: {}", event.event_type, event.name),
                timestamp_ms: event.timestamp.timestamp_millis() as u64,
                fields,
            };
            let wire: pb::LogEntry = entry
                .try_into()
                .map_err(|e: fleet_wire::WireError| ReportError(e.to_string()))?;
            self.sender
                .send(wire)
                .await
                .map_err(|_| ReportError("log stream closed".to_string()))?;
        }
        Ok(())
    }
}

/// Builds the client's TLS config. `ca_file`, when set, pins the control
/// plane's certificate authority; otherwise the platform trust roots
/// bundled by tonic's `tls-roots` feature are used (spec §6: "TCP with
/// optional TLS 1.2+").
async fn client_tls_config(config: &AgentRuntimeConfig) -> Result<ClientTlsConfig, AgentRuntimeError> {
    let mut tls = ClientTlsConfig::new();
    if let Some(ca_path) = &config.ca_file {
        let ca = tokio::fs::read(ca_path).await.map_err(|e| {
            AgentRuntimeError::RegistrationRejected(format!(
                "failed to read ca_file at {ca_path}: {e}"
            ))
        })?;
        tls = tls.ca_certificate(Certificate::from_pem(ca));
    }
    Ok(tls)
}

fn local_system_info() -> SystemInfo {
    let mut sys = System::new();
    sys.refresh_memory();
    SystemInfo {
        cpu_cores: std::thread::available_parallelism()
            .map(|n| n.get() as u32)
            .unwrap_or(1),
        total_memory_bytes: sys.total_memory(),
        total_disk_bytes: 0,
        kernel_version: System::kernel_version().unwrap_or_default(),
    }
}

fn local_resource_usage() -> ResourceUsage {
    let mut sys = System::new();
    sys.refresh_memory();
    let total = sys.total_memory();
    let used = sys.used_memory();
    ResourceUsage {
        cpu_percent: 0.0,
        memory_percent: if total == 0 {
            0.0
        } else {
            (used as f64 / total as f64) * 100.0
        },
        disk_percent: 0.0,
        available_memory_bytes: total.saturating_sub(used),
        available_disk_bytes: 0,
    }
}
