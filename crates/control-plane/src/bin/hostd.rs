//! `hostd` — the fleet control plane's gRPC server binary.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use fleet_control_plane::{
    AgentRegistry, CommandDispatcher, HeartbeatTracker, HostMatcher, InMemoryAuditStore,
    InMemoryHostStore, OrchestrationMetrics, OrchestrationService, ProcessStartEpoch,
    RegistrationConfig,
};
use fleet_config::GrpcConfig;
use fleet_wire::pb::agent_orchestration_server::AgentOrchestrationServer;
use tonic::transport::{Certificate, Identity, Server, ServerTlsConfig};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "hostd", about = "Fleet control plane orchestrator")]
struct Opt {
    /// Path to an optional TOML config file.
    #[arg(short = 'c', long, env = "FLEET_CONTROL_CONFIG")]
    config: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .json()
        .init();

    let opt = Opt::parse();
    let config = fleet_config::load_control_plane(opt.config.as_deref())
        .context("failed to load control plane configuration")?;

    let addr = format!("0.0.0.0:{}", config.grpc.port)
        .parse()
        .context("invalid bind address")?;

    let metrics = Arc::new(OrchestrationMetrics::new());
    let registry = Arc::new(AgentRegistry::new().with_metrics(metrics.clone()));
    let host_store = Arc::new(InMemoryHostStore::new());
    let host_matcher = Arc::new(HostMatcher::new(host_store));
    let audit = Arc::new(InMemoryAuditStore::new());

    let heartbeat_timeout = Duration::from_secs(config.grpc.heartbeat_timeout_secs);
    let tracker = Arc::new(HeartbeatTracker::new(
        registry.clone(),
        host_matcher.clone(),
        ProcessStartEpoch::now(),
        heartbeat_timeout,
    ));
    let sweeper = tracker.spawn_sweeper();

    // Kept alive for the process lifetime so out-of-scope HTTP facades
    // (spec §6) have a dispatcher to synthesize commands against.
    let _dispatcher =
        CommandDispatcher::new(registry.clone(), audit.clone()).with_metrics(metrics.clone());

    let service = OrchestrationService::with_metrics(
        registry,
        host_matcher,
        audit,
        RegistrationConfig {
            heartbeat_interval_secs: config.grpc.heartbeat_interval_secs,
            log_level: "info".to_string(),
        },
        Some(metrics),
    );

    info!(%addr, "hostd listening");

    let shutdown = async {
        let _ = tokio::signal::ctrl_c().await;
        info!("shutdown signal received, draining");
    };

    let mut builder = Server::builder()
        .http2_keepalive_interval(Some(Duration::from_secs(5 * 60)))
        .http2_keepalive_timeout(Some(Duration::from_secs(20)));

    if config.grpc.tls_enabled {
        builder = builder
            .tls_config(server_tls_config(&config.grpc).await?)
            .context("failed to configure server TLS")?;
        info!(mtls = config.grpc.mtls_required(), "TLS enabled for grpc endpoint");
    }

    builder
        .add_service(
            AgentOrchestrationServer::new(service)
                .max_decoding_message_size(config.grpc.max_recv_msg_size)
                .max_encoding_message_size(config.grpc.max_send_msg_size),
        )
        .serve_with_shutdown(addr, shutdown)
        .await
        .context("gRPC server error")?;

    sweeper.stop();
    Ok(())
}

/// Builds the server's TLS identity from `cert_file`/`key_file`, requiring
/// client certificates signed by `ca_file` when set (spec §3, §6: "mTLS
/// when a CA is configured").
async fn server_tls_config(grpc: &GrpcConfig) -> Result<ServerTlsConfig> {
    let cert_path = grpc
        .cert_file
        .as_deref()
        .context("grpc.tls_enabled is set but grpc.cert_file is missing")?;
    let key_path = grpc
        .key_file
        .as_deref()
        .context("grpc.tls_enabled is set but grpc.key_file is missing")?;

    let cert = tokio::fs::read(cert_path)
        .await
        .with_context(|| format!("failed to read grpc.cert_file at {cert_path}"))?;
    let key = tokio::fs::read(key_path)
        .await
        .with_context(|| format!("failed to read grpc.key_file at {key_path}"))?;
    let mut tls = ServerTlsConfig::new().identity(Identity::from_pem(cert, key));

    if let Some(ca_path) = grpc.ca_file.as_deref() {
        let ca = tokio::fs::read(ca_path)
            .await
            .with_context(|| format!("failed to read grpc.ca_file at {ca_path}"))?;
        tls = tls.client_ca_root(Certificate::from_pem(ca));
    }

    Ok(tls)
}
