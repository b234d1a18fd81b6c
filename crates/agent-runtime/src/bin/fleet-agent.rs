//! `fleet-agent` — the remote execution Agent binary.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use fleet_agent_runtime::{AgentClient, CommandExecutor, EchoHandler, EventReporter};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "fleet-agent", about = "Fleet orchestration core Agent")]
struct Opt {
    /// Path to an optional TOML config file.
    #[arg(short = 'c', long, env = "FLEET_AGENT_CONFIG")]
    config: Option<String>,

    #[arg(long, env = "FLEET_AGENT_HOSTNAME")]
    hostname: Option<String>,

    #[arg(long, env = "FLEET_AGENT_IP")]
    ip_address: String,

    #[arg(long, env = "FLEET_AGENT_OS_TYPE", default_value = "linux")]
    os_type: String,

    #[arg(long, env = "FLEET_AGENT_ARCH", default_value = "x86_64")]
    arch: String,

    #[arg(long, env = "FLEET_AGENT_VERSION", default_value = env!("CARGO_PKG_VERSION"))]
    agent_version: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .json()
        .init();

    let opt = Opt::parse();
    let config = fleet_config::load_agent_runtime(opt.config.as_deref())
        .context("failed to load agent runtime configuration")?;

    let hostname = opt
        .hostname
        .clone()
        .or_else(sysinfo::System::host_name)
        .unwrap_or_else(|| "unknown-host".to_string());

    let reporter = EventReporter::new(config.event_cache_size, config.batch_size);
    let executor = Arc::new(CommandExecutor::new());
    executor.register("echo", Arc::new(EchoHandler));

    let _flush_loop = reporter
        .clone()
        .spawn_flush_loop(Duration::from_secs(config.flush_interval_secs));

    // spec §4.9: reconnects resume flushing where they left off — the
    // reporter's cache survives across connection attempts, only the
    // `connected` flag and sink flip.
    loop {
        match run_once(&config, &hostname, &opt, executor.clone(), reporter.clone()).await {
            Ok(()) => info!("agent session ended cleanly"),
            Err(err) => error!(error = %err, "agent session failed, reconnecting"),
        }
        reporter.set_connected(false);
        tokio::time::sleep(Duration::from_secs(2)).await;
    }
}

async fn run_once(
    config: &fleet_config::AgentRuntimeConfig,
    hostname: &str,
    opt: &Opt,
    executor: Arc<CommandExecutor>,
    reporter: Arc<EventReporter>,
) -> Result<()> {
    let mut client = AgentClient::connect(config.clone())
        .await
        .context("failed to connect to control plane")?;

    let response = client
        .register(
            hostname.to_string(),
            opt.ip_address.clone(),
            opt.os_type.clone(),
            opt.arch.clone(),
            opt.agent_version.clone(),
        )
        .await
        .context("registration rejected")?;

    let agent_id = response.assigned_id;
    let heartbeat_interval = response
        .config
        .map(|c| Duration::from_secs(c.heartbeat_interval_secs.max(1)))
        .unwrap_or(Duration::from_secs(10));

    let _log_sink = client.attach_log_sink(agent_id.clone(), &reporter).await?;

    let mut heartbeat_client = AgentClient::connect(config.clone()).await?;
    let heartbeat_agent_id = agent_id.clone();
    let heartbeat_handle = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(heartbeat_interval);
        loop {
            ticker.tick().await;
            if let Err(err) = heartbeat_client.heartbeat_once(&heartbeat_agent_id, Vec::new()).await {
                warn!(error = %err, "heartbeat failed");
            }
        }
    });

    let stream_result = client.run_command_stream(agent_id, executor, reporter).await;
    heartbeat_handle.abort();
    stream_result.map_err(anyhow::Error::from)
}
