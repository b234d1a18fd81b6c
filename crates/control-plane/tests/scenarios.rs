//! End-to-end scenarios from spec.md §8.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use fleet_common::AgentId;
use fleet_control_plane::{
    AgentRegistry, CommandDispatcher, InMemoryAuditStore, InMemoryHostStore, HostMatcher,
    OrchestrationService, RegistrationConfig,
};
use fleet_wire::pb;
use fleet_wire::pb::agent_orchestration_server::AgentOrchestration;
use tonic::Request;

fn register_request(agent_id: &str, ip: &str) -> pb::RegisterRequest {
    pb::RegisterRequest {
        agent_id: agent_id.to_string(),
        hostname: "h1".to_string(),
        ip_address: ip.to_string(),
        os_type: "linux".to_string(),
        arch: "x86_64".to_string(),
        agent_version: "1.0.0".to_string(),
        system_info: None,
    }
}

fn new_service() -> OrchestrationService<InMemoryAuditStore> {
    let registry = Arc::new(AgentRegistry::new());
    let host_matcher = Arc::new(HostMatcher::new(Arc::new(InMemoryHostStore::new())));
    let audit = Arc::new(InMemoryAuditStore::new());
    OrchestrationService::new(
        registry,
        host_matcher,
        audit,
        RegistrationConfig {
            heartbeat_interval_secs: 10,
            log_level: "info".to_string(),
        },
    )
}

#[tokio::test]
async fn s2_unknown_agent_heartbeat_returns_not_found() {
    let service = new_service();
    let req = pb::HeartbeatRequest {
        agent_id: "ghost".to_string(),
        timestamp_ms: 0,
        resource_usage: None,
        processes: vec![],
    };

    let status = service
        .heartbeat(Request::new(req))
        .await
        .expect_err("unknown agent must fail");
    assert_eq!(status.code(), tonic::Code::NotFound);
    assert!(status.message().contains("re-register"));
}

#[tokio::test]
async fn registration_rejects_missing_ip() {
    let service = new_service();
    let mut req = register_request("", "");
    req.ip_address.clear();

    let response = service
        .register(Request::new(req))
        .await
        .expect("register RPC itself does not fail")
        .into_inner();
    assert!(!response.success);
    assert!(response.assigned_id.is_empty());
}

#[tokio::test]
async fn registration_mints_id_and_pushes_config() {
    let service = new_service();
    let response = service
        .register(Request::new(register_request("", "10.0.0.5")))
        .await
        .unwrap()
        .into_inner();

    assert!(response.success);
    assert!(response.assigned_id.starts_with("agent-"));
    let config = response.config.expect("config must be pushed");
    assert_eq!(config.heartbeat_interval_secs, 10);
}

#[tokio::test]
async fn s3_dispatch_timeout_fails_waiter_and_audit_row() {
    let registry = Arc::new(AgentRegistry::new());
    let audit = Arc::new(InMemoryAuditStore::new());
    let conn = registry.register(register_request("agent-1", "10.0.0.5").into());
    let (tx, mut rx) = tokio::sync::mpsc::channel(8);
    conn.attach_stream(tx);

    let dispatcher = CommandDispatcher::new(registry.clone(), audit.clone());
    let handle = dispatcher
        .dispatch(
            &AgentId::new("agent-1"),
            "precheck",
            HashMap::new(),
            Duration::from_millis(50),
            "test",
        )
        .await
        .unwrap();
    let command_id = handle.command_id;

    // Drain the dispatched frame so the channel doesn't matter further.
    let _ = rx.recv().await;

    let outcome = handle.wait().await.unwrap();
    assert_eq!(outcome.status, fleet_wire::CommandStatus::Failed);
    assert!(outcome.error.unwrap().contains("timed out"));

    let row = audit.get_command_log(&command_id).await.unwrap();
    assert_eq!(row.status, fleet_wire::CommandStatus::Failed);
    assert!(row.error.unwrap().contains("timed out"));
}

#[tokio::test]
async fn s5_supersession_fails_previous_waiter() {
    let registry = Arc::new(AgentRegistry::new());
    let audit = Arc::new(InMemoryAuditStore::new());
    let conn = registry.register(register_request("agent-x", "10.0.0.5").into());
    let (tx, _rx) = tokio::sync::mpsc::channel(8);
    conn.attach_stream(tx);

    let dispatcher = CommandDispatcher::new(registry.clone(), audit.clone());
    let handle = dispatcher
        .dispatch(
            &AgentId::new("agent-x"),
            "precheck",
            HashMap::new(),
            Duration::from_secs(30),
            "test",
        )
        .await
        .unwrap();

    // Same id registers again: the old connection's waiter must fail.
    let new_conn = registry.register(register_request("agent-x", "10.0.0.5").into());
    assert_ne!(Arc::as_ptr(&new_conn), Arc::as_ptr(&conn));

    let outcome = handle.wait().await.unwrap();
    assert_eq!(outcome.status, fleet_wire::CommandStatus::Failed);
    assert!(outcome.error.unwrap().contains("superseded"));
}
