//! Audit Writer (spec.md §4.8): command lifecycle rows and the append-only
//! action log. `AuditStore` is the injected collaborator (§9); the
//! in-memory implementation is for tests and standalone runs.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fleet_common::{AgentId, CommandId, HostId};
use fleet_wire::CommandStatus;
use parking_lot::RwLock;
use std::collections::HashMap;

/// Append-once row with lifecycle updates (spec §3 "Command Log Entry").
#[derive(Debug, Clone)]
pub struct CommandLogEntry {
    pub command_id: CommandId,
    pub agent_id: AgentId,
    pub host_id: Option<HostId>,
    pub command_type: String,
    pub parameters: HashMap<String, String>,
    pub status: CommandStatus,
    pub progress: u32,
    pub output: String,
    pub error: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub created_by: String,
}

impl CommandLogEntry {
    pub fn pending(
        command_id: CommandId,
        agent_id: AgentId,
        host_id: Option<HostId>,
        command_type: String,
        parameters: HashMap<String, String>,
        created_by: impl Into<String>,
    ) -> Self {
        Self {
            command_id,
            agent_id,
            host_id,
            command_type,
            parameters,
            status: CommandStatus::Pending,
            progress: 0,
            output: String::new(),
            error: None,
            started_at: None,
            finished_at: None,
            created_at: Utc::now(),
            created_by: created_by.into(),
        }
    }
}

/// Partial update applied by `update_command_log` (spec §4.8). Fields left
/// `None` are unchanged.
#[derive(Debug, Clone, Default)]
pub struct CommandLogUpdate {
    pub status: Option<CommandStatus>,
    pub progress: Option<u32>,
    pub append_output: Option<String>,
    pub error: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

/// Immutable row in the append-only action log (spec §3 "Audit Log Entry").
#[derive(Debug, Clone)]
pub struct AuditLogEntry {
    pub user_id: Option<String>,
    pub username: Option<String>,
    pub action: String,
    pub resource_type: String,
    pub resource_id: String,
    pub resource_name: String,
    pub trigger: AuditTrigger,
    pub details: HashMap<String, String>,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuditTrigger {
    Auto,
    Manual,
}

impl AuditLogEntry {
    pub fn agent_lifecycle(action: impl Into<String>, agent_id: &AgentId) -> Self {
        Self {
            user_id: None,
            username: None,
            action: action.into(),
            resource_type: "agent".to_string(),
            resource_id: agent_id.to_string(),
            resource_name: agent_id.to_string(),
            trigger: AuditTrigger::Auto,
            details: HashMap::new(),
            ip_address: None,
            user_agent: None,
            created_at: Utc::now(),
        }
    }
}

#[async_trait]
pub trait AuditStore: Send + Sync {
    /// Unconditional insert keyed by `command_id`. The Dispatcher must not
    /// call this twice for the same id (spec §4.8).
    async fn create_command_log(&self, entry: CommandLogEntry);

    /// Partial update; a missing row is a no-op (spec §4.8, §4.6).
    async fn update_command_log(&self, command_id: &CommandId, update: CommandLogUpdate);

    async fn get_command_log(&self, command_id: &CommandId) -> Option<CommandLogEntry>;

    /// Unconditional insert of an immutable audit action log row.
    async fn append_audit(&self, entry: AuditLogEntry);

    async fn list_command_logs(&self) -> Vec<CommandLogEntry>;

    async fn list_audit_logs(&self) -> Vec<AuditLogEntry>;
}

#[derive(Default)]
pub struct InMemoryAuditStore {
    commands: RwLock<HashMap<CommandId, CommandLogEntry>>,
    audit_log: RwLock<Vec<AuditLogEntry>>,
}

impl InMemoryAuditStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl AuditStore for InMemoryAuditStore {
    async fn create_command_log(&self, entry: CommandLogEntry) {
        self.commands.write().insert(entry.command_id, entry);
    }

    async fn update_command_log(&self, command_id: &CommandId, update: CommandLogUpdate) {
        let mut commands = self.commands.write();
        let Some(row) = commands.get_mut(command_id) else {
            return;
        };
        if let Some(status) = update.status {
            row.status = status;
        }
        if let Some(progress) = update.progress {
            row.progress = progress;
        }
        if let Some(chunk) = update.append_output {
            row.output.push_str(&chunk);
        }
        if let Some(error) = update.error {
            row.error = Some(error);
        }
        if let Some(started_at) = update.started_at {
            row.started_at.get_or_insert(started_at);
        }
        if let Some(finished_at) = update.finished_at {
            row.finished_at = Some(finished_at);
        }
    }

    async fn get_command_log(&self, command_id: &CommandId) -> Option<CommandLogEntry> {
        self.commands.read().get(command_id).cloned()
    }

    async fn append_audit(&self, entry: AuditLogEntry) {
        self.audit_log.write().push(entry);
    }

    async fn list_command_logs(&self) -> Vec<CommandLogEntry> {
        self.commands.read().values().cloned().collect()
    }

    async fn list_audit_logs(&self) -> Vec<AuditLogEntry> {
        self.audit_log.read().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn update_is_idempotent_and_preserves_started_at() {
        let store = InMemoryAuditStore::new();
        let id = CommandId::new();
        store
            .create_command_log(CommandLogEntry::pending(
                id,
                AgentId::new("agent-1"),
                None,
                "precheck".to_string(),
                HashMap::new(),
                "system",
            ))
            .await;

        let first_start = Utc::now();
        store
            .update_command_log(
                &id,
                CommandLogUpdate {
                    status: Some(CommandStatus::Running),
                    started_at: Some(first_start),
                    ..Default::default()
                },
            )
            .await;
        store
            .update_command_log(
                &id,
                CommandLogUpdate {
                    progress: Some(50),
                    started_at: Some(Utc::now()),
                    ..Default::default()
                },
            )
            .await;

        let row = store.get_command_log(&id).await.unwrap();
        assert_eq!(row.started_at, Some(first_start));
        assert_eq!(row.progress, 50);
    }

    #[tokio::test]
    async fn update_on_missing_row_is_noop() {
        let store = InMemoryAuditStore::new();
        store
            .update_command_log(&CommandId::new(), CommandLogUpdate::default())
            .await;
        assert!(store.list_command_logs().await.is_empty());
    }
}
