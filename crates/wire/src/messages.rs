//! Plain Rust mirrors of the generated protobuf messages.
//!
//! The control plane and Agent runtime work with these types internally;
//! the `From`/`TryFrom` impls translate to and from `crate::pb` only at
//! the RPC boundary. Keeping the two separate means a proto-schema change
//! never ripples through business logic untouched.

use crate::errors::WireError;
use crate::pb;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Command lifecycle status (spec §3: `Pending, Running, Success, Failed,
/// Cancelled`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandStatus {
    Pending,
    Running,
    Success,
    Failed,
    Cancelled,
}

impl CommandStatus {
    /// Whether this status is terminal (no further transitions expected).
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Success | Self::Failed | Self::Cancelled)
    }
}

impl From<CommandStatus> for pb::CommandStatus {
    fn from(s: CommandStatus) -> Self {
        match s {
            CommandStatus::Pending => pb::CommandStatus::Pending,
            CommandStatus::Running => pb::CommandStatus::Running,
            CommandStatus::Success => pb::CommandStatus::Success,
            CommandStatus::Failed => pb::CommandStatus::Failed,
            CommandStatus::Cancelled => pb::CommandStatus::Cancelled,
        }
    }
}

impl TryFrom<pb::CommandStatus> for CommandStatus {
    type Error = WireError;

    fn try_from(s: pb::CommandStatus) -> Result<Self, Self::Error> {
        match s {
            pb::CommandStatus::Pending => Ok(Self::Pending),
            pb::CommandStatus::Running => Ok(Self::Running),
            pb::CommandStatus::Success => Ok(Self::Success),
            pb::CommandStatus::Failed => Ok(Self::Failed),
            pb::CommandStatus::Cancelled => Ok(Self::Cancelled),
            pb::CommandStatus::Unspecified => Err(WireError::InvalidMessage(
                "command status left unspecified".into(),
            )),
        }
    }
}

/// Process lifecycle state reported in a heartbeat (§3 `ProcessStatus`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessState {
    Running,
    Stopped,
    Crashed,
}

impl From<ProcessState> for pb::ProcessState {
    fn from(s: ProcessState) -> Self {
        match s {
            ProcessState::Running => pb::ProcessState::Running,
            ProcessState::Stopped => pb::ProcessState::Stopped,
            ProcessState::Crashed => pb::ProcessState::Crashed,
        }
    }
}

impl TryFrom<pb::ProcessState> for ProcessState {
    type Error = WireError;

    fn try_from(s: pb::ProcessState) -> Result<Self, Self::Error> {
        match s {
            pb::ProcessState::Running => Ok(Self::Running),
            pb::ProcessState::Stopped => Ok(Self::Stopped),
            pb::ProcessState::Crashed => Ok(Self::Crashed),
            pb::ProcessState::Unknown => Err(WireError::InvalidMessage(
                "process state left unknown".into(),
            )),
        }
    }
}

/// Agent-side process lifecycle event type (§3 "Process Event").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessEventType {
    Started,
    Stopped,
    Crashed,
    Restarted,
    RestartFailed,
    RestartLimitReached,
}

/// Log level carried on the `LogStream` RPC and in framed batches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl From<LogLevel> for pb::LogLevel {
    fn from(l: LogLevel) -> Self {
        match l {
            LogLevel::Debug => pb::LogLevel::Debug,
            LogLevel::Info => pb::LogLevel::Info,
            LogLevel::Warn => pb::LogLevel::Warn,
            LogLevel::Error => pb::LogLevel::Error,
        }
    }
}

impl TryFrom<pb::LogLevel> for LogLevel {
    type Error = WireError;

    fn try_from(l: pb::LogLevel) -> Result<Self, Self::Error> {
        match l {
            pb::LogLevel::Debug => Ok(Self::Debug),
            pb::LogLevel::Info => Ok(Self::Info),
            pb::LogLevel::Warn => Ok(Self::Warn),
            pb::LogLevel::Error => Ok(Self::Error),
            pb::LogLevel::Unspecified => {
                Err(WireError::InvalidMessage("log level left unspecified".into()))
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemInfo {
    pub cpu_cores: u32,
    pub total_memory_bytes: u64,
    pub total_disk_bytes: u64,
    pub kernel_version: String,
}

impl From<SystemInfo> for pb::SystemInfo {
    fn from(s: SystemInfo) -> Self {
        pb::SystemInfo {
            cpu_cores: s.cpu_cores,
            total_memory_bytes: s.total_memory_bytes,
            total_disk_bytes: s.total_disk_bytes,
            kernel_version: s.kernel_version,
        }
    }
}

impl From<pb::SystemInfo> for SystemInfo {
    fn from(s: pb::SystemInfo) -> Self {
        Self {
            cpu_cores: s.cpu_cores,
            total_memory_bytes: s.total_memory_bytes,
            total_disk_bytes: s.total_disk_bytes,
            kernel_version: s.kernel_version,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegisterRequest {
    pub agent_id: String,
    pub hostname: String,
    pub ip_address: String,
    pub os_type: String,
    pub arch: String,
    pub agent_version: String,
    pub system_info: Option<SystemInfo>,
}

impl From<RegisterRequest> for pb::RegisterRequest {
    fn from(r: RegisterRequest) -> Self {
        pb::RegisterRequest {
            agent_id: r.agent_id,
            hostname: r.hostname,
            ip_address: r.ip_address,
            os_type: r.os_type,
            arch: r.arch,
            agent_version: r.agent_version,
            system_info: r.system_info.map(Into::into),
        }
    }
}

impl From<pb::RegisterRequest> for RegisterRequest {
    fn from(r: pb::RegisterRequest) -> Self {
        Self {
            agent_id: r.agent_id,
            hostname: r.hostname,
            ip_address: r.ip_address,
            os_type: r.os_type,
            arch: r.arch,
            agent_version: r.agent_version,
            system_info: r.system_info.map(Into::into),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegisterConfig {
    pub heartbeat_interval_secs: u64,
    pub log_level: String,
}

impl From<RegisterConfig> for pb::RegisterConfig {
    fn from(c: RegisterConfig) -> Self {
        pb::RegisterConfig {
            heartbeat_interval_secs: c.heartbeat_interval_secs,
            log_level: c.log_level,
        }
    }
}

impl From<pb::RegisterConfig> for RegisterConfig {
    fn from(c: pb::RegisterConfig) -> Self {
        Self {
            heartbeat_interval_secs: c.heartbeat_interval_secs,
            log_level: c.log_level,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegisterResponse {
    pub success: bool,
    pub message: String,
    pub assigned_id: String,
    pub config: Option<RegisterConfig>,
}

impl From<RegisterResponse> for pb::RegisterResponse {
    fn from(r: RegisterResponse) -> Self {
        pb::RegisterResponse {
            success: r.success,
            message: r.message,
            assigned_id: r.assigned_id,
            config: r.config.map(Into::into),
        }
    }
}

impl From<pb::RegisterResponse> for RegisterResponse {
    fn from(r: pb::RegisterResponse) -> Self {
        Self {
            success: r.success,
            message: r.message,
            assigned_id: r.assigned_id,
            config: r.config.map(Into::into),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ResourceUsage {
    pub cpu_percent: f64,
    pub memory_percent: f64,
    pub disk_percent: f64,
    pub available_memory_bytes: u64,
    pub available_disk_bytes: u64,
}

impl From<ResourceUsage> for pb::ResourceUsage {
    fn from(u: ResourceUsage) -> Self {
        pb::ResourceUsage {
            cpu_percent: u.cpu_percent,
            memory_percent: u.memory_percent,
            disk_percent: u.disk_percent,
            available_memory_bytes: u.available_memory_bytes,
            available_disk_bytes: u.available_disk_bytes,
        }
    }
}

impl From<pb::ResourceUsage> for ResourceUsage {
    fn from(u: pb::ResourceUsage) -> Self {
        Self {
            cpu_percent: u.cpu_percent,
            memory_percent: u.memory_percent,
            disk_percent: u.disk_percent,
            available_memory_bytes: u.available_memory_bytes,
            available_disk_bytes: u.available_disk_bytes,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessStatus {
    pub name: String,
    pub pid: u32,
    pub state: ProcessState,
}

impl TryFrom<ProcessStatus> for pb::ProcessStatus {
    type Error = WireError;

    fn try_from(p: ProcessStatus) -> Result<Self, Self::Error> {
        Ok(pb::ProcessStatus {
            name: p.name,
            pid: p.pid,
            state: pb::ProcessState::from(p.state) as i32,
        })
    }
}

impl TryFrom<pb::ProcessStatus> for ProcessStatus {
    type Error = WireError;

    fn try_from(p: pb::ProcessStatus) -> Result<Self, Self::Error> {
        let state = pb::ProcessState::try_from(p.state)
            .map_err(|_| WireError::InvalidMessage("unknown process state tag".into()))?;
        Ok(Self {
            name: p.name,
            pid: p.pid,
            state: state.try_into()?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeartbeatRequest {
    pub agent_id: String,
    pub timestamp_ms: u64,
    pub resource_usage: Option<ResourceUsage>,
    pub processes: Vec<ProcessStatus>,
}

impl TryFrom<HeartbeatRequest> for pb::HeartbeatRequest {
    type Error = WireError;

    fn try_from(h: HeartbeatRequest) -> Result<Self, Self::Error> {
        Ok(pb::HeartbeatRequest {
            agent_id: h.agent_id,
            timestamp_ms: h.timestamp_ms,
            resource_usage: h.resource_usage.map(Into::into),
            processes: h
                .processes
                .into_iter()
                .map(pb::ProcessStatus::try_from)
                .collect::<Result<_, _>>()?,
        })
    }
}

impl TryFrom<pb::HeartbeatRequest> for HeartbeatRequest {
    type Error = WireError;

    fn try_from(h: pb::HeartbeatRequest) -> Result<Self, Self::Error> {
        Ok(Self {
            agent_id: h.agent_id,
            timestamp_ms: h.timestamp_ms,
            resource_usage: h.resource_usage.map(Into::into),
            processes: h
                .processes
                .into_iter()
                .map(ProcessStatus::try_from)
                .collect::<Result<_, _>>()?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeartbeatResponse {
    pub success: bool,
    pub server_time_ms: u64,
    pub message: String,
}

impl From<HeartbeatResponse> for pb::HeartbeatResponse {
    fn from(h: HeartbeatResponse) -> Self {
        pb::HeartbeatResponse {
            success: h.success,
            server_time_ms: h.server_time_ms,
            message: h.message,
        }
    }
}

impl From<pb::HeartbeatResponse> for HeartbeatResponse {
    fn from(h: pb::HeartbeatResponse) -> Self {
        Self {
            success: h.success,
            server_time_ms: h.server_time_ms,
            message: h.message,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandRequest {
    pub command_id: String,
    pub command_type: String,
    pub parameters: HashMap<String, String>,
    pub timeout_ms: u64,
}

impl From<CommandRequest> for pb::CommandRequest {
    fn from(c: CommandRequest) -> Self {
        pb::CommandRequest {
            command_id: c.command_id,
            command_type: c.command_type,
            parameters: c.parameters,
            timeout_ms: c.timeout_ms,
        }
    }
}

impl From<pb::CommandRequest> for CommandRequest {
    fn from(c: pb::CommandRequest) -> Self {
        Self {
            command_id: c.command_id,
            command_type: c.command_type,
            parameters: c.parameters,
            timeout_ms: c.timeout_ms,
        }
    }
}

/// Sentinel command-id used by the Agent's very first `CommandStream`
/// frame to bind the stream to its registered connection (§4.1 point 3).
pub const AGENT_INIT_COMMAND_ID: &str = "AGENT_INIT";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandResponse {
    pub command_id: String,
    pub status: CommandStatus,
    pub progress: u32,
    pub output: String,
    pub error: String,
}

impl CommandResponse {
    /// Whether this frame is the Agent's stream-identification frame
    /// rather than a response to a dispatched command.
    pub fn is_init_frame(&self) -> bool {
        self.command_id.is_empty() || self.command_id == AGENT_INIT_COMMAND_ID
    }
}

impl TryFrom<CommandResponse> for pb::CommandResponse {
    type Error = WireError;

    fn try_from(c: CommandResponse) -> Result<Self, Self::Error> {
        Ok(pb::CommandResponse {
            command_id: c.command_id,
            status: pb::CommandStatus::from(c.status) as i32,
            progress: c.progress,
            output: c.output,
            error: c.error,
        })
    }
}

impl TryFrom<pb::CommandResponse> for CommandResponse {
    type Error = WireError;

    fn try_from(c: pb::CommandResponse) -> Result<Self, Self::Error> {
        let status = pb::CommandStatus::try_from(c.status)
            .map_err(|_| WireError::InvalidMessage("unknown command status tag".into()))?;
        Ok(Self {
            command_id: c.command_id,
            status: status.try_into()?,
            progress: c.progress,
            output: c.output,
            error: c.error,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub agent_id: String,
    pub level: LogLevel,
    pub message: String,
    pub timestamp_ms: u64,
    pub fields: HashMap<String, String>,
}

impl TryFrom<LogEntry> for pb::LogEntry {
    type Error = WireError;

    fn try_from(l: LogEntry) -> Result<Self, Self::Error> {
        Ok(pb::LogEntry {
            agent_id: l.agent_id,
            level: pb::LogLevel::from(l.level) as i32,
            message: l.message,
            timestamp_ms: l.timestamp_ms,
            fields: l.fields,
        })
    }
}

impl TryFrom<pb::LogEntry> for LogEntry {
    type Error = WireError;

    fn try_from(l: pb::LogEntry) -> Result<Self, Self::Error> {
        let level = pb::LogLevel::try_from(l.level)
            .map_err(|_| WireError::InvalidMessage("unknown log level tag".into()))?;
        Ok(Self {
            agent_id: l.agent_id,
            level: level.try_into()?,
            message: l.message,
            timestamp_ms: l.timestamp_ms,
            fields: l.fields,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogStreamResponse {
    pub received_count: u64,
}

impl From<LogStreamResponse> for pb::LogStreamResponse {
    fn from(r: LogStreamResponse) -> Self {
        pb::LogStreamResponse {
            received_count: r.received_count,
        }
    }
}

impl From<pb::LogStreamResponse> for LogStreamResponse {
    fn from(r: pb::LogStreamResponse) -> Self {
        Self {
            received_count: r.received_count,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn arb_command_status() -> impl Strategy<Value = CommandStatus> {
        prop_oneof![
            Just(CommandStatus::Pending),
            Just(CommandStatus::Running),
            Just(CommandStatus::Success),
            Just(CommandStatus::Failed),
            Just(CommandStatus::Cancelled),
        ]
    }

    fn arb_log_level() -> impl Strategy<Value = LogLevel> {
        prop_oneof![
            Just(LogLevel::Debug),
            Just(LogLevel::Info),
            Just(LogLevel::Warn),
            Just(LogLevel::Error),
        ]
    }

    fn arb_params() -> impl Strategy<Value = HashMap<String, String>> {
        prop::collection::hash_map("[a-z]{1,8}", "[a-zA-Z0-9 ]{0,16}", 0..4)
    }

    proptest! {
        #[test]
        fn register_request_roundtrips(
            agent_id in "[a-z0-9-]{0,16}",
            hostname in "[a-z0-9.-]{1,32}",
            ip_address in "[0-9.]{7,15}",
            os_type in "[a-z]{3,8}",
            arch in "[a-z0-9_]{3,8}",
            agent_version in "[0-9.]{1,8}",
            cpu_cores in 0u32..256,
        ) {
            let original = RegisterRequest {
                agent_id,
                hostname,
                ip_address,
                os_type,
                arch,
                agent_version,
                system_info: Some(SystemInfo {
                    cpu_cores,
                    total_memory_bytes: 1 << 30,
                    total_disk_bytes: 1 << 40,
                    kernel_version: "6.1.0".to_string(),
                }),
            };
            let wire: pb::RegisterRequest = original.clone().into();
            let back: RegisterRequest = wire.into();
            prop_assert_eq!(original, back);
        }

        #[test]
        fn heartbeat_request_roundtrips(
            agent_id in "[a-z0-9-]{1,16}",
            timestamp_ms in 0u64..u64::MAX,
            cpu_percent in 0.0f64..100.0,
        ) {
            let original = HeartbeatRequest {
                agent_id,
                timestamp_ms,
                resource_usage: Some(ResourceUsage {
                    cpu_percent,
                    memory_percent: 42.0,
                    disk_percent: 13.0,
                    available_memory_bytes: 1024,
                    available_disk_bytes: 2048,
                }),
                processes: vec![ProcessStatus {
                    name: "worker".to_string(),
                    pid: 1234,
                    state: ProcessState::Running,
                }],
            };
            let wire: pb::HeartbeatRequest = original.clone().try_into().unwrap();
            let back: HeartbeatRequest = wire.try_into().unwrap();
            prop_assert_eq!(original, back);
        }

        #[test]
        fn command_request_roundtrips(
            command_id in "[0-9a-f-]{36}",
            command_type in "[a-z_]{1,16}",
            timeout_ms in 0u64..3_600_000,
            parameters in arb_params(),
        ) {
            let original = CommandRequest { command_id, command_type, parameters, timeout_ms };
            let wire: pb::CommandRequest = original.clone().into();
            let back: CommandRequest = wire.into();
            prop_assert_eq!(original, back);
        }

        #[test]
        fn command_response_roundtrips(
            command_id in "[0-9a-f-]{36}",
            status in arb_command_status(),
            progress in 0u32..=100,
            output in ".{0,64}",
            error in ".{0,64}",
        ) {
            let original = CommandResponse { command_id, status, progress, output, error };
            let wire: pb::CommandResponse = original.clone().try_into().unwrap();
            let back: CommandResponse = wire.try_into().unwrap();
            prop_assert_eq!(original, back);
        }

        #[test]
        fn log_entry_roundtrips(
            agent_id in "[a-z0-9-]{1,16}",
            level in arb_log_level(),
            message in ".{0,64}",
            timestamp_ms in 0u64..u64::MAX,
            fields in arb_params(),
        ) {
            let original = LogEntry { agent_id, level, message, timestamp_ms, fields };
            let wire: pb::LogEntry = original.clone().try_into().unwrap();
            let back: LogEntry = wire.try_into().unwrap();
            prop_assert_eq!(original, back);
        }
    }

    #[test]
    fn init_frame_detection() {
        let init = CommandResponse {
            command_id: String::new(),
            status: CommandStatus::Running,
            progress: 0,
            output: "agent-ab12cd34".to_string(),
            error: String::new(),
        };
        assert!(init.is_init_frame());

        let named = CommandResponse {
            command_id: AGENT_INIT_COMMAND_ID.to_string(),
            ..init.clone()
        };
        assert!(named.is_init_frame());

        let regular = CommandResponse {
            command_id: "cmd-1".to_string(),
            ..init
        };
        assert!(!regular.is_init_frame());
    }
}
