//! Control-plane configuration (§3 "Configuration" table).

use serde::{Deserialize, Serialize};
use validator::Validate;

/// `grpc.*` options from spec.md §3.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct GrpcConfig {
    /// Bind port for the Agent-facing stream endpoint. Default 9000 (§6).
    #[validate(range(min = 1, max = 65535))]
    pub port: u16,

    pub tls_enabled: bool,
    pub cert_file: Option<String>,
    pub key_file: Option<String>,
    /// When set, mTLS is required (§3).
    pub ca_file: Option<String>,

    /// Per-message frame limits. Default 16 MiB (§6).
    #[validate(range(min = 1024))]
    pub max_recv_msg_size: usize,
    #[validate(range(min = 1024))]
    pub max_send_msg_size: usize,

    /// Value pushed to Agents in the registration response.
    #[validate(range(min = 1))]
    pub heartbeat_interval_secs: u64,

    /// Server-side cutoff for marking an Agent offline (§4.3).
    #[validate(range(min = 1))]
    pub heartbeat_timeout_secs: u64,
}

impl Default for GrpcConfig {
    fn default() -> Self {
        Self {
            port: fleet_wire::DEFAULT_GRPC_PORT,
            tls_enabled: false,
            cert_file: None,
            key_file: None,
            ca_file: None,
            max_recv_msg_size: fleet_wire::DEFAULT_MAX_MESSAGE_SIZE,
            max_send_msg_size: fleet_wire::DEFAULT_MAX_MESSAGE_SIZE,
            heartbeat_interval_secs: 10,
            heartbeat_timeout_secs: 30,
        }
    }
}

impl GrpcConfig {
    /// mTLS is required exactly when a CA bundle is configured (§3).
    pub fn mtls_required(&self) -> bool {
        self.tls_enabled && self.ca_file.is_some()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct ControlPlaneConfig {
    #[validate(nested)]
    pub grpc: GrpcConfig,

    /// Max time to wait for in-flight audit writes and cancellations
    /// during a clean shutdown (§6 "Exit conditions").
    #[validate(range(min = 0))]
    pub shutdown_drain_secs: u64,
}

impl Default for ControlPlaneConfig {
    fn default() -> Self {
        Self {
            grpc: GrpcConfig::default(),
            shutdown_drain_secs: 10,
        }
    }
}

impl ControlPlaneConfig {
    pub(crate) fn defaults_source() -> config::Config {
        let defaults = Self::default();
        config::Config::builder()
            .set_default("grpc.port", defaults.grpc.port as i64)
            .unwrap()
            .set_default("grpc.tls_enabled", defaults.grpc.tls_enabled)
            .unwrap()
            .set_default("grpc.max_recv_msg_size", defaults.grpc.max_recv_msg_size as i64)
            .unwrap()
            .set_default("grpc.max_send_msg_size", defaults.grpc.max_send_msg_size as i64)
            .unwrap()
            .set_default(
                "grpc.heartbeat_interval_secs",
                defaults.grpc.heartbeat_interval_secs as i64,
            )
            .unwrap()
            .set_default(
                "grpc.heartbeat_timeout_secs",
                defaults.grpc.heartbeat_timeout_secs as i64,
            )
            .unwrap()
            .set_default("shutdown_drain_secs", defaults.shutdown_drain_secs as i64)
            .unwrap()
            .build()
            .expect("static defaults always build")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use validator::Validate;

    #[test]
    fn defaults_are_valid() {
        ControlPlaneConfig::default().validate().unwrap();
    }

    #[test]
    fn mtls_requires_ca_file() {
        let mut grpc = GrpcConfig::default();
        grpc.tls_enabled = true;
        assert!(!grpc.mtls_required());
        grpc.ca_file = Some("/etc/fleet/ca.pem".to_string());
        assert!(grpc.mtls_required());
    }

    #[test]
    fn zero_port_is_rejected() {
        let mut cfg = ControlPlaneConfig::default();
        cfg.grpc.port = 0;
        assert!(cfg.validate().is_err());
    }
}
