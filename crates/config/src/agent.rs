//! Agent runtime configuration (§3 "Configuration" table, Agent-side options).

use serde::{Deserialize, Serialize};
use validator::Validate;

/// Options governing the Agent-side Event Reporter and its connection to
/// the control plane (§3, §4.9).
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct AgentRuntimeConfig {
    /// `host:port` of the control plane's `CommandStream`/`LogStream`
    /// endpoint.
    #[validate(length(min = 1))]
    pub control_plane_addr: String,

    /// Identity this Agent registers under. When unset, the runtime
    /// derives one from the local hostname at startup.
    pub agent_id: Option<String>,

    /// Ring buffer capacity for buffered process events. Default 1000 (§3).
    #[validate(range(min = 1))]
    pub event_cache_size: usize,

    /// Events per flush batch, and the size threshold that triggers an
    /// immediate push while connected. Default 100 (§3, §4.9).
    #[validate(range(min = 1))]
    pub batch_size: usize,

    /// Period of the background flush loop. Default 10s (§3).
    #[validate(range(min = 1))]
    pub flush_interval_secs: u64,

    /// Per-RPC max message size, shared with the control plane's default.
    #[validate(range(min = 1024))]
    pub max_message_size: usize,

    /// Whether to connect to the control plane over TLS (spec §6: "TCP
    /// with optional TLS 1.2+").
    pub tls_enabled: bool,

    /// CA bundle to verify the control plane's certificate against. When
    /// unset under `tls_enabled`, the platform's trust roots are used.
    pub ca_file: Option<String>,
}

impl Default for AgentRuntimeConfig {
    fn default() -> Self {
        Self {
            control_plane_addr: format!("127.0.0.1:{}", fleet_wire::DEFAULT_GRPC_PORT),
            agent_id: None,
            event_cache_size: 1000,
            batch_size: 100,
            flush_interval_secs: 10,
            max_message_size: fleet_wire::DEFAULT_MAX_MESSAGE_SIZE,
            tls_enabled: false,
            ca_file: None,
        }
    }
}

impl AgentRuntimeConfig {
    pub(crate) fn defaults_source() -> config::Config {
        let defaults = Self::default();
        config::Config::builder()
            .set_default("control_plane_addr", defaults.control_plane_addr.clone())
            .unwrap()
            .set_default("event_cache_size", defaults.event_cache_size as i64)
            .unwrap()
            .set_default("batch_size", defaults.batch_size as i64)
            .unwrap()
            .set_default("flush_interval_secs", defaults.flush_interval_secs as i64)
            .unwrap()
            .set_default("max_message_size", defaults.max_message_size as i64)
            .unwrap()
            .set_default("tls_enabled", defaults.tls_enabled)
            .unwrap()
            .build()
            .expect("static defaults always build")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        AgentRuntimeConfig::default().validate().unwrap();
    }

    #[test]
    fn zero_batch_size_is_rejected() {
        let mut cfg = AgentRuntimeConfig::default();
        cfg.batch_size = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn scenario_s4_defaults_match_spec() {
        let cfg = AgentRuntimeConfig::default();
        assert_eq!(cfg.event_cache_size, 1000);
        assert_eq!(cfg.batch_size, 100);
        assert_eq!(cfg.flush_interval_secs, 10);
    }
}
