//! Operational metrics surface (spec.md ambient stack): a small `prometheus`
//! registry tracking the control plane's connection and command-dispatch
//! counters. No scrape endpoint is wired here (that lives in the
//! out-of-scope HTTP facade, spec §6) — the registry is constructed and
//! updated, and left for an external exporter to mount.

use prometheus::{IntCounter, IntGauge, Registry};

/// Collectors shared across the Registry, Dispatcher, and Correlator.
/// Cheap to clone: every field is an `Arc`-backed `prometheus` handle.
#[derive(Clone)]
pub struct OrchestrationMetrics {
    pub registry: Registry,
    /// Agents currently holding an `AgentConnection` record.
    pub connected_agents: IntGauge,
    /// Commands dispatched that have not yet reached a terminal status.
    pub in_flight_commands: IntGauge,
    /// Total commands handed to `CommandDispatcher::dispatch`.
    pub commands_dispatched_total: IntCounter,
    /// Total `CommandResponse` frames processed by the Correlator.
    pub command_responses_total: IntCounter,
}

impl OrchestrationMetrics {
    pub fn new() -> Self {
        let registry = Registry::new_custom(Some("fleet_control_plane".into()), None)
            .expect("metric name prefix is a valid prometheus namespace");

        macro_rules! reg {
            ($metric:expr) => {{
                let collector = $metric;
                registry
                    .register(Box::new(collector.clone()))
                    .expect("metric name is unique within this registry");
                collector
            }};
        }

        Self {
            connected_agents: reg!(IntGauge::new(
                "connected_agents",
                "Number of agents with a live AgentConnection record"
            )
            .unwrap()),
            in_flight_commands: reg!(IntGauge::new(
                "in_flight_commands",
                "Commands dispatched but not yet resolved to a terminal status"
            )
            .unwrap()),
            commands_dispatched_total: reg!(IntCounter::new(
                "commands_dispatched_total",
                "Total commands handed to an agent's outbound stream"
            )
            .unwrap()),
            command_responses_total: reg!(IntCounter::new(
                "command_responses_total",
                "Total CommandResponse frames processed by the correlator"
            )
            .unwrap()),
            registry,
        }
    }
}

impl Default for OrchestrationMetrics {
    fn default() -> Self {
        Self::new()
    }
}
