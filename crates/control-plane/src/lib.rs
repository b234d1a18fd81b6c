//! Agent registry, heartbeat tracking, command dispatch/correlation, and
//! audit persistence for the fleet control plane (spec.md §2).
//!
//! Control flow mirrors the component table: the Wire contract underlies
//! everything; Registry, Heartbeat Tracker, and Host Matcher establish
//! connection state; the Stream Supervisor owns the receive half of each
//! Agent's stream and feeds the Response Correlator; the Command
//! Dispatcher drives the send half and the Audit Writer persists the
//! result of both.

pub mod audit;
pub mod correlator;
pub mod dispatcher;
pub mod errors;
pub mod heartbeat;
pub mod host_matcher;
pub mod metrics;
pub mod registry;
pub mod service;
pub mod supervisor;
mod waiter;

pub use audit::{AuditLogEntry, AuditStore, CommandLogEntry, CommandLogUpdate, InMemoryAuditStore};
pub use dispatcher::CommandDispatcher;
pub use errors::ControlPlaneError;
pub use heartbeat::{HeartbeatTracker, ProcessStartEpoch};
pub use host_matcher::{Host, HostMatcher, HostStore, InMemoryHostStore};
pub use metrics::OrchestrationMetrics;
pub use registry::{AgentConnection, AgentRegistry, ConnectionState};
pub use service::{OrchestrationService, RegistrationConfig};
pub use waiter::CommandOutcome;
