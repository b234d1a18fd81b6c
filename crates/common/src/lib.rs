//! Shared identifier types for the fleet orchestration core.
//!
//! Kept deliberately small: everything domain-specific (message shapes,
//! error kinds, store traits) lives closer to the crate that owns it.

pub mod ids;

pub use ids::{AgentId, CommandId, CorrelationId, HostId};
