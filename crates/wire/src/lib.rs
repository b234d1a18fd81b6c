//! Wire contract between fleet Agents and the control-plane orchestrator.
//!
//! This crate owns the generated gRPC/protobuf types (`pb`), a set of
//! plain Rust mirrors that are friendlier to work with away from the RPC
//! boundary (`messages`), and a length-delimited binary frame primitive
//! for payloads that move outside an RPC body (`framing`).

pub mod errors;
pub mod framing;
pub mod messages;

/// Generated protobuf/tonic types for `fleet.orchestration.v1`.
pub mod pb {
    tonic::include_proto!("fleet.orchestration.v1");
}

pub use errors::WireError;
pub use messages::*;

/// Wire protocol version advertised at registration time.
pub const PROTOCOL_VERSION: u32 = 1;

/// Default frame size limit per §6 ("Per-message size default 16 MB").
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

/// Default gRPC bind port per §6.
pub const DEFAULT_GRPC_PORT: u16 = 9000;
