//! Wire-level error types.
//!
//! These cover framing and transport failures only. Orchestration-level
//! failures (`AgentNotFoundError`, `AgentUnavailableError`, ...) live in
//! `fleet-control-plane`; handler failures live in `fleet-agent-runtime`.

use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum WireError {
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    #[error("connection closed")]
    ConnectionClosed,

    #[error("protocol version mismatch: expected {expected}, got {actual}")]
    VersionMismatch { expected: u32, actual: u32 },

    #[error("message too large: {size} bytes (max: {max})")]
    MessageTooLarge { size: usize, max: usize },

    #[error("invalid message format: {0}")]
    InvalidMessage(String),

    #[error("timeout after {0:?}")]
    Timeout(Duration),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<WireError> for tonic::Status {
    fn from(err: WireError) -> Self {
        match err {
            WireError::VersionMismatch { .. } | WireError::InvalidMessage(_) => {
                tonic::Status::invalid_argument(err.to_string())
            }
            WireError::MessageTooLarge { .. } => {
                tonic::Status::resource_exhausted(err.to_string())
            }
            WireError::Timeout(_) => tonic::Status::deadline_exceeded(err.to_string()),
            WireError::ConnectionFailed(_) | WireError::ConnectionClosed | WireError::Io(_) => {
                tonic::Status::unavailable(err.to_string())
            }
        }
    }
}
