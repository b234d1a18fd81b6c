//! Control-plane error kinds (spec.md §7).

use fleet_common::{AgentId, CommandId};
use thiserror::Error;

#[derive(Debug, Error, Clone)]
pub enum ControlPlaneError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("agent {0} is not registered")]
    AgentNotFound(AgentId),

    #[error("agent {0} is not in Streaming state")]
    AgentUnavailable(AgentId),

    #[error("connection for agent {0} was superseded by a newer registration")]
    AgentSuperseded(AgentId),

    #[error("stream for agent {0} failed: {1}")]
    Stream(AgentId, String),

    #[error("command {0} timed out before a terminal response arrived")]
    Timeout(CommandId),

    #[error("internal error: {0}")]
    Internal(String),
}

impl From<ControlPlaneError> for tonic::Status {
    fn from(err: ControlPlaneError) -> Self {
        match err {
            ControlPlaneError::Validation(msg) => tonic::Status::invalid_argument(msg),
            ControlPlaneError::AgentNotFound(id) => {
                tonic::Status::not_found(format!("agent not found, please re-register: {id}"))
            }
            ControlPlaneError::AgentUnavailable(id) => {
                tonic::Status::unavailable(format!("agent {id} is not streaming"))
            }
            ControlPlaneError::AgentSuperseded(id) => {
                tonic::Status::aborted(format!("agent {id} connection superseded"))
            }
            ControlPlaneError::Stream(id, msg) => {
                tonic::Status::unavailable(format!("stream error for agent {id}: {msg}"))
            }
            ControlPlaneError::Timeout(id) => {
                tonic::Status::deadline_exceeded(format!("command {id} timed out"))
            }
            ControlPlaneError::Internal(msg) => tonic::Status::internal(msg),
        }
    }
}
