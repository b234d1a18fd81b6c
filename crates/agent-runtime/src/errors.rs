//! Agent-runtime error kinds (spec.md §7: `HandlerError`, plus the
//! connection-level failures the control-plane errors table doesn't
//! cover because they never cross the wire).

use thiserror::Error;

#[derive(Debug, Error)]
pub enum AgentRuntimeError {
    #[error("no handler registered for command type {0:?}")]
    UnknownCommandType(String),

    #[error("handler for {command_type:?} failed: {message}")]
    HandlerError {
        command_type: String,
        message: String,
    },

    #[error("control plane rejected registration: {0}")]
    RegistrationRejected(String),

    #[error("control plane is unreachable: {0}")]
    Transport(#[from] tonic::transport::Error),

    #[error("rpc failed: {0}")]
    Rpc(#[from] tonic::Status),
}

impl AgentRuntimeError {
    pub fn handler(command_type: impl Into<String>, message: impl Into<String>) -> Self {
        Self::HandlerError {
            command_type: command_type.into(),
            message: message.into(),
        }
    }
}
