use thiserror::Error;

use crate::state::DaemonState;

#[derive(Debug, Error)]
pub enum ControlError {
    #[error("control: failed to spawn dispatcher thread - {0}")]
    DispatcherSpawn(#[source] std::io::Error),

    #[error("control: dispatcher is closed")]
    DispatcherClosed,

    #[error("control: invalid state transition {from} -> {to}")]
    InvalidTransition { from: DaemonState, to: DaemonState },

    #[error("control: failed to bind session for {caller_id} - {error}")]
    SessionBind {
        caller_id: String,
        error: anyhow::Error,
    },

    #[error(transparent)]
    Controller(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, ControlError>;
