use std::time::Duration;

use thiserror::Error;

use shmem::ShmemError;

use crate::Role;

pub type ChannelResult<T> = Result<T, ChannelError>;

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("shared memory error: {0}")]
    Shmem(#[from] ShmemError),

    #[error("protocol mismatch: {0}")]
    ProtocolMismatch(String),

    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("connection closed: {reason}")]
    ClosedConnection {
        reason: String,
        #[source]
        cause: Option<ShmemError>,
    },

    #[error("{operation} is not allowed on a {role} channel")]
    IllegalRole { role: Role, operation: &'static str },
}

impl ChannelError {
    pub fn protocol(msg: impl Into<String>) -> Self {
        ChannelError::ProtocolMismatch(msg.into())
    }

    pub fn closed(reason: impl Into<String>) -> Self {
        ChannelError::ClosedConnection {
            reason: reason.into(),
            cause: None,
        }
    }

    /// True when the channel or its segment was destroyed.
    pub fn is_destroyed(&self) -> bool {
        matches!(self, ChannelError::Shmem(err) if err.is_destroyed())
    }

    pub fn is_closed(&self) -> bool {
        matches!(self, ChannelError::ClosedConnection { .. })
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, ChannelError::Timeout(_))
    }

    /// Underlying failure that closed the connection, if any.
    pub fn closed_cause(&self) -> Option<&ShmemError> {
        match self {
            ChannelError::ClosedConnection { cause, .. } => cause.as_ref(),
            _ => None,
        }
    }
}
