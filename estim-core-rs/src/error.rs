//! Error taxonomy for session operations
//!
//! None of these end a session. Each rejection is reported to the
//! connection that caused it as an `error` frame carrying [`SessionError::code`].

use thiserror::Error;

use crate::collaborators::CollaboratorError;

/// Rejection of a client action
#[derive(Debug, Clone, PartialEq, Error)]
pub enum SessionError {
    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("not allowed now: {0}")]
    State(String),

    #[error("not authorized: {0}")]
    Authorization(String),

    #[error("invalid value: {0}")]
    Validation(String),

    #[error("need at least {required} connected voters, have {connected}")]
    Capacity { connected: usize, required: usize },
}

impl SessionError {
    /// Stable code sent to clients
    pub fn code(&self) -> &'static str {
        match self {
            SessionError::Protocol(_) => "PROTOCOL_ERROR",
            SessionError::State(_) => "STATE_ERROR",
            SessionError::Authorization(_) => "AUTHORIZATION_ERROR",
            SessionError::Validation(_) => "VALIDATION_ERROR",
            SessionError::Capacity { .. } => "CAPACITY_ERROR",
        }
    }

    pub(crate) fn state(msg: impl Into<String>) -> Self {
        SessionError::State(msg.into())
    }

    pub(crate) fn validation(msg: impl Into<String>) -> Self {
        SessionError::Validation(msg.into())
    }
}

/// Result type for session operations
pub type SessionResult<T> = Result<T, SessionError>;

/// Why a join was refused by the connection registry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum RejectedReason {
    #[error("session has ended")]
    SessionEnded,

    #[error("name is used by another connected participant")]
    NameTaken,

    #[error("name must not be empty")]
    InvalidName,

    #[error("connection has already joined")]
    AlreadyJoined,

    #[error("connection is not open")]
    UnknownConnection,
}

impl RejectedReason {
    pub fn code(&self) -> &'static str {
        match self {
            RejectedReason::SessionEnded => "SESSION_ENDED",
            RejectedReason::NameTaken => "NAME_TAKEN",
            RejectedReason::InvalidName => "INVALID_NAME",
            RejectedReason::AlreadyJoined => "ALREADY_JOINED",
            RejectedReason::UnknownConnection => "UNKNOWN_CONNECTION",
        }
    }
}

/// Errors building a session from configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid configuration: {0}")]
    Invalid(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON parse error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("task source failed: {0}")]
    TaskSource(#[from] CollaboratorError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        let err = SessionError::Capacity { connected: 2, required: 3 };
        assert_eq!(err.code(), "CAPACITY_ERROR");
        assert_eq!(err.to_string(), "need at least 3 connected voters, have 2");

        assert_eq!(SessionError::state("x").code(), "STATE_ERROR");
        assert_eq!(RejectedReason::NameTaken.code(), "NAME_TAKEN");
    }
}
