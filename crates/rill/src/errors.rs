use crate::id::{ActorId, AppId, NodeId, PortId};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Abstract outcome of a runtime operation, carried on every completion
/// signal and across the wire. The numeric codes follow the control
/// protocol convention.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ResponseStatus {
    Ok,
    Created,
    BadRequest,
    Unauthorized,
    NotFound,
    Conflict,
    InternalError,
    ServiceUnavailable,
}

impl ResponseStatus {
    pub fn code(&self) -> u16 {
        match self {
            Self::Ok => 200,
            Self::Created => 201,
            Self::BadRequest => 400,
            Self::Unauthorized => 401,
            Self::NotFound => 404,
            Self::Conflict => 409,
            Self::InternalError => 500,
            Self::ServiceUnavailable => 503,
        }
    }

    /// True for the success outcomes (OK, CREATED)
    pub fn is_ok(&self) -> bool {
        matches!(self, Self::Ok | Self::Created)
    }
}

impl fmt::Display for ResponseStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ok => write!(f, "OK"),
            Self::Created => write!(f, "CREATED"),
            Self::BadRequest => write!(f, "BAD_REQUEST"),
            Self::Unauthorized => write!(f, "UNAUTHORIZED"),
            Self::NotFound => write!(f, "NOT_FOUND"),
            Self::Conflict => write!(f, "CONFLICT"),
            Self::InternalError => write!(f, "INTERNAL_ERROR"),
            Self::ServiceUnavailable => write!(f, "SERVICE_UNAVAILABLE"),
        }
    }
}

/// Error conditions inside the runtime core. Every error converts to a
/// `ResponseStatus` at the call boundary, so one operation's fault cannot
/// leak an unclassified failure to a caller.
#[derive(Error, Debug)]
pub enum RuntimeError {
    #[error("actor not found: {0}")]
    ActorNotFound(ActorId),

    #[error("port not found: {0}")]
    PortNotFound(String),

    #[error("node not found: {0}")]
    NodeNotFound(NodeId),

    #[error("application not found: {0}")]
    AppNotFound(AppId),

    #[error("migration already in flight for actor {0}")]
    MigrationInFlight(ActorId),

    #[error("incompatible port directions: {0}")]
    DirectionMismatch(String),

    #[error("port {0} does not accept another peer")]
    PeerLimit(PortId),

    #[error("tunnel to node {0} is not up")]
    TunnelDown(NodeId),

    #[error("invalid snapshot: {0}")]
    InvalidSnapshot(String),

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("unauthorized")]
    Unauthorized,

    #[error("request timed out")]
    Timeout,

    #[error("channel closed: {0}")]
    ChannelClosed(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

impl RuntimeError {
    /// Map the error to the status reported to callers.
    pub fn status(&self) -> ResponseStatus {
        match self {
            Self::ActorNotFound(_)
            | Self::PortNotFound(_)
            | Self::NodeNotFound(_)
            | Self::AppNotFound(_) => ResponseStatus::NotFound,
            Self::MigrationInFlight(_) | Self::Timeout | Self::TunnelDown(_) => {
                ResponseStatus::ServiceUnavailable
            }
            Self::PeerLimit(_) => ResponseStatus::Conflict,
            Self::DirectionMismatch(_)
            | Self::InvalidSnapshot(_)
            | Self::BadRequest(_) => ResponseStatus::BadRequest,
            Self::Unauthorized => ResponseStatus::Unauthorized,
            Self::ChannelClosed(_) | Self::Serialization(_) | Self::Io(_) | Self::Internal(_) => {
                ResponseStatus::InternalError
            }
        }
    }
}

impl From<serde_json::Error> for RuntimeError {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}

impl From<tokio::sync::oneshot::error::RecvError> for RuntimeError {
    fn from(e: tokio::sync::oneshot::error::RecvError) -> Self {
        Self::ChannelClosed(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes() {
        assert_eq!(ResponseStatus::Ok.code(), 200);
        assert_eq!(ResponseStatus::ServiceUnavailable.code(), 503);
        assert!(ResponseStatus::Created.is_ok());
        assert!(!ResponseStatus::NotFound.is_ok());
    }

    #[test]
    fn test_error_to_status() {
        let e = RuntimeError::MigrationInFlight(ActorId::generate());
        assert_eq!(e.status(), ResponseStatus::ServiceUnavailable);
        let e = RuntimeError::DirectionMismatch("in/in".into());
        assert_eq!(e.status(), ResponseStatus::BadRequest);
        let e = RuntimeError::PeerLimit(PortId::generate());
        assert_eq!(e.status(), ResponseStatus::Conflict);
        let e = RuntimeError::Internal("boom".into());
        assert_eq!(e.status(), ResponseStatus::InternalError);
    }
}
