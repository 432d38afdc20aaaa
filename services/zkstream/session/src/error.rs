//! Client error types.

use std::io;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use zk_wire::{ErrorCode, WireError};

/// Errors surfaced by connections, sessions and the client facade
#[derive(Error, Debug, Clone)]
pub enum ZkError {
    /// Non-OK result code returned by the server
    #[error("{0}")]
    Server(ErrorCode),

    /// Malformed packet or framing violation
    #[error("protocol error: {0}")]
    Protocol(#[from] WireError),

    /// A packet arrived where none was expected (e.g. during the handshake)
    #[error("unexpected packet during handshake")]
    UnexpectedPacket,

    /// Server speaks an incompatible protocol version
    #[error("unsupported protocol version {0}")]
    VersionMismatch(i32),

    /// The connection went away before a reply arrived
    #[error("connection lost")]
    ConnectionLoss,

    /// No ping reply within the liveness window
    #[error("ping timeout after {0:?}")]
    PingTimeout(Duration),

    /// TCP connect did not complete in time
    #[error("connect timeout")]
    ConnectTimeout,

    /// Socket error
    #[error("i/o error: {0}")]
    Io(Arc<io::Error>),

    /// No usable connection for the request
    #[error("not connected")]
    NotConnected,

    /// The session is already binding another connection
    #[error("session attach already in progress")]
    AttachInProgress,

    /// The session has expired
    #[error("session expired")]
    SessionExpired,

    /// Path rejected before it reached the server
    #[error("invalid path: {0}")]
    InvalidPath(String),

    /// Server address could not be parsed
    #[error("invalid server address '{0}'")]
    InvalidAddress(String),

    /// The client has been closed
    #[error("client closed")]
    Closed,
}

impl From<io::Error> for ZkError {
    fn from(err: io::Error) -> Self {
        ZkError::Io(Arc::new(err))
    }
}

impl ZkError {
    /// Closest server result code for this error
    pub fn code(&self) -> ErrorCode {
        match self {
            ZkError::Server(code) => *code,
            ZkError::Protocol(_) | ZkError::UnexpectedPacket | ZkError::VersionMismatch(_) => {
                ErrorCode::MarshallingError
            }
            ZkError::ConnectionLoss
            | ZkError::PingTimeout(_)
            | ZkError::ConnectTimeout
            | ZkError::Io(_)
            | ZkError::NotConnected
            | ZkError::AttachInProgress
            | ZkError::Closed => ErrorCode::ConnectionLoss,
            ZkError::SessionExpired => ErrorCode::SessionExpired,
            ZkError::InvalidPath(_) | ZkError::InvalidAddress(_) => ErrorCode::BadArguments,
        }
    }

    /// Whether the error means the connection, not the request, failed
    pub fn is_connection_error(&self) -> bool {
        matches!(
            self,
            ZkError::ConnectionLoss
                | ZkError::PingTimeout(_)
                | ZkError::ConnectTimeout
                | ZkError::Io(_)
                | ZkError::NotConnected
                | ZkError::Closed
        ) || matches!(self, ZkError::Server(ErrorCode::ConnectionLoss))
    }

    /// Whether the server reported that the node does not exist
    pub fn is_no_node(&self) -> bool {
        matches!(self, ZkError::Server(ErrorCode::NoNode))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_error_display() {
        let err = ZkError::Server(ErrorCode::NodeExists);
        assert!(err.to_string().starts_with("NODE_EXISTS: "));
        assert_eq!(err.code(), ErrorCode::NodeExists);
        assert!(!err.is_connection_error());
    }

    #[test]
    fn test_classification() {
        let io = ZkError::from(io::Error::new(io::ErrorKind::ConnectionReset, "reset"));
        assert!(io.is_connection_error());
        assert_eq!(io.code(), ErrorCode::ConnectionLoss);

        assert!(ZkError::PingTimeout(Duration::from_secs(2)).is_connection_error());
        assert!(!ZkError::Protocol(WireError::BadLength(-1)).is_connection_error());
        assert_eq!(ZkError::SessionExpired.code(), ErrorCode::SessionExpired);
        assert!(ZkError::Server(ErrorCode::NoNode).is_no_node());
    }
}
