//! Wire protocol error types.

use thiserror::Error;

/// Wire protocol errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WireError {
    /// Frame length prefix outside the accepted range
    #[error("invalid packet length {0}")]
    BadLength(i64),

    /// Size limit exceeded while encoding
    #[error("size limit exceeded: {0}")]
    Size(usize),

    /// Payload ended before a field could be read
    #[error("truncated payload: needed {needed} bytes, {remaining} remaining")]
    Truncated {
        /// Bytes required by the field being read
        needed: usize,
        /// Bytes left in the payload
        remaining: usize,
    },

    /// String field is not valid UTF-8
    #[error("invalid utf-8 in string field")]
    Utf8,

    /// Unknown opcode
    #[error("unknown opcode {0}")]
    OpCode(i32),

    /// Unknown error code
    #[error("unknown error code {0}")]
    Code(i32),

    /// Unknown notification type
    #[error("unknown notification type {0}")]
    NotificationType(i32),

    /// Unknown keeper state
    #[error("unknown keeper state {0}")]
    KeeperState(i32),

    /// Reply xid does not belong to any outstanding request
    #[error("reply xid {0} does not match any outstanding request")]
    UnmatchedXid(i32),

    /// Operation not valid in the codec's current phase
    #[error("{0} is not valid in the current codec phase")]
    Phase(&'static str),

    /// Opcode has no payload encoding in this codec
    #[error("opcode {0} is not supported")]
    Unsupported(i32),
}
