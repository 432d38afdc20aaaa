//! Packet headers and protocol enumerations.
//!
//! Steady-state requests start with `(xid, opcode)`; replies start with
//! `(xid, zxid, err)`. The opcode is never echoed back, so replies are decoded
//! using the opcode the codec remembered for the xid.

use bitflags::bitflags;
use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::jute::JuteRead;
use crate::WireError;

/// Protocol version sent in connect requests
pub const PROTOCOL_VERSION: i32 = 0;

/// Reserved xid carried by watch notifications
pub const XID_NOTIFICATION: i32 = -1;
/// Reserved xid for pings
pub const XID_PING: i32 = -2;
/// Reserved xid for authentication packets
pub const XID_AUTH: i32 = -4;
/// Reserved xid for watch re-registration
pub const XID_SET_WATCHES: i32 = -8;

/// Request opcodes
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OpCode {
    /// Watch notification (server to client only)
    Notification = 0,
    /// Create a node
    Create = 1,
    /// Delete a node
    Delete = 2,
    /// Stat a node, optionally leaving a watch
    Exists = 3,
    /// Read node data
    GetData = 4,
    /// Write node data
    SetData = 5,
    /// Read node ACL
    GetAcl = 6,
    /// Write node ACL
    SetAcl = 7,
    /// List children
    GetChildren = 8,
    /// Flush the leader channel for a path
    Sync = 9,
    /// Keepalive
    Ping = 11,
    /// List children with the parent's stat
    GetChildren2 = 12,
    /// Version check (multi only)
    Check = 13,
    /// Multi-op transaction
    Multi = 14,
    /// Add authentication info
    Auth = 100,
    /// Re-register watches after reconnect
    SetWatches = 101,
    /// SASL exchange
    Sasl = 102,
    /// Session creation (server internal)
    CreateSession = -10,
    /// Close the session
    CloseSession = -11,
    /// Error marker used inside multi replies
    ErrorResult = -1,
}

impl TryFrom<i32> for OpCode {
    type Error = WireError;

    fn try_from(value: i32) -> Result<Self, WireError> {
        match value {
            0 => Ok(OpCode::Notification),
            1 => Ok(OpCode::Create),
            2 => Ok(OpCode::Delete),
            3 => Ok(OpCode::Exists),
            4 => Ok(OpCode::GetData),
            5 => Ok(OpCode::SetData),
            6 => Ok(OpCode::GetAcl),
            7 => Ok(OpCode::SetAcl),
            8 => Ok(OpCode::GetChildren),
            9 => Ok(OpCode::Sync),
            11 => Ok(OpCode::Ping),
            12 => Ok(OpCode::GetChildren2),
            13 => Ok(OpCode::Check),
            14 => Ok(OpCode::Multi),
            100 => Ok(OpCode::Auth),
            101 => Ok(OpCode::SetWatches),
            102 => Ok(OpCode::Sasl),
            -10 => Ok(OpCode::CreateSession),
            -11 => Ok(OpCode::CloseSession),
            -1 => Ok(OpCode::ErrorResult),
            _ => Err(WireError::OpCode(value)),
        }
    }
}

/// Result codes carried in reply headers
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorCode {
    /// Everything is OK
    Ok = 0,
    /// Internal server error
    SystemError = -1,
    /// A runtime inconsistency was found
    RuntimeInconsistency = -2,
    /// A data inconsistency was found
    DataInconsistency = -3,
    /// Connection to the server has been lost
    ConnectionLoss = -4,
    /// Error while marshalling or unmarshalling data
    MarshallingError = -5,
    /// Operation is unimplemented
    Unimplemented = -6,
    /// Operation timeout
    OperationTimeout = -7,
    /// Invalid arguments
    BadArguments = -8,
    /// API error
    ApiError = -100,
    /// Node does not exist
    NoNode = -101,
    /// Not authenticated
    NoAuth = -102,
    /// Version conflict
    BadVersion = -103,
    /// Ephemeral nodes may not have children
    NoChildrenForEphemerals = -108,
    /// The node already exists
    NodeExists = -110,
    /// The node has children
    NotEmpty = -111,
    /// The session has been expired by the server
    SessionExpired = -112,
    /// Invalid callback specified
    InvalidCallback = -113,
    /// Invalid ACL specified
    InvalidAcl = -114,
    /// Client authentication failed
    AuthFailed = -115,
}

impl TryFrom<i32> for ErrorCode {
    type Error = WireError;

    fn try_from(value: i32) -> Result<Self, WireError> {
        match value {
            0 => Ok(ErrorCode::Ok),
            -1 => Ok(ErrorCode::SystemError),
            -2 => Ok(ErrorCode::RuntimeInconsistency),
            -3 => Ok(ErrorCode::DataInconsistency),
            -4 => Ok(ErrorCode::ConnectionLoss),
            -5 => Ok(ErrorCode::MarshallingError),
            -6 => Ok(ErrorCode::Unimplemented),
            -7 => Ok(ErrorCode::OperationTimeout),
            -8 => Ok(ErrorCode::BadArguments),
            -100 => Ok(ErrorCode::ApiError),
            -101 => Ok(ErrorCode::NoNode),
            -102 => Ok(ErrorCode::NoAuth),
            -103 => Ok(ErrorCode::BadVersion),
            -108 => Ok(ErrorCode::NoChildrenForEphemerals),
            -110 => Ok(ErrorCode::NodeExists),
            -111 => Ok(ErrorCode::NotEmpty),
            -112 => Ok(ErrorCode::SessionExpired),
            -113 => Ok(ErrorCode::InvalidCallback),
            -114 => Ok(ErrorCode::InvalidAcl),
            -115 => Ok(ErrorCode::AuthFailed),
            _ => Err(WireError::Code(value)),
        }
    }
}

impl ErrorCode {
    /// Numeric wire value
    pub fn code(self) -> i32 {
        self as i32
    }

    /// Symbolic name as used by the reference clients
    pub fn name(self) -> &'static str {
        match self {
            ErrorCode::Ok => "OK",
            ErrorCode::SystemError => "SYSTEM_ERROR",
            ErrorCode::RuntimeInconsistency => "RUNTIME_INCONSISTENCY",
            ErrorCode::DataInconsistency => "DATA_INCONSISTENCY",
            ErrorCode::ConnectionLoss => "CONNECTION_LOSS",
            ErrorCode::MarshallingError => "MARSHALLING_ERROR",
            ErrorCode::Unimplemented => "UNIMPLEMENTED",
            ErrorCode::OperationTimeout => "OPERATION_TIMEOUT",
            ErrorCode::BadArguments => "BAD_ARGUMENTS",
            ErrorCode::ApiError => "API_ERROR",
            ErrorCode::NoNode => "NO_NODE",
            ErrorCode::NoAuth => "NO_AUTH",
            ErrorCode::BadVersion => "BAD_VERSION",
            ErrorCode::NoChildrenForEphemerals => "NO_CHILDREN_FOR_EPHEMERALS",
            ErrorCode::NodeExists => "NODE_EXISTS",
            ErrorCode::NotEmpty => "NOT_EMPTY",
            ErrorCode::SessionExpired => "SESSION_EXPIRED",
            ErrorCode::InvalidCallback => "INVALID_CALLBACK",
            ErrorCode::InvalidAcl => "INVALID_ACL",
            ErrorCode::AuthFailed => "AUTH_FAILED",
        }
    }

    /// Human-readable description
    pub fn message(self) -> &'static str {
        match self {
            ErrorCode::Ok => "Everything is OK",
            ErrorCode::SystemError => "An internal error occurred in the ZooKeeper server",
            ErrorCode::RuntimeInconsistency => "A runtime inconsistency was found",
            ErrorCode::DataInconsistency => "A data inconsistency was found",
            ErrorCode::ConnectionLoss => "Connection to the ZooKeeper server has been lost",
            ErrorCode::MarshallingError => "Error while marshalling or unmarshalling data",
            ErrorCode::Unimplemented => "Operation is unimplemented",
            ErrorCode::OperationTimeout => "Operation timeout",
            ErrorCode::BadArguments => "Invalid arguments",
            ErrorCode::ApiError => "API error",
            ErrorCode::NoNode => "The specified ZooKeeper path does not exist",
            ErrorCode::NoAuth => "Not authenticated",
            ErrorCode::BadVersion => {
                "A specific version of an object was named in the request, but this was \
                 not the latest version on the server. The object may have been changed \
                 by another client."
            }
            ErrorCode::NoChildrenForEphemerals => "Ephemeral nodes may not have children",
            ErrorCode::NodeExists => {
                "The specified ZooKeeper path already exists, and the requested operation \
                 requires creating a new node"
            }
            ErrorCode::NotEmpty => {
                "The specified ZooKeeper node has children and thus cannot be destroyed"
            }
            ErrorCode::SessionExpired => "ZooKeeper session expired",
            ErrorCode::InvalidCallback => "Invalid callback specified",
            ErrorCode::InvalidAcl => "Invalid ACL specified",
            ErrorCode::AuthFailed => "Client authentication failed",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.name(), self.message())
    }
}

/// Watch notification types
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NotificationType {
    /// Node was created
    Created = 1,
    /// Node was deleted
    Deleted = 2,
    /// Node data changed
    DataChanged = 3,
    /// Node children changed
    ChildrenChanged = 4,
}

impl TryFrom<i32> for NotificationType {
    type Error = WireError;

    fn try_from(value: i32) -> Result<Self, WireError> {
        match value {
            1 => Ok(NotificationType::Created),
            2 => Ok(NotificationType::Deleted),
            3 => Ok(NotificationType::DataChanged),
            4 => Ok(NotificationType::ChildrenChanged),
            _ => Err(WireError::NotificationType(value)),
        }
    }
}

/// Connection state carried in watch notifications
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum KeeperState {
    /// Client is disconnected
    Disconnected = 0,
    /// Client is connected
    SyncConnected = 3,
    /// Authentication failed
    AuthFailed = 4,
    /// Connected to a read-only server
    ConnectedReadOnly = 5,
    /// SASL authentication succeeded
    SaslAuthenticated = 6,
    /// Session expired
    Expired = -112,
}

impl TryFrom<i32> for KeeperState {
    type Error = WireError;

    fn try_from(value: i32) -> Result<Self, WireError> {
        match value {
            0 => Ok(KeeperState::Disconnected),
            3 => Ok(KeeperState::SyncConnected),
            4 => Ok(KeeperState::AuthFailed),
            5 => Ok(KeeperState::ConnectedReadOnly),
            6 => Ok(KeeperState::SaslAuthenticated),
            -112 => Ok(KeeperState::Expired),
            _ => Err(WireError::KeeperState(value)),
        }
    }
}

bitflags! {
    /// Node creation mode flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
    pub struct CreateFlags: i32 {
        /// Node is removed when the owning session ends
        const EPHEMERAL = 1 << 0;
        /// Server appends a monotonically increasing counter to the name
        const SEQUENTIAL = 1 << 1;
    }
}

bitflags! {
    /// ACL permission bits
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct Perms: i32 {
        /// Read data and list children
        const READ = 1 << 0;
        /// Write data
        const WRITE = 1 << 1;
        /// Create children
        const CREATE = 1 << 2;
        /// Delete children
        const DELETE = 1 << 3;
        /// Set ACLs
        const ADMIN = 1 << 4;
    }
}

/// Header preceding every steady-state request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestHeader {
    /// Client-assigned transaction id
    pub xid: i32,
    /// Operation
    pub opcode: OpCode,
}

impl RequestHeader {
    /// Encode the header
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_i32(self.xid);
        buf.put_i32(self.opcode as i32);
    }

    /// Decode the header
    pub fn decode(buf: &mut Bytes) -> Result<Self, WireError> {
        let xid = buf.read_int()?;
        let opcode = OpCode::try_from(buf.read_int()?)?;
        Ok(Self { xid, opcode })
    }
}

/// Header preceding every steady-state reply
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReplyHeader {
    /// Transaction id of the request this answers
    pub xid: i32,
    /// Last zxid the server had seen when producing this reply
    pub zxid: i64,
    /// Result code
    pub err: ErrorCode,
}

impl ReplyHeader {
    /// Encode the header
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_i32(self.xid);
        buf.put_i64(self.zxid);
        buf.put_i32(self.err.code());
    }

    /// Decode the header
    pub fn decode(buf: &mut Bytes) -> Result<Self, WireError> {
        let xid = buf.read_int()?;
        let zxid = buf.read_long()?;
        let err = ErrorCode::try_from(buf.read_int()?)?;
        Ok(Self { xid, zxid, err })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_opcode_conversion() {
        assert_eq!(OpCode::try_from(12).unwrap(), OpCode::GetChildren2);
        assert_eq!(OpCode::try_from(-11).unwrap(), OpCode::CloseSession);
        assert_eq!(OpCode::try_from(10), Err(WireError::OpCode(10)));
    }

    #[test]
    fn test_error_code_table() {
        let code = ErrorCode::try_from(-101).unwrap();
        assert_eq!(code, ErrorCode::NoNode);
        assert_eq!(code.name(), "NO_NODE");
        assert_eq!(
            code.to_string(),
            "NO_NODE: The specified ZooKeeper path does not exist"
        );
        assert_eq!(ErrorCode::NodeExists.code(), -110);
        assert_eq!(ErrorCode::try_from(-999), Err(WireError::Code(-999)));
    }

    #[test]
    fn test_reply_header() {
        let header = ReplyHeader {
            xid: 1,
            zxid: 0x517,
            err: ErrorCode::Ok,
        };
        let mut buf = BytesMut::new();
        header.encode(&mut buf);
        assert_eq!(
            &buf[..],
            &[0, 0, 0, 1, 0, 0, 0, 0, 0, 0, 0x05, 0x17, 0, 0, 0, 0]
        );
        assert_eq!(ReplyHeader::decode(&mut buf.freeze()).unwrap(), header);
    }

    #[test]
    fn test_flags() {
        let flags = CreateFlags::EPHEMERAL | CreateFlags::SEQUENTIAL;
        assert_eq!(flags.bits(), 3);
        assert_eq!(Perms::all().bits(), 31);
    }
}
