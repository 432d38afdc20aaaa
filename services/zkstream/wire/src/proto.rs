//! Structured payloads carried inside packets.
//!
//! Each record knows how to write itself into and read itself out of a packet
//! body. Both the client and the server direction are implemented so the same
//! types serve the client codec and the in-process test server.

use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

use crate::header::{CreateFlags, KeeperState, NotificationType, OpCode, Perms, PROTOCOL_VERSION};
use crate::jute::{JuteRead, JuteWrite};
use crate::WireError;

/// Handshake request opening or resuming a session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectRequest {
    /// Protocol version (always 0)
    pub protocol_version: i32,
    /// Highest zxid the client has observed
    pub last_zxid_seen: i64,
    /// Requested session timeout in milliseconds
    pub timeout: i32,
    /// Session to resume, or 0 for a new session
    pub session_id: i64,
    /// Session password, opaque to the client
    pub passwd: Bytes,
    /// Whether a read-only server is acceptable
    pub read_only: bool,
}

impl ConnectRequest {
    /// Request for a brand new session
    pub fn new(timeout: i32) -> Self {
        Self {
            protocol_version: PROTOCOL_VERSION,
            last_zxid_seen: 0,
            timeout,
            session_id: 0,
            passwd: Bytes::from_static(&[0u8; 16]),
            read_only: false,
        }
    }

    /// Encode the record
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_i32(self.protocol_version);
        buf.put_i64(self.last_zxid_seen);
        buf.put_i32(self.timeout);
        buf.put_i64(self.session_id);
        buf.write_buffer(&self.passwd);
        buf.write_bool(self.read_only);
    }

    /// Decode the record; the trailing read-only flag is optional
    pub fn decode(buf: &mut Bytes) -> Result<Self, WireError> {
        Ok(Self {
            protocol_version: buf.read_int()?,
            last_zxid_seen: buf.read_long()?,
            timeout: buf.read_int()?,
            session_id: buf.read_long()?,
            passwd: buf.read_buffer()?,
            read_only: if buf.is_empty() { false } else { buf.read_bool()? },
        })
    }
}

/// Handshake reply carrying the negotiated session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectResponse {
    /// Protocol version the server speaks
    pub protocol_version: i32,
    /// Negotiated session timeout in milliseconds
    pub timeout: i32,
    /// Session id; 0 means the server refused to resume
    pub session_id: i64,
    /// Session password to present on reattachment
    pub passwd: Bytes,
    /// Whether the server is in read-only mode
    pub read_only: bool,
}

impl ConnectResponse {
    /// Encode the record
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_i32(self.protocol_version);
        buf.put_i32(self.timeout);
        buf.put_i64(self.session_id);
        buf.write_buffer(&self.passwd);
        buf.write_bool(self.read_only);
    }

    /// Decode the record; the trailing read-only flag is optional
    pub fn decode(buf: &mut Bytes) -> Result<Self, WireError> {
        Ok(Self {
            protocol_version: buf.read_int()?,
            timeout: buf.read_int()?,
            session_id: buf.read_long()?,
            passwd: buf.read_buffer()?,
            read_only: if buf.is_empty() { false } else { buf.read_bool()? },
        })
    }
}

/// Node metadata
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stat {
    /// The zxid of the change that caused this node to be created
    pub czxid: i64,
    /// The zxid of the change that last modified this node
    pub mzxid: i64,
    /// Creation time in milliseconds since epoch
    pub ctime: i64,
    /// Last modification time in milliseconds since epoch
    pub mtime: i64,
    /// Number of changes to the data of this node
    pub version: i32,
    /// Number of changes to the children of this node
    pub cversion: i32,
    /// Number of changes to the ACL of this node
    pub aversion: i32,
    /// Session id of the owner if this is an ephemeral node, else 0
    pub ephemeral_owner: i64,
    /// Length of the data field
    pub data_length: i32,
    /// Number of children
    pub num_children: i32,
    /// The zxid of the change that last modified the children of this node
    pub pzxid: i64,
}

impl Stat {
    /// Encode the record
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_i64(self.czxid);
        buf.put_i64(self.mzxid);
        buf.put_i64(self.ctime);
        buf.put_i64(self.mtime);
        buf.put_i32(self.version);
        buf.put_i32(self.cversion);
        buf.put_i32(self.aversion);
        buf.put_i64(self.ephemeral_owner);
        buf.put_i32(self.data_length);
        buf.put_i32(self.num_children);
        buf.put_i64(self.pzxid);
    }

    /// Decode the record
    pub fn decode(buf: &mut Bytes) -> Result<Self, WireError> {
        Ok(Self {
            czxid: buf.read_long()?,
            mzxid: buf.read_long()?,
            ctime: buf.read_long()?,
            mtime: buf.read_long()?,
            version: buf.read_int()?,
            cversion: buf.read_int()?,
            aversion: buf.read_int()?,
            ephemeral_owner: buf.read_long()?,
            data_length: buf.read_int()?,
            num_children: buf.read_int()?,
            pzxid: buf.read_long()?,
        })
    }
}

/// Authentication identity inside an ACL entry
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Id {
    /// Scheme, e.g. `world` or `digest`
    pub scheme: String,
    /// Identity within the scheme
    pub id: String,
}

/// One ACL entry
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Acl {
    /// Granted permissions
    pub perms: Perms,
    /// Identity the permissions are granted to
    pub id: Id,
}

impl Acl {
    /// `world:anyone` with every permission
    pub fn open_unsafe() -> Self {
        Self {
            perms: Perms::all(),
            id: Id {
                scheme: "world".to_string(),
                id: "anyone".to_string(),
            },
        }
    }

    fn encode(&self, buf: &mut BytesMut) {
        buf.put_i32(self.perms.bits());
        buf.write_ustring(&self.id.scheme);
        buf.write_ustring(&self.id.id);
    }

    fn decode(buf: &mut Bytes) -> Result<Self, WireError> {
        Ok(Self {
            perms: Perms::from_bits_retain(buf.read_int()?),
            id: Id {
                scheme: buf.read_ustring()?,
                id: buf.read_ustring()?,
            },
        })
    }
}

fn encode_acl_vec(buf: &mut BytesMut, acl: &[Acl]) {
    buf.put_i32(acl.len() as i32);
    for entry in acl {
        entry.encode(buf);
    }
}

fn decode_acl_vec(buf: &mut Bytes) -> Result<Vec<Acl>, WireError> {
    let count = buf.read_int()?;
    (0..count.max(0)).map(|_| Acl::decode(buf)).collect()
}

/// Watches to re-register on a fresh connection
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SetWatches {
    /// Server fires any watch whose condition changed after this zxid
    pub relative_zxid: i64,
    /// Paths with data watches
    pub data_watches: Vec<String>,
    /// Paths with existence watches
    pub exist_watches: Vec<String>,
    /// Paths with child watches
    pub child_watches: Vec<String>,
}

impl SetWatches {
    /// Total number of watched paths
    pub fn len(&self) -> usize {
        self.data_watches.len() + self.exist_watches.len() + self.child_watches.len()
    }

    /// Whether no watch is listed
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Body of a watch notification
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatcherEvent {
    /// What happened
    pub event_type: NotificationType,
    /// Connection state at the server
    pub state: KeeperState,
    /// Node the watch was set on
    pub path: String,
}

impl WatcherEvent {
    /// Encode the record
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_i32(self.event_type as i32);
        buf.put_i32(self.state as i32);
        buf.write_ustring(&self.path);
    }

    /// Decode the record
    pub fn decode(buf: &mut Bytes) -> Result<Self, WireError> {
        Ok(Self {
            event_type: NotificationType::try_from(buf.read_int()?)?,
            state: KeeperState::try_from(buf.read_int()?)?,
            path: buf.read_ustring()?,
        })
    }
}

/// Steady-state request body
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    /// Create a node
    Create {
        /// Node path
        path: String,
        /// Initial data
        data: Bytes,
        /// Initial ACL
        acl: Vec<Acl>,
        /// Creation mode
        flags: CreateFlags,
    },
    /// Delete a node
    Delete {
        /// Node path
        path: String,
        /// Expected version, -1 for any
        version: i32,
    },
    /// Stat a node
    Exists {
        /// Node path
        path: String,
        /// Leave a watch
        watch: bool,
    },
    /// Read node data
    GetData {
        /// Node path
        path: String,
        /// Leave a watch
        watch: bool,
    },
    /// Write node data
    SetData {
        /// Node path
        path: String,
        /// New data
        data: Bytes,
        /// Expected version, -1 for any
        version: i32,
    },
    /// Read node ACL
    GetAcl {
        /// Node path
        path: String,
    },
    /// List children
    GetChildren {
        /// Node path
        path: String,
        /// Leave a watch
        watch: bool,
    },
    /// List children with stat
    GetChildren2 {
        /// Node path
        path: String,
        /// Leave a watch
        watch: bool,
    },
    /// Sync a path with the leader
    Sync {
        /// Node path
        path: String,
    },
    /// Keepalive
    Ping,
    /// Re-register watches
    SetWatches(SetWatches),
    /// Close the session
    CloseSession,
}

impl Request {
    /// Opcode that goes into the request header
    pub fn opcode(&self) -> OpCode {
        match self {
            Request::Create { .. } => OpCode::Create,
            Request::Delete { .. } => OpCode::Delete,
            Request::Exists { .. } => OpCode::Exists,
            Request::GetData { .. } => OpCode::GetData,
            Request::SetData { .. } => OpCode::SetData,
            Request::GetAcl { .. } => OpCode::GetAcl,
            Request::GetChildren { .. } => OpCode::GetChildren,
            Request::GetChildren2 { .. } => OpCode::GetChildren2,
            Request::Sync { .. } => OpCode::Sync,
            Request::Ping => OpCode::Ping,
            Request::SetWatches(_) => OpCode::SetWatches,
            Request::CloseSession => OpCode::CloseSession,
        }
    }

    /// Path the request targets, if any
    pub fn path(&self) -> Option<&str> {
        match self {
            Request::Create { path, .. }
            | Request::Delete { path, .. }
            | Request::Exists { path, .. }
            | Request::GetData { path, .. }
            | Request::SetData { path, .. }
            | Request::GetAcl { path }
            | Request::GetChildren { path, .. }
            | Request::GetChildren2 { path, .. }
            | Request::Sync { path } => Some(path),
            Request::Ping | Request::SetWatches(_) | Request::CloseSession => None,
        }
    }

    /// Encode the body (without header)
    pub fn encode(&self, buf: &mut BytesMut) {
        match self {
            Request::Create {
                path,
                data,
                acl,
                flags,
            } => {
                buf.write_ustring(path);
                buf.write_buffer(data);
                encode_acl_vec(buf, acl);
                buf.put_i32(flags.bits());
            }
            Request::Delete { path, version } => {
                buf.write_ustring(path);
                buf.put_i32(*version);
            }
            Request::Exists { path, watch }
            | Request::GetData { path, watch }
            | Request::GetChildren { path, watch }
            | Request::GetChildren2 { path, watch } => {
                buf.write_ustring(path);
                buf.write_bool(*watch);
            }
            Request::SetData {
                path,
                data,
                version,
            } => {
                buf.write_ustring(path);
                buf.write_buffer(data);
                buf.put_i32(*version);
            }
            Request::GetAcl { path } | Request::Sync { path } => {
                buf.write_ustring(path);
            }
            Request::SetWatches(watches) => {
                buf.put_i64(watches.relative_zxid);
                buf.write_string_vec(&watches.data_watches);
                buf.write_string_vec(&watches.exist_watches);
                buf.write_string_vec(&watches.child_watches);
            }
            Request::Ping | Request::CloseSession => {}
        }
    }

    /// Decode a body whose opcode has already been read from the header
    pub fn decode(opcode: OpCode, buf: &mut Bytes) -> Result<Self, WireError> {
        let request = match opcode {
            OpCode::Create => Request::Create {
                path: buf.read_ustring()?,
                data: buf.read_buffer()?,
                acl: decode_acl_vec(buf)?,
                flags: CreateFlags::from_bits_retain(buf.read_int()?),
            },
            OpCode::Delete => Request::Delete {
                path: buf.read_ustring()?,
                version: buf.read_int()?,
            },
            OpCode::Exists => Request::Exists {
                path: buf.read_ustring()?,
                watch: buf.read_bool()?,
            },
            OpCode::GetData => Request::GetData {
                path: buf.read_ustring()?,
                watch: buf.read_bool()?,
            },
            OpCode::SetData => Request::SetData {
                path: buf.read_ustring()?,
                data: buf.read_buffer()?,
                version: buf.read_int()?,
            },
            OpCode::GetAcl => Request::GetAcl {
                path: buf.read_ustring()?,
            },
            OpCode::GetChildren => Request::GetChildren {
                path: buf.read_ustring()?,
                watch: buf.read_bool()?,
            },
            OpCode::GetChildren2 => Request::GetChildren2 {
                path: buf.read_ustring()?,
                watch: buf.read_bool()?,
            },
            OpCode::Sync => Request::Sync {
                path: buf.read_ustring()?,
            },
            OpCode::Ping => Request::Ping,
            OpCode::SetWatches => Request::SetWatches(SetWatches {
                relative_zxid: buf.read_long()?,
                data_watches: buf.read_string_vec()?,
                exist_watches: buf.read_string_vec()?,
                child_watches: buf.read_string_vec()?,
            }),
            OpCode::CloseSession => Request::CloseSession,
            other => return Err(WireError::Unsupported(other as i32)),
        };
        Ok(request)
    }
}

/// Steady-state reply body for a successful request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    /// Path actually created (differs from the request for sequential nodes)
    Create {
        /// Created path
        path: String,
    },
    /// Stat of an existing node
    Exists {
        /// Node stat
        stat: Stat,
    },
    /// Node data
    GetData {
        /// Data
        data: Bytes,
        /// Node stat
        stat: Stat,
    },
    /// Stat after a write
    SetData {
        /// Node stat
        stat: Stat,
    },
    /// Node ACL
    GetAcl {
        /// ACL entries
        acl: Vec<Acl>,
        /// Node stat
        stat: Stat,
    },
    /// Children names
    GetChildren {
        /// Children
        children: Vec<String>,
    },
    /// Children names with the parent's stat
    GetChildren2 {
        /// Children
        children: Vec<String>,
        /// Parent stat
        stat: Stat,
    },
    /// Reply without a body (delete, sync, ping, set-watches, close)
    Empty,
}

impl Response {
    /// Encode the body (without header)
    pub fn encode(&self, buf: &mut BytesMut) {
        match self {
            Response::Create { path } => buf.write_ustring(path),
            Response::Exists { stat } | Response::SetData { stat } => stat.encode(buf),
            Response::GetData { data, stat } => {
                buf.write_buffer(data);
                stat.encode(buf);
            }
            Response::GetAcl { acl, stat } => {
                encode_acl_vec(buf, acl);
                stat.encode(buf);
            }
            Response::GetChildren { children } => buf.write_string_vec(children),
            Response::GetChildren2 { children, stat } => {
                buf.write_string_vec(children);
                stat.encode(buf);
            }
            Response::Empty => {}
        }
    }

    /// Decode the body of a successful reply to `opcode`
    pub fn decode(opcode: OpCode, buf: &mut Bytes) -> Result<Self, WireError> {
        let response = match opcode {
            OpCode::Create => Response::Create {
                path: buf.read_ustring()?,
            },
            OpCode::Exists => Response::Exists {
                stat: Stat::decode(buf)?,
            },
            OpCode::GetData => Response::GetData {
                data: buf.read_buffer()?,
                stat: Stat::decode(buf)?,
            },
            OpCode::SetData => Response::SetData {
                stat: Stat::decode(buf)?,
            },
            OpCode::GetAcl => Response::GetAcl {
                acl: decode_acl_vec(buf)?,
                stat: Stat::decode(buf)?,
            },
            OpCode::GetChildren => Response::GetChildren {
                children: buf.read_string_vec()?,
            },
            OpCode::GetChildren2 => Response::GetChildren2 {
                children: buf.read_string_vec()?,
                stat: Stat::decode(buf)?,
            },
            OpCode::Delete
            | OpCode::Sync
            | OpCode::Ping
            | OpCode::SetWatches
            | OpCode::CloseSession
            | OpCode::Auth => Response::Empty,
            other => return Err(WireError::Unsupported(other as i32)),
        };
        Ok(response)
    }
}
