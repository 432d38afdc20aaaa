//! ZooKeeper wire protocol: framing, jute marshalling and packet codecs.
//!
//! This crate provides the low-level protocol layer used by the session crate.
//! It knows nothing about sockets or timers; it turns bytes into typed packets
//! and back.
//!
//! ## Features
//!
//! - **Length-Prefixed Framing**: strict `int32` length checks with a 16 MiB ceiling
//! - **Zero-Copy I/O**: Uses `Bytes`/`BytesMut` for minimal allocations
//! - **Phase-Aware Codec**: handshake and steady-state packets share one decoder
//! - **Reply Correlation**: xid→opcode tracking selects the reply shape
//! - **Server Mirror**: the same payload types encode server-side packets for tests
//!
//! ## Wire Format
//!
//! ```text
//! +----------------------+------------------------------------+
//! | i32 length           | length of bytes that follow        |
//! +----------------------+------------------------------------+
//! | request:  xid, op    | i32, i32                           |
//! | reply:    xid, zxid, | i32, i64, i32                      |
//! |           err        |                                    |
//! +----------------------+------------------------------------+
//! | body                 | opcode-specific jute record        |
//! +----------------------+------------------------------------+
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod codec;
pub mod error;
pub mod frame;
pub mod header;
pub mod jute;
pub mod proto;

// Re-export main types
pub use codec::{ClientCodec, Inbound, Phase, Reply, ServerCodec, ServerInbound};
pub use error::WireError;
pub use frame::{encode_frame, FrameDecoder, LENGTH_PREFIX_SIZE, MAX_PACKET_SIZE};
pub use header::{
    CreateFlags, ErrorCode, KeeperState, NotificationType, OpCode, Perms, ReplyHeader,
    RequestHeader, PROTOCOL_VERSION, XID_AUTH, XID_NOTIFICATION, XID_PING, XID_SET_WATCHES,
};
pub use proto::{
    Acl, ConnectRequest, ConnectResponse, Id, Request, Response, SetWatches, Stat, WatcherEvent,
};
