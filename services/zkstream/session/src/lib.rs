//! Streaming ZooKeeper client: connections, sessions and node watchers.
//!
//! This crate drives the client side of the ZooKeeper protocol over the
//! codec in `zk-wire`. A backend pool keeps a TCP connection to one member
//! of the ensemble, a session driver attaches the session to whichever
//! connection is live, and watchers turn one-shot server watches into
//! continuous per-node event streams.
//!
//! ## Features
//!
//! - **Connections**: handshake, request pipelining, pings sized from the session timeout
//! - **Sessions**: attach, resume after connection loss, expiry, graceful close
//! - **Backend pool**: shuffled round robin, backoff, migration when the server list changes
//! - **Watchers**: created / deleted / data / children streams re-armed across reconnects
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::time::Duration;
//! use zk_session::{Backend, Client, ClientConfig, NodeEvent, WatchKind};
//!
//! # async fn example() -> Result<(), zk_session::ZkError> {
//! let client = Client::connect(ClientConfig::new(vec![Backend::new("127.0.0.1", 2181)]))?;
//! client.wait_connected(Duration::from_secs(10)).await?;
//!
//! let (children, _) = client.list("/").await?;
//! println!("root children: {:?}", children);
//!
//! let watcher = client.watcher("/config")?;
//! let mut changes = watcher.subscribe(WatchKind::DataChanged);
//! while let Some(event) = changes.recv().await {
//!     if let NodeEvent::DataChanged { data, stat } = event {
//!         println!("/config is now {} bytes at version {}", data.len(), stat.version);
//!     }
//! }
//!
//! client.close().await;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod client;
pub mod config;
pub mod connection;
pub mod error;
pub mod pool;
pub mod session;
pub mod transport;
pub mod watch;
pub mod watcher;

#[cfg(test)]
mod testing;

// Re-export main types
pub use client::{validate_path, Client, CreateOptions};
pub use config::{Backend, ClientConfig, RetryPolicy, DEFAULT_PORT};
pub use connection::{
    ping_interval, ping_timeout, ConnId, ConnectionEvent, ConnectionHandle, ConnectionOptions,
    ConnectionState,
};
pub use error::ZkError;
pub use pool::{BackendPool, ConnectionFactory, PoolHandle, TcpConnectionFactory};
pub use session::{is_alive, ClientEvent, SessionSnapshot, SessionState};
pub use watch::{NodeEvent, WatchCategory, WatchEvent, WatchKind, WatchState};
pub use watcher::{Subscription, Watcher};

// Wire types that appear in the client API
pub use zk_wire::{Acl, CreateFlags, ErrorCode, Id, Perms, Stat};
