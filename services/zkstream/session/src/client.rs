//! Client facade.
//!
//! Every operation resolves the session's current connection and sends one
//! request on it. There is no queueing across reconnects: without an
//! attached, connected connection requests fail with `NotConnected`.

use bytes::Bytes;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tracing::debug;
use zk_wire::{Acl, CreateFlags, ErrorCode, Request, Response, Stat};

use crate::config::{Backend, ClientConfig};
use crate::connection::{ConnectionHandle, ConnectionOptions};
use crate::error::ZkError;
use crate::pool::{BackendPool, PoolHandle, TcpConnectionFactory};
use crate::session::{
    ClientEvent, DriverChannels, DriverCommand, SessionDriver, SessionSnapshot, SessionState,
};
use crate::watcher::Watcher;

const EVENT_CAPACITY: usize = 64;

/// Options for node creation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateOptions {
    /// ACL of the new node
    pub acl: Vec<Acl>,
    /// Creation mode
    pub flags: CreateFlags,
}

impl Default for CreateOptions {
    fn default() -> Self {
        Self {
            acl: vec![Acl::open_unsafe()],
            flags: CreateFlags::empty(),
        }
    }
}

impl CreateOptions {
    /// Default ACL with the given flags
    pub fn with_flags(flags: CreateFlags) -> Self {
        Self {
            flags,
            ..Self::default()
        }
    }
}

/// Check a node path before it goes on the wire.
///
/// Sequential creates may end in `/`; the server appends the suffix.
pub fn validate_path(path: &str, sequential: bool) -> Result<(), ZkError> {
    let invalid = |reason: &str| Err(ZkError::InvalidPath(format!("{}: {}", path, reason)));

    if !path.starts_with('/') {
        return invalid("must be absolute");
    }
    if path == "/" {
        return Ok(());
    }
    let body = match path.strip_suffix('/') {
        Some(body) if sequential => body,
        Some(_) => return invalid("must not end with '/'"),
        None => path,
    };
    if body.len() > 1 && body[1..].split('/').any(str::is_empty) {
        return invalid("empty path segment");
    }
    if path.contains('\0') {
        return invalid("contains a null character");
    }
    Ok(())
}

struct ClientInner {
    commands: mpsc::UnboundedSender<DriverCommand>,
    snapshot: watch::Receiver<SessionSnapshot>,
    events: broadcast::Sender<ClientEvent>,
    pool: PoolHandle,
    watcher_ids: Arc<AtomicU64>,
    closed: AtomicBool,
}

/// ZooKeeper client
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let snapshot = self.inner.snapshot.borrow();
        f.debug_struct("Client")
            .field("state", &snapshot.state)
            .field("session_id", &format_args!("{:016x}", snapshot.session_id))
            .finish()
    }
}

impl Client {
    /// Start the session driver and the backend pool.
    ///
    /// Returns immediately; use [`Client::wait_connected`] or
    /// [`Client::events`] to learn when the session is usable.
    pub fn connect(config: ClientConfig) -> Result<Client, ZkError> {
        if config.servers.is_empty() {
            return Err(ZkError::InvalidAddress("empty server list".to_string()));
        }

        let (conn_tx, conn_rx) = mpsc::unbounded_channel();
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let (snapshot_tx, snapshot_rx) = watch::channel(SessionSnapshot {
            state: SessionState::Detached,
            session_id: 0,
            timeout: config.session_timeout,
            connection: None,
            connected: false,
        });

        SessionDriver::spawn(
            config.session_timeout,
            DriverChannels {
                conn_events: conn_rx,
                commands: cmd_rx,
                events: events.clone(),
                snapshot: snapshot_tx,
            },
        );

        let options = ConnectionOptions {
            connect_timeout: config.connect.timeout,
            max_frame_size: config.max_frame_size,
        };
        let factory = Arc::new(TcpConnectionFactory::new(options, conn_tx));
        let pool = BackendPool::spawn(
            config.servers.clone(),
            config.connect.clone(),
            factory,
            events.clone(),
        );

        debug!(
            "zookeeper client started with {} servers",
            config.servers.len()
        );
        Ok(Client {
            inner: Arc::new(ClientInner {
                commands: cmd_tx,
                snapshot: snapshot_rx,
                events,
                pool,
                watcher_ids: Arc::new(AtomicU64::new(1)),
                closed: AtomicBool::new(false),
            }),
        })
    }

    /// Subscribe to client events
    pub fn events(&self) -> broadcast::Receiver<ClientEvent> {
        self.inner.events.subscribe()
    }

    /// Wait until the session is attached to a connected connection
    pub async fn wait_connected(&self, timeout: Duration) -> Result<(), ZkError> {
        let mut snapshot = self.inner.snapshot.clone();
        let waited = tokio::time::timeout(timeout, async {
            snapshot.wait_for(|snapshot| snapshot.connected).await.map(|_| ())
        })
        .await;
        match waited {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(ZkError::Closed),
            Err(_) => Err(ZkError::ConnectTimeout),
        }
    }

    /// Current session id, 0 before the first attach
    pub fn session_id(&self) -> i64 {
        self.inner.snapshot.borrow().session_id
    }

    /// Negotiated session timeout
    pub fn session_timeout(&self) -> Duration {
        self.inner.snapshot.borrow().timeout
    }

    /// Whether requests can be sent right now
    pub fn is_connected(&self) -> bool {
        self.current_connection().is_some()
    }

    /// The connection requests are currently sent on
    pub fn current_connection(&self) -> Option<ConnectionHandle> {
        if self.inner.closed.load(Ordering::Acquire) {
            return None;
        }
        self.inner
            .snapshot
            .borrow()
            .connection
            .clone()
            .filter(ConnectionHandle::is_connected)
    }

    /// Replace the server list; the session migrates if its backend was removed
    pub fn update_servers(&self, servers: Vec<Backend>) {
        self.inner.pool.set_backends(servers);
    }

    /// Per-path watch handle
    pub fn watcher(&self, path: &str) -> Result<Watcher, ZkError> {
        validate_path(path, false)?;
        Ok(Watcher::new(
            path.to_string(),
            self.inner.commands.clone(),
            self.inner.watcher_ids.clone(),
        ))
    }

    async fn request(&self, request: Request) -> Result<Response, ZkError> {
        let conn = self.current_connection().ok_or(ZkError::NotConnected)?;
        conn.request(request).await
    }

    /// Children and stat of a node
    pub async fn list(&self, path: &str) -> Result<(Vec<String>, Stat), ZkError> {
        validate_path(path, false)?;
        let request = Request::GetChildren2 {
            path: path.to_string(),
            watch: false,
        };
        match self.request(request).await? {
            Response::GetChildren2 { children, stat } => Ok((children, stat)),
            other => Err(unexpected(other)),
        }
    }

    /// Children of a node without the stat
    pub async fn list_children(&self, path: &str) -> Result<Vec<String>, ZkError> {
        validate_path(path, false)?;
        let request = Request::GetChildren {
            path: path.to_string(),
            watch: false,
        };
        match self.request(request).await? {
            Response::GetChildren { children } => Ok(children),
            other => Err(unexpected(other)),
        }
    }

    /// Data and stat of a node
    pub async fn get(&self, path: &str) -> Result<(Bytes, Stat), ZkError> {
        validate_path(path, false)?;
        let request = Request::GetData {
            path: path.to_string(),
            watch: false,
        };
        match self.request(request).await? {
            Response::GetData { data, stat } => Ok((data, stat)),
            other => Err(unexpected(other)),
        }
    }

    /// Create a node; returns the created path
    pub async fn create(
        &self,
        path: &str,
        data: impl Into<Bytes>,
        options: CreateOptions,
    ) -> Result<String, ZkError> {
        validate_path(path, options.flags.contains(CreateFlags::SEQUENTIAL))?;
        let request = Request::Create {
            path: path.to_string(),
            data: data.into(),
            acl: options.acl,
            flags: options.flags,
        };
        match self.request(request).await? {
            Response::Create { path } => Ok(path),
            other => Err(unexpected(other)),
        }
    }

    /// Create a node and any missing ancestors.
    ///
    /// Ancestors are created empty, persistent and world-accessible; ones
    /// that already exist are left alone.
    pub async fn create_with_empty_parents(
        &self,
        path: &str,
        data: impl Into<Bytes>,
        options: CreateOptions,
    ) -> Result<String, ZkError> {
        validate_path(path, options.flags.contains(CreateFlags::SEQUENTIAL))?;

        let trimmed = path.trim_end_matches('/');
        let mut ancestor = String::new();
        let parts: Vec<&str> = trimmed.split('/').skip(1).collect();
        for part in parts.iter().take(parts.len().saturating_sub(1)) {
            ancestor.push('/');
            ancestor.push_str(part);
            match self
                .create(&ancestor, Bytes::new(), CreateOptions::default())
                .await
            {
                Ok(_) => debug!("created missing parent {}", ancestor),
                Err(ZkError::Server(ErrorCode::NodeExists)) => {}
                Err(error) => return Err(error),
            }
        }

        self.create(path, data, options).await
    }

    /// Overwrite a node's data; `None` skips the version check
    pub async fn set(
        &self,
        path: &str,
        data: impl Into<Bytes>,
        version: Option<i32>,
    ) -> Result<Stat, ZkError> {
        validate_path(path, false)?;
        let request = Request::SetData {
            path: path.to_string(),
            data: data.into(),
            version: version.unwrap_or(-1),
        };
        match self.request(request).await? {
            Response::SetData { stat } => Ok(stat),
            other => Err(unexpected(other)),
        }
    }

    /// Delete a node; `None` skips the version check
    pub async fn delete(&self, path: &str, version: Option<i32>) -> Result<(), ZkError> {
        validate_path(path, false)?;
        let request = Request::Delete {
            path: path.to_string(),
            version: version.unwrap_or(-1),
        };
        self.request(request).await.map(|_| ())
    }

    /// Stat of a node
    pub async fn stat(&self, path: &str) -> Result<Stat, ZkError> {
        validate_path(path, false)?;
        let request = Request::Exists {
            path: path.to_string(),
            watch: false,
        };
        match self.request(request).await? {
            Response::Exists { stat } => Ok(stat),
            other => Err(unexpected(other)),
        }
    }

    /// ACL and stat of a node
    pub async fn get_acl(&self, path: &str) -> Result<(Vec<Acl>, Stat), ZkError> {
        validate_path(path, false)?;
        let request = Request::GetAcl {
            path: path.to_string(),
        };
        match self.request(request).await? {
            Response::GetAcl { acl, stat } => Ok((acl, stat)),
            other => Err(unexpected(other)),
        }
    }

    /// Wait until the server has caught up with the leader for `path`
    pub async fn sync(&self, path: &str) -> Result<(), ZkError> {
        validate_path(path, false)?;
        self.request(Request::Sync {
            path: path.to_string(),
        })
        .await
        .map(|_| ())
    }

    /// Round-trip time of a ping on the current connection
    pub async fn ping(&self) -> Result<Duration, ZkError> {
        let conn = self.current_connection().ok_or(ZkError::NotConnected)?;
        conn.ping().await
    }

    /// Close the session, stop the pool and emit `Close`
    pub async fn close(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let (done, rx) = oneshot::channel();
        if self
            .inner
            .commands
            .send(DriverCommand::Close { done })
            .is_ok()
        {
            rx.await.ok();
        }
        self.inner.pool.stop().await;
        self.inner.events.send(ClientEvent::Close).ok();
    }
}

fn unexpected(response: Response) -> ZkError {
    debug!("unexpected reply shape: {:?}", response);
    ZkError::Server(ErrorCode::MarshallingError)
}
