//! In-process fake ZooKeeper ensemble for tests.
//!
//! Every server of the ensemble shares one node tree and one session table,
//! like replicas that are always in sync. Watches follow the server's rules:
//! they are one-shot, kept per connection, and `SET_WATCHES` fires
//! immediately for anything that changed after the client's zxid.

use bytes::{Bytes, BytesMut};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use zk_wire::{
    Acl, ConnectRequest, ConnectResponse, CreateFlags, ErrorCode, KeeperState, NotificationType,
    ReplyHeader, Request, Response, ServerCodec, ServerInbound, SetWatches, Stat, WatcherEvent,
    MAX_PACKET_SIZE,
};

use crate::config::Backend;

const FIRST_SESSION_ID: i64 = 0x0100_0000_0000_0001;

enum Outbound {
    Packet(Bytes),
    Kill,
}

struct Node {
    data: Bytes,
    acl: Vec<Acl>,
    stat: Stat,
}

struct ConnRecord {
    server: usize,
    session_id: i64,
    outbound: mpsc::UnboundedSender<Outbound>,
    data_watches: HashSet<String>,
    child_watches: HashSet<String>,
}

struct ServerState {
    zxid: i64,
    nodes: BTreeMap<String, Node>,
    sessions: HashMap<i64, Bytes>,
    next_session: i64,
    conns: HashMap<u64, ConnRecord>,
    next_conn: u64,
    frozen: bool,
    codec: ServerCodec,
}

fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as i64)
        .unwrap_or(0)
}

fn parent_of(path: &str) -> &str {
    match path.rsplit_once('/') {
        Some(("", _)) => "/",
        Some((parent, _)) => parent,
        None => "/",
    }
}

fn child_name<'a>(parent: &str, path: &'a str) -> Option<&'a str> {
    let rest = if parent == "/" {
        path.strip_prefix('/')?
    } else {
        path.strip_prefix(parent)?.strip_prefix('/')?
    };
    (!rest.is_empty() && !rest.contains('/')).then_some(rest)
}

impl ServerState {
    fn new() -> Self {
        let mut state = Self {
            zxid: 0,
            nodes: BTreeMap::new(),
            sessions: HashMap::new(),
            next_session: FIRST_SESSION_ID,
            conns: HashMap::new(),
            next_conn: 1,
            frozen: false,
            codec: ServerCodec::new(MAX_PACKET_SIZE),
        };
        state.nodes.insert(
            "/".to_string(),
            Node {
                data: Bytes::new(),
                acl: vec![Acl::open_unsafe()],
                stat: Stat::default(),
            },
        );
        state
            .create(
                "/zookeeper".to_string(),
                Bytes::new(),
                vec![Acl::open_unsafe()],
                CreateFlags::empty(),
                0,
            )
            .ok();
        state
    }

    fn children(&self, parent: &str) -> Vec<String> {
        self.nodes
            .keys()
            .filter_map(|path| child_name(parent, path))
            .map(str::to_string)
            .collect()
    }

    fn fire(&mut self, path: &str, event_type: NotificationType) {
        let event = WatcherEvent {
            event_type,
            state: KeeperState::SyncConnected,
            path: path.to_string(),
        };
        let Ok(packet) = self.codec.encode_notification(-1, &event) else {
            return;
        };
        for conn in self.conns.values_mut() {
            let hit = match event_type {
                NotificationType::Created | NotificationType::DataChanged => {
                    conn.data_watches.remove(path)
                }
                NotificationType::ChildrenChanged => conn.child_watches.remove(path),
                NotificationType::Deleted => {
                    let data = conn.data_watches.remove(path);
                    conn.child_watches.remove(path) || data
                }
            };
            if hit {
                conn.outbound.send(Outbound::Packet(packet.clone())).ok();
            }
        }
    }

    fn create(
        &mut self,
        path: String,
        data: Bytes,
        acl: Vec<Acl>,
        flags: CreateFlags,
        owner: i64,
    ) -> Result<String, ErrorCode> {
        let parent_path = parent_of(&path).to_string();
        let parent = self.nodes.get_mut(&parent_path).ok_or(ErrorCode::NoNode)?;
        if parent.stat.ephemeral_owner != 0 {
            return Err(ErrorCode::NoChildrenForEphemerals);
        }

        let path = if flags.contains(CreateFlags::SEQUENTIAL) {
            format!("{}{:010}", path, parent.stat.cversion)
        } else {
            path
        };
        if self.nodes.contains_key(&path) {
            return Err(ErrorCode::NodeExists);
        }

        self.zxid += 1;
        let zxid = self.zxid;
        if let Some(parent) = self.nodes.get_mut(&parent_path) {
            parent.stat.cversion += 1;
            parent.stat.num_children += 1;
            parent.stat.pzxid = zxid;
        }

        let now = now_ms();
        let stat = Stat {
            czxid: zxid,
            mzxid: zxid,
            pzxid: zxid,
            ctime: now,
            mtime: now,
            data_length: data.len() as i32,
            ephemeral_owner: if flags.contains(CreateFlags::EPHEMERAL) {
                owner
            } else {
                0
            },
            ..Stat::default()
        };
        self.nodes.insert(path.clone(), Node { data, acl, stat });

        self.fire(&path, NotificationType::Created);
        self.fire(&parent_path, NotificationType::ChildrenChanged);
        Ok(path)
    }

    fn delete(&mut self, path: &str, version: i32) -> Result<(), ErrorCode> {
        if path == "/" {
            return Err(ErrorCode::BadArguments);
        }
        let node = self.nodes.get(path).ok_or(ErrorCode::NoNode)?;
        if version != -1 && node.stat.version != version {
            return Err(ErrorCode::BadVersion);
        }
        if node.stat.num_children > 0 {
            return Err(ErrorCode::NotEmpty);
        }

        self.zxid += 1;
        self.nodes.remove(path);
        let parent_path = parent_of(path).to_string();
        if let Some(parent) = self.nodes.get_mut(&parent_path) {
            parent.stat.cversion += 1;
            parent.stat.num_children -= 1;
            parent.stat.pzxid = self.zxid;
        }

        self.fire(path, NotificationType::Deleted);
        self.fire(&parent_path, NotificationType::ChildrenChanged);
        Ok(())
    }

    fn set_data(&mut self, path: &str, data: Bytes, version: i32) -> Result<Stat, ErrorCode> {
        let zxid = self.zxid + 1;
        let node = self.nodes.get_mut(path).ok_or(ErrorCode::NoNode)?;
        if version != -1 && node.stat.version != version {
            return Err(ErrorCode::BadVersion);
        }
        self.zxid = zxid;
        node.stat.mzxid = zxid;
        node.stat.mtime = now_ms();
        node.stat.version += 1;
        node.stat.data_length = data.len() as i32;
        node.data = data;
        let stat = node.stat;

        self.fire(path, NotificationType::DataChanged);
        Ok(stat)
    }

    fn close_session(&mut self, session_id: i64) {
        self.sessions.remove(&session_id);
        let ephemerals: Vec<String> = self
            .nodes
            .iter()
            .filter(|(_, node)| node.stat.ephemeral_owner == session_id)
            .map(|(path, _)| path.clone())
            .collect();
        for path in ephemerals {
            self.delete(&path, -1).ok();
        }
    }

    fn watch(&mut self, conn_id: u64, path: &str, children: bool) {
        if let Some(conn) = self.conns.get_mut(&conn_id) {
            let table = if children {
                &mut conn.child_watches
            } else {
                &mut conn.data_watches
            };
            table.insert(path.to_string());
        }
    }

    fn connect(&mut self, conn_id: u64, request: ConnectRequest) -> ConnectResponse {
        let resumed = request.session_id != 0
            && self.sessions.get(&request.session_id) == Some(&request.passwd);
        let (session_id, passwd) = if request.session_id == 0 {
            let id = self.next_session;
            self.next_session += 1;
            let passwd = Bytes::from(format!("passwd-{:09}", id & 0xffff_ffff));
            self.sessions.insert(id, passwd.clone());
            (id, passwd)
        } else if resumed {
            (request.session_id, request.passwd.clone())
        } else {
            return ConnectResponse {
                protocol_version: 0,
                timeout: 0,
                session_id: 0,
                passwd: Bytes::from_static(&[0u8; 16]),
                read_only: false,
            };
        };

        if let Some(conn) = self.conns.get_mut(&conn_id) {
            conn.session_id = session_id;
        }
        ConnectResponse {
            protocol_version: 0,
            timeout: request.timeout,
            session_id,
            passwd,
            read_only: false,
        }
    }

    /// Register watches after a reconnect, firing for anything that moved on
    fn set_watches(&mut self, conn_id: u64, watches: SetWatches) {
        let mut fired = Vec::new();
        for path in watches.data_watches {
            match self.nodes.get(&path) {
                None => fired.push((path, NotificationType::Deleted)),
                Some(node) if node.stat.mzxid > watches.relative_zxid => {
                    fired.push((path, NotificationType::DataChanged))
                }
                Some(_) => self.watch(conn_id, &path, false),
            }
        }
        for path in watches.exist_watches {
            if self.nodes.contains_key(&path) {
                fired.push((path, NotificationType::Created));
            } else {
                self.watch(conn_id, &path, false);
            }
        }
        for path in watches.child_watches {
            match self.nodes.get(&path) {
                None => fired.push((path, NotificationType::Deleted)),
                Some(node) if node.stat.pzxid > watches.relative_zxid => {
                    fired.push((path, NotificationType::ChildrenChanged))
                }
                Some(_) => self.watch(conn_id, &path, true),
            }
        }

        let Some(conn) = self.conns.get(&conn_id) else {
            return;
        };
        for (path, event_type) in fired {
            let event = WatcherEvent {
                event_type,
                state: KeeperState::SyncConnected,
                path,
            };
            if let Ok(packet) = self.codec.encode_notification(-1, &event) {
                conn.outbound.send(Outbound::Packet(packet)).ok();
            }
        }
    }

    fn apply(&mut self, conn_id: u64, request: Request) -> Result<Response, ErrorCode> {
        let owner = self
            .conns
            .get(&conn_id)
            .map(|conn| conn.session_id)
            .unwrap_or(0);

        match request {
            Request::Ping | Request::Sync { .. } => Ok(Response::Empty),
            Request::CloseSession => {
                self.close_session(owner);
                Ok(Response::Empty)
            }
            Request::SetWatches(watches) => {
                self.set_watches(conn_id, watches);
                Ok(Response::Empty)
            }
            Request::Create {
                path,
                data,
                acl,
                flags,
            } => self
                .create(path, data, acl, flags, owner)
                .map(|path| Response::Create { path }),
            Request::Delete { path, version } => {
                self.delete(&path, version).map(|_| Response::Empty)
            }
            Request::Exists { path, watch } => {
                if watch {
                    self.watch(conn_id, &path, false);
                }
                let node = self.nodes.get(&path).ok_or(ErrorCode::NoNode)?;
                Ok(Response::Exists { stat: node.stat })
            }
            Request::GetData { path, watch } => {
                let node = self.nodes.get(&path).ok_or(ErrorCode::NoNode)?;
                let response = Response::GetData {
                    data: node.data.clone(),
                    stat: node.stat,
                };
                if watch {
                    self.watch(conn_id, &path, false);
                }
                Ok(response)
            }
            Request::SetData {
                path,
                data,
                version,
            } => self
                .set_data(&path, data, version)
                .map(|stat| Response::SetData { stat }),
            Request::GetAcl { path } => {
                let node = self.nodes.get(&path).ok_or(ErrorCode::NoNode)?;
                Ok(Response::GetAcl {
                    acl: node.acl.clone(),
                    stat: node.stat,
                })
            }
            Request::GetChildren { path, watch } => {
                self.nodes.get(&path).ok_or(ErrorCode::NoNode)?;
                if watch {
                    self.watch(conn_id, &path, true);
                }
                Ok(Response::GetChildren {
                    children: self.children(&path),
                })
            }
            Request::GetChildren2 { path, watch } => {
                let stat = self.nodes.get(&path).ok_or(ErrorCode::NoNode)?.stat;
                if watch {
                    self.watch(conn_id, &path, true);
                }
                Ok(Response::GetChildren2 {
                    children: self.children(&path),
                    stat,
                })
            }
        }
    }

    /// Answer one inbound packet. Returns the reply and whether to hang up.
    fn handle(&mut self, conn_id: u64, inbound: ServerInbound) -> (Option<Bytes>, bool) {
        if self.frozen {
            return (None, false);
        }
        match inbound {
            ServerInbound::Connect(request) => {
                let response = self.connect(conn_id, request);
                (self.codec.encode_connect_response(&response).ok(), false)
            }
            ServerInbound::Request { header, request } => {
                let hang_up = matches!(request, Request::CloseSession);
                let (err, body) = match self.apply(conn_id, request) {
                    Ok(body) => (ErrorCode::Ok, Some(body)),
                    Err(code) => (code, None),
                };
                let reply = ReplyHeader {
                    xid: header.xid,
                    zxid: self.zxid,
                    err,
                };
                (self.codec.encode_reply(&reply, body.as_ref()).ok(), hang_up)
            }
        }
    }
}

/// A set of fake servers sharing one tree
pub(crate) struct FakeEnsemble {
    state: Arc<Mutex<ServerState>>,
    backends: Vec<Backend>,
    acceptors: Vec<JoinHandle<()>>,
}

impl FakeEnsemble {
    /// Start `servers` listeners on loopback
    pub(crate) async fn start(servers: usize) -> Self {
        let state = Arc::new(Mutex::new(ServerState::new()));
        let mut backends = Vec::new();
        let mut acceptors = Vec::new();
        for server in 0..servers {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            let port = listener.local_addr().unwrap().port();
            backends.push(Backend::new("127.0.0.1", port));
            acceptors.push(tokio::spawn(accept(listener, state.clone(), server)));
        }
        Self {
            state,
            backends,
            acceptors,
        }
    }

    fn lock(&self) -> MutexGuard<'_, ServerState> {
        self.state.lock().unwrap()
    }

    pub(crate) fn backends(&self) -> Vec<Backend> {
        self.backends.clone()
    }

    /// Drop every client socket
    pub(crate) fn kill_connections(&self) {
        for conn in self.lock().conns.values() {
            conn.outbound.send(Outbound::Kill).ok();
        }
    }

    /// Stop answering anything, handshakes included
    pub(crate) fn set_frozen(&self, frozen: bool) {
        self.lock().frozen = frozen;
    }

    /// Make the server forget a session, as if it had expired
    pub(crate) fn forget_session(&self, session_id: i64) {
        self.lock().close_session(session_id);
    }

    pub(crate) fn has_session(&self, session_id: i64) -> bool {
        self.lock().sessions.contains_key(&session_id)
    }

    /// Open client connections to server `server`
    pub(crate) fn connections_on(&self, server: usize) -> usize {
        self.lock()
            .conns
            .values()
            .filter(|conn| conn.server == server)
            .count()
    }

    pub(crate) fn create(&self, path: &str, data: impl Into<Bytes>) {
        self.lock()
            .create(
                path.to_string(),
                data.into(),
                vec![Acl::open_unsafe()],
                CreateFlags::empty(),
                0,
            )
            .unwrap();
    }

    pub(crate) fn set_data(&self, path: &str, data: impl Into<Bytes>) {
        self.lock().set_data(path, data.into(), -1).unwrap();
    }

    pub(crate) fn delete(&self, path: &str) {
        self.lock().delete(path, -1).unwrap();
    }

    pub(crate) fn data(&self, path: &str) -> Option<Bytes> {
        self.lock().nodes.get(path).map(|node| node.data.clone())
    }
}

impl Drop for FakeEnsemble {
    fn drop(&mut self) {
        for acceptor in &self.acceptors {
            acceptor.abort();
        }
        if let Ok(state) = self.state.lock() {
            for conn in state.conns.values() {
                conn.outbound.send(Outbound::Kill).ok();
            }
        }
    }
}

async fn accept(listener: TcpListener, state: Arc<Mutex<ServerState>>, server: usize) {
    while let Ok((stream, _)) = listener.accept().await {
        tokio::spawn(serve(stream, state.clone(), server));
    }
}

async fn serve(stream: TcpStream, state: Arc<Mutex<ServerState>>, server: usize) {
    let (outbound, mut outbound_rx) = mpsc::unbounded_channel();
    let conn_id = {
        let mut state = state.lock().unwrap();
        let id = state.next_conn;
        state.next_conn += 1;
        state.conns.insert(
            id,
            ConnRecord {
                server,
                session_id: 0,
                outbound,
                data_watches: HashSet::new(),
                child_watches: HashSet::new(),
            },
        );
        id
    };

    let (mut reader, mut writer) = stream.into_split();
    let mut codec = ServerCodec::new(MAX_PACKET_SIZE);
    let mut buf = BytesMut::with_capacity(4096);

    'conn: loop {
        tokio::select! {
            read = reader.read_buf(&mut buf) => {
                match read {
                    Ok(0) | Err(_) => break,
                    Ok(_) => {}
                }
                loop {
                    let inbound = match codec.decode(&mut buf) {
                        Ok(Some(inbound)) => inbound,
                        Ok(None) => break,
                        Err(_) => break 'conn,
                    };
                    let (reply, hang_up) = state.lock().unwrap().handle(conn_id, inbound);
                    if let Some(reply) = reply {
                        if writer.write_all(&reply).await.is_err() {
                            break 'conn;
                        }
                    }
                    if hang_up {
                        break 'conn;
                    }
                }
            }
            outbound = outbound_rx.recv() => match outbound {
                Some(Outbound::Packet(packet)) => {
                    if writer.write_all(&packet).await.is_err() {
                        break;
                    }
                }
                Some(Outbound::Kill) | None => break,
            },
        }
    }

    state.lock().unwrap().conns.remove(&conn_id);
}
