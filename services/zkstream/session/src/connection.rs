//! Connection state machine.
//!
//! One task owns one socket. It performs the handshake on behalf of the
//! session, assigns xids, correlates replies to pending requests, keeps the
//! connection alive with pings and reports everything it sees to the session
//! driver over an event channel.
//!
//! ```text
//! init → connecting → handshaking → connected → (closing | error) → closed
//! ```

use bytes::BytesMut;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{interval_at, sleep, sleep_until, Instant, MissedTickBehavior};
use tracing::{debug, info, trace, warn};
use zk_wire::{
    ClientCodec, ConnectRequest, ConnectResponse, Inbound, Reply, Request, Response, SetWatches,
    WatcherEvent, PROTOCOL_VERSION, XID_AUTH, XID_PING, XID_SET_WATCHES,
};

use crate::config::Backend;
use crate::error::ZkError;
use crate::transport::connect_tcp;

/// Lower bound for both the ping interval and the ping timeout
pub const MIN_PING_INTERVAL: Duration = Duration::from_millis(2000);

const READ_BUFFER_SIZE: usize = 64 * 1024;

/// Interval between pings for a negotiated session timeout
pub fn ping_interval(timeout: Duration) -> Duration {
    (timeout / 4).max(MIN_PING_INTERVAL)
}

/// How long a ping may stay unanswered for a negotiated session timeout
pub fn ping_timeout(timeout: Duration) -> Duration {
    (timeout / 8).max(MIN_PING_INTERVAL)
}

/// Connection lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    /// Not started yet
    Init,
    /// Opening the TCP socket
    Connecting,
    /// Exchanging the connect packets
    Handshaking,
    /// Steady state
    Connected,
    /// Draining before a graceful close
    Closing,
    /// Failed; pending requests are being failed
    Error,
    /// Terminal
    Closed,
}

/// Process-unique connection identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnId(pub u64);

impl fmt::Display for ConnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Socket-level options for a connection
#[derive(Debug, Clone, Copy)]
pub struct ConnectionOptions {
    /// Limit for the TCP connect and for the handshake reply
    pub connect_timeout: Duration,
    /// Largest packet accepted from the server
    pub max_frame_size: usize,
}

type ReplySender = oneshot::Sender<Result<Response, ZkError>>;
type PingSender = oneshot::Sender<Result<Duration, ZkError>>;
type SetWatchesSender = oneshot::Sender<Result<(), ZkError>>;

/// Commands accepted by a connection task
pub(crate) enum ConnCommand {
    Attach(ConnectRequest),
    Established { timeout: Duration },
    Reject(ZkError),
    Request { request: Request, reply: ReplySender },
    Ping(PingSender),
    SetWatches { watches: SetWatches, reply: SetWatchesSender },
    Close,
    Destroy,
}

impl ConnCommand {
    /// Resolve whatever caller waits on this command with `error`
    fn refuse(self, error: ZkError) {
        match self {
            ConnCommand::Request { reply, .. } => {
                reply.send(Err(error)).ok();
            }
            ConnCommand::Ping(reply) => {
                reply.send(Err(error)).ok();
            }
            ConnCommand::SetWatches { reply, .. } => {
                reply.send(Err(error)).ok();
            }
            _ => {}
        }
    }
}

/// Events reported by a connection to its session
#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    /// Socket is open; the session must answer with `attach` or `reject`
    Handshaking {
        /// Reporting connection
        conn: ConnectionHandle,
    },
    /// Handshake reply; the session must answer with `establish` or `reject`
    ConnectReply {
        /// Reporting connection
        conn: ConnectionHandle,
        /// Decoded reply
        reply: ConnectResponse,
    },
    /// Handshake complete
    Connected {
        /// Reporting connection
        conn: ConnectionHandle,
    },
    /// A reply arrived
    Packet {
        /// Reporting connection
        conn: ConnectionHandle,
        /// zxid from the reply header
        zxid: i64,
    },
    /// A watch notification arrived
    Notification {
        /// Reporting connection
        conn: ConnectionHandle,
        /// zxid from the notification header
        zxid: i64,
        /// Notification body
        event: WatcherEvent,
    },
    /// The connection failed
    Error {
        /// Reporting connection
        conn: ConnectionHandle,
        /// Cause
        error: ZkError,
    },
    /// The connection is gone
    Closed {
        /// Reporting connection
        conn: ConnectionHandle,
    },
}

impl ConnectionEvent {
    /// Connection that produced the event
    pub fn conn(&self) -> &ConnectionHandle {
        match self {
            ConnectionEvent::Handshaking { conn }
            | ConnectionEvent::ConnectReply { conn, .. }
            | ConnectionEvent::Connected { conn }
            | ConnectionEvent::Packet { conn, .. }
            | ConnectionEvent::Notification { conn, .. }
            | ConnectionEvent::Error { conn, .. }
            | ConnectionEvent::Closed { conn } => conn,
        }
    }
}

struct HandleInner {
    id: ConnId,
    backend: Backend,
    cmd_tx: mpsc::UnboundedSender<ConnCommand>,
    state_rx: watch::Receiver<ConnectionState>,
    established: AtomicBool,
}

/// Cloneable handle to a connection task
#[derive(Clone)]
pub struct ConnectionHandle {
    inner: Arc<HandleInner>,
}

impl fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("id", &self.inner.id)
            .field("backend", &self.inner.backend)
            .field("state", &self.state())
            .finish()
    }
}

impl PartialEq for ConnectionHandle {
    fn eq(&self, other: &Self) -> bool {
        self.inner.id == other.inner.id
    }
}

impl Eq for ConnectionHandle {}

impl ConnectionHandle {
    /// Spawn a connection task for `backend`
    pub fn spawn(
        id: ConnId,
        backend: Backend,
        options: ConnectionOptions,
        events: mpsc::UnboundedSender<ConnectionEvent>,
    ) -> ConnectionHandle {
        let (handle, cmd_rx, state_tx) = Self::new_pair(id, backend);
        let task = ConnectionTask {
            handle: handle.clone(),
            options,
            cmd_rx,
            events,
            state_tx,
            codec: ClientCodec::new(options.max_frame_size),
            next_xid: 1,
            pending: HashMap::new(),
            ping: PingState::default(),
            set_watches: VecDeque::new(),
            set_watches_in_flight: None,
            closing: false,
            close_xid: None,
        };
        tokio::spawn(task.run());
        handle
    }

    fn new_pair(
        id: ConnId,
        backend: Backend,
    ) -> (
        ConnectionHandle,
        mpsc::UnboundedReceiver<ConnCommand>,
        watch::Sender<ConnectionState>,
    ) {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(ConnectionState::Init);
        let handle = ConnectionHandle {
            inner: Arc::new(HandleInner {
                id,
                backend,
                cmd_tx,
                state_rx,
                established: AtomicBool::new(false),
            }),
        };
        (handle, cmd_rx, state_tx)
    }

    /// Handle wired to bare channels, for driving the session without sockets
    #[cfg(test)]
    pub(crate) fn test_pair(
        id: u64,
    ) -> (
        ConnectionHandle,
        mpsc::UnboundedReceiver<ConnCommand>,
        watch::Sender<ConnectionState>,
    ) {
        Self::test_pair_to(id, Backend::new("127.0.0.1", 2181))
    }

    #[cfg(test)]
    pub(crate) fn test_pair_to(
        id: u64,
        backend: Backend,
    ) -> (
        ConnectionHandle,
        mpsc::UnboundedReceiver<ConnCommand>,
        watch::Sender<ConnectionState>,
    ) {
        Self::new_pair(ConnId(id), backend)
    }

    #[cfg(test)]
    pub(crate) fn mark_established(&self) {
        self.inner.established.store(true, Ordering::Release);
    }

    /// Connection id
    pub fn id(&self) -> ConnId {
        self.inner.id
    }

    /// Backend this connection points at
    pub fn backend(&self) -> &Backend {
        &self.inner.backend
    }

    /// Current state
    pub fn state(&self) -> ConnectionState {
        *self.inner.state_rx.borrow()
    }

    /// Whether the connection accepts requests
    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Queue a request; the receiver resolves exactly once
    pub fn submit(&self, request: Request) -> oneshot::Receiver<Result<Response, ZkError>> {
        let (reply, rx) = oneshot::channel();
        // a dead task drops the command, which resolves the receiver
        self.send(ConnCommand::Request { request, reply });
        rx
    }

    /// Send a request and wait for its reply
    pub async fn request(&self, request: Request) -> Result<Response, ZkError> {
        self.submit(request)
            .await
            .unwrap_or(Err(ZkError::ConnectionLoss))
    }

    /// Ping the server and return the round-trip time
    pub async fn ping(&self) -> Result<Duration, ZkError> {
        let (reply, rx) = oneshot::channel();
        self.send(ConnCommand::Ping(reply));
        rx.await.unwrap_or(Err(ZkError::ConnectionLoss))
    }

    /// Re-register watches on this connection
    pub fn set_watches(&self, watches: SetWatches) -> oneshot::Receiver<Result<(), ZkError>> {
        let (reply, rx) = oneshot::channel();
        self.send(ConnCommand::SetWatches { watches, reply });
        rx
    }

    pub(crate) fn attach(&self, request: ConnectRequest) {
        self.send(ConnCommand::Attach(request));
    }

    pub(crate) fn establish(&self, timeout: Duration) {
        self.send(ConnCommand::Established { timeout });
    }

    pub(crate) fn reject(&self, error: ZkError) {
        self.send(ConnCommand::Reject(error));
    }

    /// Drain pending requests, close the session and end the socket
    pub fn close(&self) {
        self.send(ConnCommand::Close);
    }

    /// Drop the socket immediately
    pub fn destroy(&self) {
        self.send(ConnCommand::Destroy);
    }

    /// Wait until the connection is closed
    pub async fn closed(&self) {
        let mut state_rx = self.inner.state_rx.clone();
        state_rx
            .wait_for(|state| *state == ConnectionState::Closed)
            .await
            .ok();
    }

    /// Wait until the connection either completes the handshake or ends.
    ///
    /// Returns whether it ever reached `connected`.
    pub async fn wait_established(&self) -> bool {
        let mut state_rx = self.inner.state_rx.clone();
        state_rx
            .wait_for(|state| {
                matches!(
                    state,
                    ConnectionState::Connected
                        | ConnectionState::Closing
                        | ConnectionState::Error
                        | ConnectionState::Closed
                )
            })
            .await
            .ok();
        self.was_established()
    }

    /// Whether the handshake ever completed
    pub fn was_established(&self) -> bool {
        self.inner.established.load(Ordering::Acquire)
    }

    fn send(&self, cmd: ConnCommand) {
        if let Err(mpsc::error::SendError(cmd)) = self.inner.cmd_tx.send(cmd) {
            cmd.refuse(ZkError::ConnectionLoss);
        }
    }
}

#[derive(Default)]
struct PingState {
    sent_at: Option<Instant>,
    waiters: Vec<PingSender>,
}

struct ConnectionTask {
    handle: ConnectionHandle,
    options: ConnectionOptions,
    cmd_rx: mpsc::UnboundedReceiver<ConnCommand>,
    events: mpsc::UnboundedSender<ConnectionEvent>,
    state_tx: watch::Sender<ConnectionState>,
    codec: ClientCodec,
    next_xid: i32,
    pending: HashMap<i32, ReplySender>,
    ping: PingState,
    set_watches: VecDeque<(SetWatches, SetWatchesSender)>,
    set_watches_in_flight: Option<SetWatchesSender>,
    closing: bool,
    close_xid: Option<i32>,
}

impl ConnectionTask {
    async fn run(mut self) {
        if let Err(error) = self.drive().await {
            self.fail(error);
        }
        self.finish();
    }

    async fn drive(&mut self) -> Result<(), ZkError> {
        self.set_state(ConnectionState::Connecting);
        let stream = match self.connect().await? {
            Some(stream) => stream,
            None => return Ok(()),
        };

        let (mut reader, mut writer) = stream.into_split();
        let mut buf = BytesMut::with_capacity(READ_BUFFER_SIZE);

        self.set_state(ConnectionState::Handshaking);
        self.emit(ConnectionEvent::Handshaking {
            conn: self.handle.clone(),
        });

        let request = match self.wait_attach().await? {
            Some(request) => request,
            None => return Ok(()),
        };
        let bytes = self.codec.encode_connect(&request)?;
        writer.write_all(&bytes).await?;

        let reply = match self.read_connect_reply(&mut reader, &mut buf).await? {
            Some(reply) => reply,
            None => return Ok(()),
        };
        self.emit(ConnectionEvent::ConnectReply {
            conn: self.handle.clone(),
            reply,
        });

        let timeout = match self.wait_established().await? {
            Some(timeout) => timeout,
            None => return Ok(()),
        };

        self.handle.inner.established.store(true, Ordering::Release);
        self.set_state(ConnectionState::Connected);
        self.emit(ConnectionEvent::Connected {
            conn: self.handle.clone(),
        });
        debug!("{} connected to {}", self.handle.id(), self.handle.backend());

        self.serve(reader, writer, buf, timeout).await
    }

    async fn connect(&mut self) -> Result<Option<TcpStream>, ZkError> {
        let backend = self.handle.backend().clone();
        let connect = connect_tcp(&backend, self.options.connect_timeout);
        tokio::pin!(connect);

        loop {
            tokio::select! {
                stream = &mut connect => return stream.map(Some),
                cmd = self.cmd_rx.recv() => match cmd {
                    None | Some(ConnCommand::Close) | Some(ConnCommand::Destroy) => return Ok(None),
                    Some(other) => other.refuse(ZkError::NotConnected),
                },
            }
        }
    }

    async fn wait_attach(&mut self) -> Result<Option<ConnectRequest>, ZkError> {
        while let Some(cmd) = self.cmd_rx.recv().await {
            match cmd {
                ConnCommand::Attach(request) => return Ok(Some(request)),
                ConnCommand::Reject(error) => return Err(error),
                ConnCommand::Close | ConnCommand::Destroy => return Ok(None),
                other => other.refuse(ZkError::NotConnected),
            }
        }
        Ok(None)
    }

    async fn wait_established(&mut self) -> Result<Option<Duration>, ZkError> {
        while let Some(cmd) = self.cmd_rx.recv().await {
            match cmd {
                ConnCommand::Established { timeout } => return Ok(Some(timeout)),
                ConnCommand::Reject(error) => return Err(error),
                ConnCommand::Close | ConnCommand::Destroy => return Ok(None),
                other => other.refuse(ZkError::NotConnected),
            }
        }
        Ok(None)
    }

    async fn read_connect_reply(
        &mut self,
        reader: &mut OwnedReadHalf,
        buf: &mut BytesMut,
    ) -> Result<Option<ConnectResponse>, ZkError> {
        let deadline = sleep(self.options.connect_timeout);
        tokio::pin!(deadline);

        loop {
            if let Some(inbound) = self.codec.decode(buf)? {
                let reply = match inbound {
                    Inbound::Connect(reply) => reply,
                    _ => return Err(ZkError::UnexpectedPacket),
                };
                if self.codec.has_frame(buf)? {
                    return Err(ZkError::UnexpectedPacket);
                }
                if reply.protocol_version != PROTOCOL_VERSION {
                    return Err(ZkError::VersionMismatch(reply.protocol_version));
                }
                return Ok(Some(reply));
            }

            tokio::select! {
                read = reader.read_buf(&mut *buf) => {
                    if read? == 0 {
                        return Err(ZkError::ConnectionLoss);
                    }
                }
                cmd = self.cmd_rx.recv() => match cmd {
                    None | Some(ConnCommand::Close) | Some(ConnCommand::Destroy) => return Ok(None),
                    Some(ConnCommand::Reject(error)) => return Err(error),
                    Some(other) => other.refuse(ZkError::NotConnected),
                },
                _ = &mut deadline => return Err(ZkError::ConnectTimeout),
            }
        }
    }

    async fn serve(
        &mut self,
        mut reader: OwnedReadHalf,
        mut writer: OwnedWriteHalf,
        mut buf: BytesMut,
        timeout: Duration,
    ) -> Result<(), ZkError> {
        let interval = ping_interval(timeout);
        let ping_timeout = ping_timeout(timeout);
        let mut ticker = interval_at(Instant::now() + interval, interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        // packets that arrived right behind the handshake reply
        if self.drain_frames(&mut buf, &mut writer).await? {
            return Ok(());
        }

        loop {
            let ping_deadline = self.ping.sent_at.map(|sent_at| sent_at + ping_timeout);

            tokio::select! {
                read = reader.read_buf(&mut buf) => {
                    if read? == 0 {
                        if self.close_xid.is_some() {
                            return Ok(());
                        }
                        return Err(ZkError::ConnectionLoss);
                    }
                    if self.drain_frames(&mut buf, &mut writer).await? {
                        return Ok(());
                    }
                }

                cmd = self.cmd_rx.recv() => match cmd {
                    None | Some(ConnCommand::Destroy) => return Ok(()),
                    Some(cmd) => self.handle_command(cmd, &mut writer).await?,
                },

                _ = ticker.tick() => {
                    if !self.closing && self.ping.sent_at.is_none() {
                        self.send_ping(&mut writer).await?;
                    }
                }

                _ = async {
                    match ping_deadline {
                        Some(deadline) => sleep_until(deadline).await,
                        None => std::future::pending().await,
                    }
                } => {
                    warn!(
                        "{} ping to {} unanswered after {:?}",
                        self.handle.id(),
                        self.handle.backend(),
                        ping_timeout
                    );
                    return Err(ZkError::PingTimeout(ping_timeout));
                }
            }
        }
    }

    /// Decode every buffered packet. Returns true once the close reply arrived.
    async fn drain_frames(
        &mut self,
        buf: &mut BytesMut,
        writer: &mut OwnedWriteHalf,
    ) -> Result<bool, ZkError> {
        while let Some(inbound) = self.codec.decode(buf)? {
            match inbound {
                Inbound::Connect(_) => return Err(ZkError::UnexpectedPacket),
                Inbound::Notification { header, event } => {
                    self.emit(ConnectionEvent::Notification {
                        conn: self.handle.clone(),
                        zxid: header.zxid,
                        event,
                    });
                }
                Inbound::Reply(reply) => {
                    self.emit(ConnectionEvent::Packet {
                        conn: self.handle.clone(),
                        zxid: reply.header.zxid,
                    });
                    if self.handle_reply(reply, writer).await? {
                        return Ok(true);
                    }
                }
            }
        }
        Ok(false)
    }

    async fn handle_reply(
        &mut self,
        reply: Reply,
        writer: &mut OwnedWriteHalf,
    ) -> Result<bool, ZkError> {
        let result = match reply.body {
            Some(body) => Ok(body),
            None => Err(ZkError::Server(reply.header.err)),
        };

        match reply.header.xid {
            XID_PING => {
                let rtt = self
                    .ping
                    .sent_at
                    .take()
                    .map(|sent_at| sent_at.elapsed())
                    .unwrap_or_default();
                trace!("{} ping rtt {:?}", self.handle.id(), rtt);
                for waiter in self.ping.waiters.drain(..) {
                    waiter.send(result.clone().map(|_| rtt)).ok();
                }
            }
            XID_SET_WATCHES => {
                if let Some(reply) = self.set_watches_in_flight.take() {
                    reply.send(result.map(|_| ())).ok();
                }
                self.send_next_set_watches(writer).await?;
            }
            XID_AUTH => {}
            xid if Some(xid) == self.close_xid => {
                debug!("{} session close acknowledged", self.handle.id());
                return Ok(true);
            }
            xid => {
                if let Some(reply) = self.pending.remove(&xid) {
                    reply.send(result).ok();
                }
                if self.closing && self.pending.is_empty() && self.close_xid.is_none() {
                    self.send_close(writer).await?;
                }
            }
        }
        Ok(false)
    }

    async fn handle_command(
        &mut self,
        cmd: ConnCommand,
        writer: &mut OwnedWriteHalf,
    ) -> Result<(), ZkError> {
        match cmd {
            ConnCommand::Request { request, reply } => {
                if self.closing {
                    reply.send(Err(ZkError::NotConnected)).ok();
                    return Ok(());
                }
                let xid = self.next_xid();
                match self.codec.encode_request(xid, &request) {
                    Ok(bytes) => {
                        self.pending.insert(xid, reply);
                        writer.write_all(&bytes).await?;
                    }
                    Err(error) => {
                        reply.send(Err(error.into())).ok();
                    }
                }
            }
            ConnCommand::Ping(reply) => {
                if self.closing {
                    reply.send(Err(ZkError::NotConnected)).ok();
                    return Ok(());
                }
                self.ping.waiters.push(reply);
                if self.ping.sent_at.is_none() {
                    self.send_ping(writer).await?;
                }
            }
            ConnCommand::SetWatches { watches, reply } => {
                self.set_watches.push_back((watches, reply));
                if self.set_watches_in_flight.is_none() {
                    self.send_next_set_watches(writer).await?;
                }
            }
            ConnCommand::Close => {
                if !self.closing {
                    self.closing = true;
                    self.set_state(ConnectionState::Closing);
                    if self.pending.is_empty() {
                        self.send_close(writer).await?;
                    }
                }
            }
            ConnCommand::Attach(_) | ConnCommand::Established { .. } | ConnCommand::Reject(_) => {
                debug!(
                    "{} ignoring handshake command while connected",
                    self.handle.id()
                );
            }
            ConnCommand::Destroy => {}
        }
        Ok(())
    }

    async fn send_ping(&mut self, writer: &mut OwnedWriteHalf) -> Result<(), ZkError> {
        let bytes = self.codec.encode_request(XID_PING, &Request::Ping)?;
        writer.write_all(&bytes).await?;
        self.ping.sent_at = Some(Instant::now());
        Ok(())
    }

    async fn send_next_set_watches(&mut self, writer: &mut OwnedWriteHalf) -> Result<(), ZkError> {
        if let Some((watches, reply)) = self.set_watches.pop_front() {
            let bytes = self
                .codec
                .encode_request(XID_SET_WATCHES, &Request::SetWatches(watches))?;
            self.set_watches_in_flight = Some(reply);
            writer.write_all(&bytes).await?;
        }
        Ok(())
    }

    async fn send_close(&mut self, writer: &mut OwnedWriteHalf) -> Result<(), ZkError> {
        let xid = self.next_xid();
        let bytes = self.codec.encode_request(xid, &Request::CloseSession)?;
        self.close_xid = Some(xid);
        writer.write_all(&bytes).await?;
        writer.shutdown().await?;
        debug!("{} sent session close (xid {})", self.handle.id(), xid);
        Ok(())
    }

    fn next_xid(&mut self) -> i32 {
        let xid = self.next_xid;
        self.next_xid = if xid == i32::MAX { 1 } else { xid + 1 };
        xid
    }

    fn fail(&mut self, error: ZkError) {
        info!(
            "{} to {} failed: {}",
            self.handle.id(),
            self.handle.backend(),
            error
        );
        self.set_state(ConnectionState::Error);
        self.fail_pending(&error);
        self.emit(ConnectionEvent::Error {
            conn: self.handle.clone(),
            error,
        });
    }

    fn fail_pending(&mut self, error: &ZkError) {
        for (_, reply) in self.pending.drain() {
            reply.send(Err(error.clone())).ok();
        }
        for waiter in self.ping.waiters.drain(..) {
            waiter.send(Err(error.clone())).ok();
        }
        if let Some(reply) = self.set_watches_in_flight.take() {
            reply.send(Err(error.clone())).ok();
        }
        for (_, reply) in self.set_watches.drain(..) {
            reply.send(Err(error.clone())).ok();
        }
    }

    fn finish(&mut self) {
        self.fail_pending(&ZkError::ConnectionLoss);
        self.cmd_rx.close();
        while let Ok(cmd) = self.cmd_rx.try_recv() {
            cmd.refuse(ZkError::ConnectionLoss);
        }
        self.set_state(ConnectionState::Closed);
        self.emit(ConnectionEvent::Closed {
            conn: self.handle.clone(),
        });
        debug!("{} closed", self.handle.id());
    }

    fn set_state(&self, state: ConnectionState) {
        trace!("{} -> {:?}", self.handle.id(), state);
        self.state_tx.send_replace(state);
    }

    fn emit(&self, event: ConnectionEvent) {
        self.events.send(event).ok();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use tokio::net::TcpListener;
    use zk_wire::{
        ErrorCode, ReplyHeader, ServerCodec, ServerInbound, Stat, MAX_PACKET_SIZE,
    };

    struct Peer {
        stream: TcpStream,
        codec: ServerCodec,
        buf: BytesMut,
    }

    impl Peer {
        async fn recv(&mut self) -> Option<ServerInbound> {
            loop {
                if let Some(packet) = self.codec.decode(&mut self.buf).unwrap() {
                    return Some(packet);
                }
                if self.stream.read_buf(&mut self.buf).await.unwrap() == 0 {
                    return None;
                }
            }
        }

        async fn send(&mut self, bytes: Bytes) {
            self.stream.write_all(&bytes).await.unwrap();
        }

        async fn accept_session(&mut self) {
            match self.recv().await {
                Some(ServerInbound::Connect(_)) => {}
                other => panic!("expected connect, got {:?}", other),
            }
            let reply = self.connect_response(0, 0x42);
            self.send(reply).await;
        }

        fn connect_response(&self, protocol_version: i32, session_id: i64) -> Bytes {
            self.codec
                .encode_connect_response(&ConnectResponse {
                    protocol_version,
                    timeout: 8000,
                    session_id,
                    passwd: Bytes::from_static(&[9u8; 16]),
                    read_only: false,
                })
                .unwrap()
        }
    }

    async fn setup() -> (
        ConnectionHandle,
        mpsc::UnboundedReceiver<ConnectionEvent>,
        Peer,
    ) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let options = ConnectionOptions {
            connect_timeout: Duration::from_secs(2),
            max_frame_size: MAX_PACKET_SIZE,
        };
        let conn = ConnectionHandle::spawn(
            ConnId(1),
            Backend::new("127.0.0.1", port),
            options,
            events_tx,
        );
        let (stream, _) = listener.accept().await.unwrap();
        let peer = Peer {
            stream,
            codec: ServerCodec::new(MAX_PACKET_SIZE),
            buf: BytesMut::new(),
        };
        (conn, events_rx, peer)
    }

    async fn handshake(
        conn: &ConnectionHandle,
        events: &mut mpsc::UnboundedReceiver<ConnectionEvent>,
        peer: &mut Peer,
    ) {
        assert!(matches!(
            events.recv().await,
            Some(ConnectionEvent::Handshaking { .. })
        ));
        conn.attach(ConnectRequest::new(8000));
        peer.accept_session().await;
        match events.recv().await {
            Some(ConnectionEvent::ConnectReply { reply, .. }) => {
                assert_eq!(reply.session_id, 0x42)
            }
            other => panic!("unexpected {:?}", other),
        }
        conn.establish(Duration::from_millis(8000));
        assert!(matches!(
            events.recv().await,
            Some(ConnectionEvent::Connected { .. })
        ));
        assert!(conn.is_connected());
    }

    #[tokio::test]
    async fn test_requests_are_correlated() {
        let (conn, mut events, mut peer) = setup().await;
        handshake(&conn, &mut events, &mut peer).await;

        let first = conn.submit(Request::Exists {
            path: "/a".to_string(),
            watch: false,
        });
        let second = conn.submit(Request::GetData {
            path: "/b".to_string(),
            watch: false,
        });

        let mut xids = Vec::new();
        for _ in 0..2 {
            match peer.recv().await {
                Some(ServerInbound::Request { header, .. }) => xids.push(header.xid),
                other => panic!("unexpected {:?}", other),
            }
        }
        assert_eq!(xids, vec![1, 2]);

        let ok = ReplyHeader {
            xid: 1,
            zxid: 0x10,
            err: ErrorCode::Ok,
        };
        let reply = peer
            .codec
            .encode_reply(
                &ok,
                Some(&Response::Exists {
                    stat: Stat::default(),
                }),
            )
            .unwrap();
        peer.send(reply).await;

        let missing = ReplyHeader {
            xid: 2,
            zxid: 0x10,
            err: ErrorCode::NoNode,
        };
        let reply = peer.codec.encode_reply(&missing, None).unwrap();
        peer.send(reply).await;

        assert!(matches!(first.await.unwrap(), Ok(Response::Exists { .. })));
        assert!(second.await.unwrap().unwrap_err().is_no_node());
        assert!(matches!(
            events.recv().await,
            Some(ConnectionEvent::Packet { zxid: 0x10, .. })
        ));
    }

    #[tokio::test]
    async fn test_eof_fails_pending_requests() {
        let (conn, mut events, mut peer) = setup().await;
        handshake(&conn, &mut events, &mut peer).await;

        let pending = conn.submit(Request::Sync {
            path: "/".to_string(),
        });
        assert!(peer.recv().await.is_some());
        drop(peer);

        assert!(matches!(
            pending.await.unwrap(),
            Err(ZkError::ConnectionLoss)
        ));
        match events.recv().await {
            Some(ConnectionEvent::Error { error, .. }) => {
                assert!(matches!(error, ZkError::ConnectionLoss))
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(matches!(
            events.recv().await,
            Some(ConnectionEvent::Closed { .. })
        ));
        conn.closed().await;

        // a dead connection refuses new work immediately
        let late = conn
            .request(Request::Sync {
                path: "/".to_string(),
            })
            .await;
        assert!(matches!(late, Err(ZkError::ConnectionLoss)));
    }

    #[tokio::test]
    async fn test_extra_packet_during_handshake() {
        let (conn, mut events, mut peer) = setup().await;
        assert!(matches!(
            events.recv().await,
            Some(ConnectionEvent::Handshaking { .. })
        ));
        conn.attach(ConnectRequest::new(8000));
        assert!(matches!(
            peer.recv().await,
            Some(ServerInbound::Connect(_))
        ));

        let mut both = BytesMut::new();
        both.extend_from_slice(&peer.connect_response(0, 0x42));
        both.extend_from_slice(&peer.connect_response(0, 0x42));
        peer.send(both.freeze()).await;

        match events.recv().await {
            Some(ConnectionEvent::Error { error, .. }) => {
                assert!(matches!(error, ZkError::UnexpectedPacket))
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(!conn.wait_established().await);
    }

    #[tokio::test]
    async fn test_version_mismatch() {
        let (conn, mut events, mut peer) = setup().await;
        events.recv().await;
        conn.attach(ConnectRequest::new(8000));
        peer.recv().await;
        let reply = peer.connect_response(1, 0x42);
        peer.send(reply).await;

        match events.recv().await {
            Some(ConnectionEvent::Error { error, .. }) => {
                assert!(matches!(error, ZkError::VersionMismatch(1)))
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_ping_round_trip() {
        let (conn, mut events, mut peer) = setup().await;
        handshake(&conn, &mut events, &mut peer).await;

        let ping = tokio::spawn({
            let conn = conn.clone();
            async move { conn.ping().await }
        });
        match peer.recv().await {
            Some(ServerInbound::Request { header, request }) => {
                assert_eq!(header.xid, XID_PING);
                assert_eq!(request, Request::Ping);
            }
            other => panic!("unexpected {:?}", other),
        }
        let pong = ReplyHeader {
            xid: XID_PING,
            zxid: 0x11,
            err: ErrorCode::Ok,
        };
        let reply = peer.codec.encode_reply(&pong, None).unwrap();
        peer.send(reply).await;

        assert!(ping.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_graceful_close_drains_requests() {
        let (conn, mut events, mut peer) = setup().await;
        handshake(&conn, &mut events, &mut peer).await;

        let pending = conn.submit(Request::Delete {
            path: "/a".to_string(),
            version: -1,
        });
        assert!(peer.recv().await.is_some());
        conn.close();

        // refused while draining
        let refused = conn
            .request(Request::Sync {
                path: "/".to_string(),
            })
            .await;
        assert!(matches!(refused, Err(ZkError::NotConnected)));

        let ok = ReplyHeader {
            xid: 1,
            zxid: 0x20,
            err: ErrorCode::Ok,
        };
        let reply = peer.codec.encode_reply(&ok, None).unwrap();
        peer.send(reply).await;
        assert!(pending.await.unwrap().is_ok());

        let close_xid = match peer.recv().await {
            Some(ServerInbound::Request { header, request }) => {
                assert_eq!(request, Request::CloseSession);
                header.xid
            }
            other => panic!("unexpected {:?}", other),
        };
        assert_eq!(close_xid, 2);
        let ack = ReplyHeader {
            xid: close_xid,
            zxid: 0x21,
            err: ErrorCode::Ok,
        };
        let reply = peer.codec.encode_reply(&ack, None).unwrap();
        peer.send(reply).await;

        conn.closed().await;
        assert_eq!(conn.state(), ConnectionState::Closed);
    }

    #[test]
    fn test_ping_timing() {
        assert_eq!(ping_interval(Duration::from_secs(30)), Duration::from_millis(7500));
        assert_eq!(ping_timeout(Duration::from_secs(30)), Duration::from_millis(3750));
        assert_eq!(ping_interval(Duration::from_secs(4)), MIN_PING_INTERVAL);
        assert_eq!(ping_timeout(Duration::from_secs(4)), MIN_PING_INTERVAL);
    }
}
