//! Session state machine and the driver task that owns it.
//!
//! The session outlives individual connections: it decides whether a lost
//! connection can be replaced (`detached`) or the session is gone
//! (`expired`), hands the session over between connections and keeps the
//! per-path watchers in step with whatever connection is current.
//!
//! ```text
//! detached → attaching ⇄ attached ⇄ reattaching → (closing | expired) → closed
//! ```

use bytes::Bytes;
use futures::future::BoxFuture;
use futures::stream::FuturesUnordered;
use futures::{FutureExt, StreamExt};
use std::collections::HashMap;
use std::mem;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep, sleep_until, Instant};
use tracing::{debug, error, info, trace, warn};
use zk_wire::{
    ConnectRequest, ConnectResponse, KeeperState, SetWatches, WatcherEvent, PROTOCOL_VERSION,
};

use crate::connection::{ping_interval, ping_timeout, ConnectionEvent, ConnectionHandle};
use crate::error::ZkError;
use crate::watch::{NodeEvent, SessionView, WatchCategory, WatchInput, WatchKind};
use crate::watcher::{WatcherEntry, WatcherRequest};

const FRESH_PASSWD: [u8; 16] = [0u8; 16];

/// Session lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    /// No connection
    Detached,
    /// Binding a connection with no other connection around
    Attaching,
    /// Steady state
    Attached,
    /// Binding a replacement while the previous connection still serves
    Reattaching,
    /// Graceful close in progress
    Closing,
    /// The server forgot the session; terminal
    Expired,
    /// Closed by the client; terminal
    Closed,
}

/// Client-level events
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientEvent {
    /// A brand new session was created
    Session {
        /// Server-assigned session id
        id: i64,
    },
    /// The session is attached to a connected connection
    Connect,
    /// The session lost its connected connection
    Disconnect,
    /// The session expired
    Expire,
    /// The pool gave up reaching any backend
    Failed,
    /// The client was closed
    Close,
}

/// Point-in-time view of the session published to the facade
#[derive(Debug, Clone, PartialEq)]
pub struct SessionSnapshot {
    /// Lifecycle state
    pub state: SessionState,
    /// Session id, 0 before the first attach
    pub session_id: i64,
    /// Negotiated (or requested) session timeout
    pub timeout: Duration,
    /// Current connection, only while attached
    pub connection: Option<ConnectionHandle>,
    /// Whether `connection` accepts requests
    pub connected: bool,
}

/// Liveness predicate used at every disconnection point
pub fn is_alive(session_id: i64, since_last_packet: Duration, timeout: Duration) -> bool {
    session_id != 0 && since_last_packet < timeout
}

/// Commands from the facade and the watcher handles
pub(crate) enum DriverCommand {
    Subscribe {
        path: String,
        kind: WatchKind,
        id: u64,
        tx: mpsc::UnboundedSender<NodeEvent>,
    },
    Unsubscribe {
        path: String,
        id: u64,
    },
    Close {
        done: oneshot::Sender<()>,
    },
}

/// Work produced by the session for the driver to carry out
#[derive(Debug)]
pub(crate) enum SessionEffect {
    Emit(ClientEvent),
    Watch {
        path: String,
        request: WatcherRequest,
    },
    Resume {
        conn: ConnectionHandle,
        watches: SetWatches,
        targets: Vec<(String, WatchCategory)>,
    },
}

/// The logical session. Owned by one driver task, one method per input.
pub(crate) struct Session {
    epoch: u64,
    state: SessionState,
    session_id: i64,
    passwd: Bytes,
    timeout: Duration,
    last_zxid: i64,
    last_packet: Option<Instant>,
    conn: Option<ConnectionHandle>,
    old_conn: Option<ConnectionHandle>,
    watchers: HashMap<String, WatcherEntry>,
    announced: bool,
    effects: Vec<SessionEffect>,
}

impl Session {
    pub(crate) fn new(timeout: Duration, epoch: u64) -> Self {
        Self {
            epoch,
            state: SessionState::Detached,
            session_id: 0,
            passwd: Bytes::from_static(&FRESH_PASSWD),
            timeout,
            last_zxid: 0,
            last_packet: None,
            conn: None,
            old_conn: None,
            watchers: HashMap::new(),
            announced: false,
            effects: Vec::new(),
        }
    }

    pub(crate) fn epoch(&self) -> u64 {
        self.epoch
    }

    pub(crate) fn state(&self) -> SessionState {
        self.state
    }

    /// Connection requests should go to; only set while attached
    pub(crate) fn connection(&self) -> Option<&ConnectionHandle> {
        match self.state {
            SessionState::Attached => self.conn.as_ref(),
            _ => None,
        }
    }

    pub(crate) fn view(&self) -> SessionView {
        let conn = self.connection();
        SessionView {
            attached: conn.is_some(),
            connected: conn.is_some_and(ConnectionHandle::is_connected),
        }
    }

    pub(crate) fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            state: self.state,
            session_id: self.session_id,
            timeout: self.timeout,
            connection: self.connection().cloned(),
            connected: self.view().connected,
        }
    }

    pub(crate) fn take_effects(&mut self) -> Vec<SessionEffect> {
        mem::take(&mut self.effects)
    }

    pub(crate) fn alive(&self) -> bool {
        self.last_packet
            .is_some_and(|at| is_alive(self.session_id, at.elapsed(), self.timeout))
    }

    /// When the session expires unless another packet arrives.
    ///
    /// An attached session only hears from the server through pings, so its
    /// deadline leaves room for a full ping round; any other state gets one
    /// session timeout.
    pub(crate) fn expiry_deadline(&self) -> Option<Instant> {
        let window = match self.state {
            SessionState::Expired | SessionState::Closed => return None,
            _ if self.session_id == 0 => return None,
            SessionState::Attached => self
                .timeout
                .max(ping_interval(self.timeout) + ping_timeout(self.timeout)),
            _ => self.timeout,
        };
        self.last_packet.map(|at| at + window)
    }

    fn connect_request(&self) -> ConnectRequest {
        ConnectRequest {
            protocol_version: PROTOCOL_VERSION,
            last_zxid_seen: self.last_zxid,
            timeout: i32::try_from(self.timeout.as_millis()).unwrap_or(i32::MAX),
            session_id: self.session_id,
            passwd: self.passwd.clone(),
            read_only: false,
        }
    }

    fn owns(&self, conn: &ConnectionHandle) -> bool {
        self.conn.as_ref() == Some(conn) || self.old_conn.as_ref() == Some(conn)
    }

    fn transition(&mut self, next: SessionState) {
        if self.state == next {
            return;
        }
        debug!(
            "session {:016x}: {:?} -> {:?}",
            self.session_id, self.state, next
        );
        self.state = next;
        self.broadcast_watchers(WatchInput::Advance);
    }

    fn emit(&mut self, event: ClientEvent) {
        self.effects.push(SessionEffect::Emit(event));
    }

    fn leave_connected(&mut self) {
        if mem::replace(&mut self.announced, false) {
            self.emit(ClientEvent::Disconnect);
        }
    }

    /// A connection opened its socket and wants a connect payload
    pub(crate) fn on_handshaking(&mut self, conn: ConnectionHandle) {
        match self.state {
            SessionState::Detached => {
                debug!("attaching session via {} ({})", conn.backend(), conn.id());
                conn.attach(self.connect_request());
                self.conn = Some(conn);
                self.transition(SessionState::Attaching);
            }
            SessionState::Attached => {
                debug!(
                    "reattaching session {:016x} via {} ({})",
                    self.session_id,
                    conn.backend(),
                    conn.id()
                );
                conn.attach(self.connect_request());
                self.old_conn = self.conn.replace(conn);
                self.transition(SessionState::Reattaching);
            }
            SessionState::Attaching | SessionState::Reattaching => {
                conn.reject(ZkError::AttachInProgress);
            }
            SessionState::Expired => conn.reject(ZkError::SessionExpired),
            SessionState::Closing | SessionState::Closed => conn.reject(ZkError::Closed),
        }
    }

    /// The server answered the connect payload
    pub(crate) fn on_connect_reply(&mut self, conn: ConnectionHandle, reply: ConnectResponse) {
        let attaching = matches!(
            self.state,
            SessionState::Attaching | SessionState::Reattaching
        );
        if !attaching || self.conn.as_ref() != Some(&conn) {
            conn.reject(ZkError::AttachInProgress);
            return;
        }

        if reply.session_id == 0 {
            debug!(
                "{} refused to resume session {:016x}",
                conn.backend(),
                self.session_id
            );
            conn.reject(ZkError::SessionExpired);
            self.conn = None;
            if self.state == SessionState::Reattaching {
                self.revert();
            } else if self.session_id != 0 && !self.alive() {
                self.expire();
            } else {
                self.transition(SessionState::Detached);
            }
            return;
        }

        if self.session_id != 0 && reply.session_id != self.session_id {
            warn!(
                "{} answered with session {:016x} instead of {:016x}",
                conn.backend(),
                reply.session_id,
                self.session_id
            );
            conn.reject(ZkError::SessionExpired);
            self.conn = None;
            self.expire();
            return;
        }

        let fresh = self.session_id == 0;
        self.session_id = reply.session_id;
        self.passwd = reply.passwd;
        self.timeout = Duration::from_millis(u64::try_from(reply.timeout).unwrap_or(0));
        self.last_packet = Some(Instant::now());
        conn.establish(self.timeout);

        if self.state == SessionState::Reattaching {
            if let Some(old) = self.old_conn.take() {
                old.destroy();
            }
            info!(
                "moved zookeeper session {:016x} to {} with timeout {} ms",
                self.session_id,
                conn.backend(),
                reply.timeout
            );
            // server-side watches belong to the old socket
            self.broadcast_watchers(WatchInput::Disconnected);
        } else {
            info!(
                "{} zookeeper session {:016x} with timeout {} ms",
                if fresh { "created" } else { "resumed" },
                self.session_id,
                reply.timeout
            );
        }

        if fresh {
            self.emit(ClientEvent::Session {
                id: self.session_id,
            });
        }
        self.transition(SessionState::Attached);
    }

    /// The current connection finished its handshake
    pub(crate) fn on_connected(&mut self, conn: ConnectionHandle) {
        if self.connection() != Some(&conn) {
            return;
        }
        if !self.announced {
            self.announced = true;
            self.emit(ClientEvent::Connect);
        }
        self.resume_watches(conn);
        self.broadcast_watchers(WatchInput::Advance);
    }

    /// A reply arrived on one of our connections
    pub(crate) fn on_packet(&mut self, conn: &ConnectionHandle, zxid: i64) {
        if !self.owns(conn) {
            return;
        }
        self.last_packet = Some(Instant::now());
        self.last_zxid = self.last_zxid.max(zxid);
    }

    /// A watch notification arrived on one of our connections
    pub(crate) fn on_notification(&mut self, conn: &ConnectionHandle, event: WatcherEvent) {
        if !self.owns(conn) {
            return;
        }
        self.last_packet = Some(Instant::now());

        if event.state != KeeperState::SyncConnected {
            warn!(
                "received notification with bad state {:?} ({:?} for {})",
                event.state, event.event_type, event.path
            );
            return;
        }

        trace!("notification {:?} for {}", event.event_type, event.path);
        let view = self.view();
        let routed = self
            .watchers
            .get_mut(&event.path)
            .and_then(|entry| entry.notify(event.event_type, view));
        match routed {
            Some(requests) => self.push_watch(&event.path, requests),
            None => error!(
                "notification {:?} for {} matches no armed watch",
                event.event_type, event.path
            ),
        }
        self.prune(&event.path);
    }

    /// A connection failed or closed
    pub(crate) fn on_connection_lost(&mut self, conn: ConnectionHandle, error: Option<ZkError>) {
        if self.old_conn.as_ref() == Some(&conn) {
            debug!("previous connection {} to {} ended", conn.id(), conn.backend());
            self.old_conn = None;
            return;
        }
        if self.conn.as_ref() != Some(&conn) {
            return;
        }
        match &error {
            Some(error) => info!(
                "lost connection {} to {}: {}",
                conn.id(),
                conn.backend(),
                error
            ),
            None => debug!("connection {} to {} closed", conn.id(), conn.backend()),
        }
        self.conn = None;

        match self.state {
            SessionState::Attached => {
                self.leave_connected();
                self.broadcast_watchers(WatchInput::Disconnected);
                if self.alive() {
                    self.transition(SessionState::Detached);
                } else {
                    self.expire();
                }
            }
            SessionState::Attaching => {
                if self.session_id != 0 && !self.alive() {
                    self.expire();
                } else {
                    self.transition(SessionState::Detached);
                }
            }
            SessionState::Reattaching => self.revert(),
            SessionState::Closing => self.finish_close(),
            _ => {}
        }
    }

    /// The expiry deadline passed
    pub(crate) fn on_expiry(&mut self) {
        match self.expiry_deadline() {
            Some(deadline) if deadline <= Instant::now() && !self.alive() => {}
            _ => return,
        }
        match self.state {
            SessionState::Reattaching => self.revert(),
            SessionState::Closing => self.finish_close(),
            _ => self.expire(),
        }
    }

    /// Begin a graceful close
    pub(crate) fn close(&mut self) {
        if self.state == SessionState::Reattaching {
            if let Some(new) = self.conn.take() {
                new.destroy();
            }
            self.conn = self.old_conn.take();
        }
        match self.state {
            SessionState::Attached | SessionState::Reattaching => match &self.conn {
                Some(conn) => {
                    info!("closing zookeeper session {:016x}", self.session_id);
                    conn.close();
                    self.transition(SessionState::Closing);
                }
                None => self.finish_close(),
            },
            SessionState::Detached | SessionState::Attaching => self.finish_close(),
            SessionState::Expired => self.state = SessionState::Closed,
            SessionState::Closing | SessionState::Closed => {}
        }
    }

    /// Drop every connection without closing the session server-side
    pub(crate) fn abandon(&mut self) {
        for conn in [self.conn.take(), self.old_conn.take()].into_iter().flatten() {
            conn.destroy();
        }
    }

    fn revert(&mut self) {
        if let Some(new) = self.conn.take() {
            new.destroy();
        }
        match self.old_conn.take() {
            Some(old) if old.is_connected() && self.alive() => {
                debug!(
                    "keeping session {:016x} on {} after failed move",
                    self.session_id,
                    old.backend()
                );
                self.conn = Some(old);
                self.transition(SessionState::Attached);
            }
            old => {
                if let Some(old) = old {
                    old.destroy();
                }
                self.leave_connected();
                self.broadcast_watchers(WatchInput::Disconnected);
                if self.alive() {
                    self.transition(SessionState::Detached);
                } else {
                    self.expire();
                }
            }
        }
    }

    fn expire(&mut self) {
        warn!("zookeeper session {:016x} expired", self.session_id);
        self.abandon();
        self.leave_connected();
        // dropping the entries ends every subscription
        self.watchers.clear();
        self.transition(SessionState::Expired);
        self.emit(ClientEvent::Expire);
    }

    fn finish_close(&mut self) {
        self.abandon();
        self.leave_connected();
        self.watchers.clear();
        info!("zookeeper session {:016x} closed", self.session_id);
        self.transition(SessionState::Closed);
    }

    fn resume_watches(&mut self, conn: ConnectionHandle) {
        let mut targets: Vec<(String, WatchCategory)> = self
            .watchers
            .values()
            .flat_map(|entry| {
                entry
                    .resuming()
                    .map(move |category| (entry.path().to_string(), category))
            })
            .collect();
        if targets.is_empty() {
            return;
        }
        targets.sort();

        let mut watches = SetWatches {
            relative_zxid: self.last_zxid,
            ..SetWatches::default()
        };
        for (path, category) in &targets {
            let list = match category {
                WatchCategory::DataChanged => &mut watches.data_watches,
                WatchCategory::CreatedOrDeleted => &mut watches.exist_watches,
                WatchCategory::ChildrenChanged => &mut watches.child_watches,
            };
            list.push(path.clone());
        }

        info!(
            "re-arming {} node watchers at zxid {:x}",
            targets.len(),
            self.last_zxid
        );
        self.effects.push(SessionEffect::Resume {
            conn,
            watches,
            targets,
        });
    }

    /// Outcome of a bulk re-registration
    pub(crate) fn on_resume_result(
        &mut self,
        targets: Vec<(String, WatchCategory)>,
        result: Result<(), ZkError>,
    ) {
        let input = match &result {
            Ok(()) => WatchInput::Resumed,
            Err(error) => {
                warn!("failed to re-arm {} watchers: {}", targets.len(), error);
                WatchInput::ResumeFailed
            }
        };
        for (path, category) in targets {
            self.watch_input(&path, category, input.clone());
        }
    }

    pub(crate) fn subscribe(
        &mut self,
        path: String,
        kind: WatchKind,
        id: u64,
        tx: mpsc::UnboundedSender<NodeEvent>,
    ) {
        let view = self.view();
        let requests = self
            .watchers
            .entry(path.clone())
            .or_insert_with(|| WatcherEntry::new(&path))
            .subscribe(kind, id, tx, view);
        self.push_watch(&path, requests);
    }

    pub(crate) fn unsubscribe(&mut self, path: &str, id: u64) {
        let view = self.view();
        if let Some(entry) = self.watchers.get_mut(path) {
            let requests = entry.unsubscribe(id, view);
            self.push_watch(path, requests);
            self.prune(path);
        }
    }

    pub(crate) fn watch_input(&mut self, path: &str, category: WatchCategory, input: WatchInput) {
        let view = self.view();
        if let Some(entry) = self.watchers.get_mut(path) {
            let requests = entry.input(category, input, view);
            self.push_watch(path, requests);
            self.prune(path);
        }
    }

    fn broadcast_watchers(&mut self, input: WatchInput) {
        let view = self.view();
        for entry in self.watchers.values_mut() {
            let requests = entry.broadcast(input.clone(), view);
            let path = entry.path();
            self.effects
                .extend(requests.into_iter().map(|request| SessionEffect::Watch {
                    path: path.to_string(),
                    request,
                }));
        }
    }

    fn push_watch(&mut self, path: &str, requests: Vec<WatcherRequest>) {
        self.effects
            .extend(requests.into_iter().map(|request| SessionEffect::Watch {
                path: path.to_string(),
                request,
            }));
    }

    fn prune(&mut self, path: &str) {
        if self.watchers.get(path).is_some_and(WatcherEntry::is_idle) {
            self.watchers.remove(path);
        }
    }
}

enum Outcome {
    Arm {
        path: String,
        category: WatchCategory,
        generation: u64,
        result: Result<zk_wire::Response, ZkError>,
    },
    Retry {
        path: String,
        category: WatchCategory,
        generation: u64,
    },
    Resume {
        targets: Vec<(String, WatchCategory)>,
        result: Result<(), ZkError>,
    },
}

/// In-flight work tagged with the session it belongs to
struct Completion {
    epoch: u64,
    outcome: Outcome,
}

/// Channels wiring the driver to the facade and the pool
pub(crate) struct DriverChannels {
    pub(crate) conn_events: mpsc::UnboundedReceiver<ConnectionEvent>,
    pub(crate) commands: mpsc::UnboundedReceiver<DriverCommand>,
    pub(crate) events: broadcast::Sender<ClientEvent>,
    pub(crate) snapshot: watch::Sender<SessionSnapshot>,
}

/// Task owning the current `Session`
pub(crate) struct SessionDriver {
    session: Session,
    requested_timeout: Duration,
    closing: bool,
    close_waiters: Vec<oneshot::Sender<()>>,
    conn_events: mpsc::UnboundedReceiver<ConnectionEvent>,
    commands: mpsc::UnboundedReceiver<DriverCommand>,
    inflight: FuturesUnordered<BoxFuture<'static, Completion>>,
    events: broadcast::Sender<ClientEvent>,
    snapshot: watch::Sender<SessionSnapshot>,
}

impl SessionDriver {
    pub(crate) fn spawn(requested_timeout: Duration, channels: DriverChannels) -> JoinHandle<()> {
        let driver = SessionDriver {
            session: Session::new(requested_timeout, 0),
            requested_timeout,
            closing: false,
            close_waiters: Vec::new(),
            conn_events: channels.conn_events,
            commands: channels.commands,
            inflight: FuturesUnordered::new(),
            events: channels.events,
            snapshot: channels.snapshot,
        };
        tokio::spawn(driver.run())
    }

    async fn run(mut self) {
        loop {
            let expiry = self.session.expiry_deadline();
            tokio::select! {
                Some(event) = self.conn_events.recv() => self.on_connection_event(event),
                command = self.commands.recv() => match command {
                    Some(command) => self.on_command(command),
                    None => {
                        debug!("session driver stopping");
                        self.session.abandon();
                        break;
                    }
                },
                Some(completion) = self.inflight.next(), if !self.inflight.is_empty() => {
                    self.on_completion(completion);
                }
                _ = async {
                    match expiry {
                        Some(deadline) => sleep_until(deadline).await,
                        None => std::future::pending().await,
                    }
                } => self.session.on_expiry(),
            }
            self.flush();
        }
    }

    fn renew_if_expired(&mut self) {
        if self.session.state() == SessionState::Expired && !self.closing {
            let epoch = self.session.epoch() + 1;
            debug!("starting a fresh session after expiry");
            self.session = Session::new(self.requested_timeout, epoch);
        }
    }

    fn on_connection_event(&mut self, event: ConnectionEvent) {
        match event {
            ConnectionEvent::Handshaking { conn } => {
                self.renew_if_expired();
                self.session.on_handshaking(conn);
            }
            ConnectionEvent::ConnectReply { conn, reply } => {
                self.session.on_connect_reply(conn, reply)
            }
            ConnectionEvent::Connected { conn } => self.session.on_connected(conn),
            ConnectionEvent::Packet { conn, zxid } => self.session.on_packet(&conn, zxid),
            ConnectionEvent::Notification { conn, event, .. } => {
                self.session.on_notification(&conn, event)
            }
            ConnectionEvent::Error { conn, error } => {
                self.session.on_connection_lost(conn, Some(error))
            }
            ConnectionEvent::Closed { conn } => self.session.on_connection_lost(conn, None),
        }
    }

    fn on_command(&mut self, command: DriverCommand) {
        match command {
            DriverCommand::Subscribe { path, kind, id, tx } => {
                if self.closing {
                    return;
                }
                self.renew_if_expired();
                self.session.subscribe(path, kind, id, tx);
            }
            DriverCommand::Unsubscribe { path, id } => self.session.unsubscribe(&path, id),
            DriverCommand::Close { done } => {
                self.closing = true;
                self.close_waiters.push(done);
                self.session.close();
            }
        }
    }

    fn on_completion(&mut self, completion: Completion) {
        if completion.epoch != self.session.epoch() {
            return;
        }
        match completion.outcome {
            Outcome::Arm {
                path,
                category,
                generation,
                result,
            } => self.session.watch_input(
                &path,
                category,
                WatchInput::ArmResult { generation, result },
            ),
            Outcome::Retry {
                path,
                category,
                generation,
            } => self
                .session
                .watch_input(&path, category, WatchInput::Retry { generation }),
            Outcome::Resume { targets, result } => self.session.on_resume_result(targets, result),
        }
    }

    fn flush(&mut self) {
        let epoch = self.session.epoch();
        for effect in self.session.take_effects() {
            match effect {
                SessionEffect::Emit(event) => {
                    self.events.send(event).ok();
                }
                SessionEffect::Watch { path, request } => self.schedule(epoch, path, request),
                SessionEffect::Resume {
                    conn,
                    watches,
                    targets,
                } => {
                    let reply = conn.set_watches(watches);
                    self.inflight.push(
                        async move {
                            let result = reply.await.unwrap_or(Err(ZkError::ConnectionLoss));
                            Completion {
                                epoch,
                                outcome: Outcome::Resume { targets, result },
                            }
                        }
                        .boxed(),
                    );
                }
            }
        }

        if self.session.state() == SessionState::Closed {
            for done in self.close_waiters.drain(..) {
                done.send(()).ok();
            }
        }

        let snapshot = self.session.snapshot();
        self.snapshot.send_if_modified(|current| {
            if *current == snapshot {
                return false;
            }
            *current = snapshot;
            true
        });
    }

    fn schedule(&mut self, epoch: u64, path: String, request: WatcherRequest) {
        match request {
            WatcherRequest::Arm {
                category,
                request,
                generation,
            } => {
                let reply = self.session.connection().map(|conn| conn.submit(request));
                self.inflight.push(
                    async move {
                        let result = match reply {
                            Some(reply) => reply.await.unwrap_or(Err(ZkError::ConnectionLoss)),
                            None => Err(ZkError::NotConnected),
                        };
                        Completion {
                            epoch,
                            outcome: Outcome::Arm {
                                path,
                                category,
                                generation,
                                result,
                            },
                        }
                    }
                    .boxed(),
                );
            }
            WatcherRequest::Retry {
                category,
                delay,
                generation,
            } => {
                self.inflight.push(
                    async move {
                        sleep(delay).await;
                        Completion {
                            epoch,
                            outcome: Outcome::Retry {
                                path,
                                category,
                                generation,
                            },
                        }
                    }
                    .boxed(),
                );
            }
        }
    }
}
