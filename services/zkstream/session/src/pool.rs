//! Backend pool.
//!
//! Keeps one live connection to a listed backend, round-robins over a
//! shuffled server list, backs off after failed attempts and opens a
//! replacement when the backend list changes under a live connection.

use futures::future::BoxFuture;
use futures::stream::FuturesUnordered;
use futures::{FutureExt, StreamExt};
use rand::seq::SliceRandom;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time::{sleep_until, Instant};
use tracing::{debug, info, warn};

use crate::config::{Backend, RetryPolicy};
use crate::connection::{ConnId, ConnectionEvent, ConnectionHandle, ConnectionOptions};
use crate::session::ClientEvent;

/// Builds connection attempts for the pool
pub trait ConnectionFactory: Send + Sync + 'static {
    /// Start a connection attempt to `backend`
    fn connect(&self, backend: &Backend) -> ConnectionHandle;
}

/// Factory spawning TCP connection tasks that report to one session driver
#[derive(Debug)]
pub struct TcpConnectionFactory {
    next_id: AtomicU64,
    options: ConnectionOptions,
    events: mpsc::UnboundedSender<ConnectionEvent>,
}

impl TcpConnectionFactory {
    /// Create a factory whose connections report on `events`
    pub fn new(options: ConnectionOptions, events: mpsc::UnboundedSender<ConnectionEvent>) -> Self {
        Self {
            next_id: AtomicU64::new(1),
            options,
            events,
        }
    }
}

impl ConnectionFactory for TcpConnectionFactory {
    fn connect(&self, backend: &Backend) -> ConnectionHandle {
        let id = ConnId(self.next_id.fetch_add(1, Ordering::Relaxed));
        ConnectionHandle::spawn(id, backend.clone(), self.options, self.events.clone())
    }
}

enum PoolCommand {
    SetBackends(Vec<Backend>),
    Stop(oneshot::Sender<()>),
}

enum Monitor {
    Settled {
        conn: ConnectionHandle,
        established: bool,
    },
    Ended {
        conn: ConnectionHandle,
    },
}

/// Handle to a running backend pool
#[derive(Debug, Clone)]
pub struct PoolHandle {
    commands: mpsc::UnboundedSender<PoolCommand>,
}

impl std::fmt::Debug for PoolCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PoolCommand::SetBackends(backends) => {
                f.debug_tuple("SetBackends").field(backends).finish()
            }
            PoolCommand::Stop(_) => f.write_str("Stop"),
        }
    }
}

impl PoolHandle {
    /// Replace the backend list
    pub fn set_backends(&self, backends: Vec<Backend>) {
        self.commands.send(PoolCommand::SetBackends(backends)).ok();
    }

    /// Destroy every connection and stop the pool
    pub async fn stop(&self) {
        let (done, rx) = oneshot::channel();
        if self.commands.send(PoolCommand::Stop(done)).is_ok() {
            rx.await.ok();
        }
    }
}

/// Pool task state
pub struct BackendPool {
    backends: Vec<Backend>,
    cursor: usize,
    factory: Arc<dyn ConnectionFactory>,
    policy: RetryPolicy,
    events: broadcast::Sender<ClientEvent>,
    commands: mpsc::UnboundedReceiver<PoolCommand>,
    live: Vec<ConnectionHandle>,
    monitors: FuturesUnordered<BoxFuture<'static, Monitor>>,
    failures: u32,
    ever_established: bool,
    failed_reported: bool,
    next_attempt: Instant,
}

impl BackendPool {
    /// Spawn the pool task
    pub fn spawn(
        backends: Vec<Backend>,
        policy: RetryPolicy,
        factory: Arc<dyn ConnectionFactory>,
        events: broadcast::Sender<ClientEvent>,
    ) -> PoolHandle {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut pool = BackendPool {
            backends: Vec::new(),
            cursor: 0,
            factory,
            policy,
            events,
            commands: rx,
            live: Vec::new(),
            monitors: FuturesUnordered::new(),
            failures: 0,
            ever_established: false,
            failed_reported: false,
            next_attempt: Instant::now(),
        };
        pool.set_backends(backends);
        tokio::spawn(pool.run());
        PoolHandle { commands: tx }
    }

    async fn run(mut self) {
        loop {
            let attempt = self.needs_connection().then_some(self.next_attempt);
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(PoolCommand::SetBackends(backends)) => self.set_backends(backends),
                    Some(PoolCommand::Stop(done)) => {
                        self.stop();
                        done.send(()).ok();
                        break;
                    }
                    None => {
                        self.stop();
                        break;
                    }
                },
                Some(monitor) = self.monitors.next(), if !self.monitors.is_empty() => {
                    self.on_monitor(monitor);
                }
                _ = async {
                    match attempt {
                        Some(at) => sleep_until(at).await,
                        None => std::future::pending().await,
                    }
                } => self.open_next(),
            }
        }
        debug!("backend pool stopped");
    }

    /// No live connection points at a listed backend
    fn needs_connection(&self) -> bool {
        !self.backends.is_empty()
            && !self
                .live
                .iter()
                .any(|conn| self.backends.contains(conn.backend()))
    }

    fn set_backends(&mut self, mut backends: Vec<Backend>) {
        backends.shuffle(&mut rand::thread_rng());
        info!(
            "backend list: {}",
            backends
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join(", ")
        );
        self.backends = backends;
        self.cursor = 0;
        if self.needs_connection() && !self.live.is_empty() {
            debug!("live connections point at removed backends, opening a replacement");
            self.next_attempt = Instant::now();
        }
    }

    fn open_next(&mut self) {
        if self.backends.is_empty() {
            return;
        }
        let backend = self.backends[self.cursor % self.backends.len()].clone();
        self.cursor = self.cursor.wrapping_add(1);

        let conn = self.factory.connect(&backend);
        debug!("opening {} to {}", conn.id(), backend);
        self.live.push(conn.clone());
        self.monitors.push(
            async move {
                let established = conn.wait_established().await;
                Monitor::Settled { conn, established }
            }
            .boxed(),
        );
    }

    fn on_monitor(&mut self, monitor: Monitor) {
        match monitor {
            Monitor::Settled {
                conn,
                established: true,
            } => {
                self.failures = 0;
                self.ever_established = true;
                self.monitors.push(
                    async move {
                        conn.closed().await;
                        Monitor::Ended { conn }
                    }
                    .boxed(),
                );
            }
            Monitor::Settled {
                conn,
                established: false,
            } => {
                self.live.retain(|live| *live != conn);
                self.failures = self.failures.saturating_add(1);
                let delay = self.policy.backoff(self.failures);
                self.next_attempt = Instant::now() + delay;
                warn!(
                    "connection to {} failed (attempt {}), retrying in {:?}",
                    conn.backend(),
                    self.failures,
                    delay
                );

                if !self.ever_established
                    && !self.failed_reported
                    && self.failures >= self.policy.retries
                {
                    warn!(
                        "giving up on the ensemble after {} failed attempts",
                        self.failures
                    );
                    self.failed_reported = true;
                    self.events.send(ClientEvent::Failed).ok();
                }
            }
            Monitor::Ended { conn } => {
                debug!("{} to {} ended", conn.id(), conn.backend());
                self.live.retain(|live| *live != conn);
                self.next_attempt = Instant::now();
            }
        }
    }

    fn stop(&mut self) {
        for conn in self.live.drain(..) {
            conn.destroy();
        }
    }
}
