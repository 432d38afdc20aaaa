//! Watch event state machine.
//!
//! One [`WatchEvent`] tracks one server-side watch category for one path. It
//! is a pure state machine: the session feeds it inputs together with a view
//! of its own readiness and carries out the returned actions.
//!
//! ```text
//! disarmed → wait_session → wait_connected → arming → armed ⇄ resuming
//!                                              ↓
//!                                          wait_node
//! ```
//!
//! ZooKeeper watches are one-shot, so every notification leads back to
//! `wait_session` and a fresh arm request. The arm reply is compared against
//! the zxid mark of the last emitted event so that re-arming after a
//! reconnect never reports the same change twice.

use bytes::Bytes;
use std::time::Duration;
use tracing::trace;
use zk_wire::{Request, Response, Stat};

use crate::error::ZkError;

/// Delay before re-arming after a failure that is not a lost connection
pub const ARM_RETRY_DELAY: Duration = Duration::from_secs(1);

/// User-visible node events
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WatchKind {
    /// Node came into existence
    Created,
    /// Node was removed
    Deleted,
    /// Node data changed
    DataChanged,
    /// Node children changed
    ChildrenChanged,
}

impl WatchKind {
    /// All kinds
    pub const ALL: [WatchKind; 4] = [
        WatchKind::Created,
        WatchKind::Deleted,
        WatchKind::DataChanged,
        WatchKind::ChildrenChanged,
    ];

    /// Server-side watch category that produces this kind
    pub fn category(self) -> WatchCategory {
        match self {
            WatchKind::Created | WatchKind::Deleted => WatchCategory::CreatedOrDeleted,
            WatchKind::DataChanged => WatchCategory::DataChanged,
            WatchKind::ChildrenChanged => WatchCategory::ChildrenChanged,
        }
    }
}

/// Server-side watch categories
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum WatchCategory {
    /// Existence watch (EXISTS)
    CreatedOrDeleted,
    /// Data watch (GET_DATA)
    DataChanged,
    /// Child watch (GET_CHILDREN2)
    ChildrenChanged,
}

impl WatchCategory {
    /// All categories
    pub const ALL: [WatchCategory; 3] = [
        WatchCategory::CreatedOrDeleted,
        WatchCategory::DataChanged,
        WatchCategory::ChildrenChanged,
    ];

    /// Request that reads the node and leaves a watch of this category
    pub fn arm_request(self, path: &str) -> Request {
        let path = path.to_string();
        match self {
            WatchCategory::CreatedOrDeleted => Request::Exists { path, watch: true },
            WatchCategory::DataChanged => Request::GetData { path, watch: true },
            WatchCategory::ChildrenChanged => Request::GetChildren2 { path, watch: true },
        }
    }

    /// Index into per-category tables
    pub fn index(self) -> usize {
        self as usize
    }
}

/// Event delivered to subscribers
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeEvent {
    /// Node exists (first observation or re-creation)
    Created {
        /// Node stat
        stat: Stat,
    },
    /// Node does not exist
    Deleted,
    /// Node data, on first observation and after every change
    DataChanged {
        /// Current data
        data: Bytes,
        /// Node stat
        stat: Stat,
    },
    /// Node children, on first observation and after every change
    ChildrenChanged {
        /// Current children
        children: Vec<String>,
        /// Node stat
        stat: Stat,
    },
}

impl NodeEvent {
    /// Kind of this event
    pub fn kind(&self) -> WatchKind {
        match self {
            NodeEvent::Created { .. } => WatchKind::Created,
            NodeEvent::Deleted => WatchKind::Deleted,
            NodeEvent::DataChanged { .. } => WatchKind::DataChanged,
            NodeEvent::ChildrenChanged { .. } => WatchKind::ChildrenChanged,
        }
    }
}

/// Watch event states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WatchState {
    /// No listeners
    Disarmed,
    /// Waiting for the session to attach
    WaitSession,
    /// Waiting for the session's connection to be ready
    WaitConnected,
    /// Arm request in flight
    Arming,
    /// Server-side watch is set
    Armed,
    /// Waiting for the session's bulk re-registration
    Resuming,
    /// Waiting for the node to be created
    WaitNode,
}

/// What the watch machine needs to know about its session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SessionView {
    /// Session is attached
    pub attached: bool,
    /// Session's current connection accepts requests
    pub connected: bool,
}

/// Inputs to the watch machine
#[derive(Debug, Clone)]
pub enum WatchInput {
    /// A listener appeared
    Listen,
    /// The last listener went away
    Unlisten,
    /// Session or connection readiness changed
    Advance,
    /// The connection carrying the watch was lost
    Disconnected,
    /// Bulk re-registration covered this watch
    Resumed,
    /// Bulk re-registration failed
    ResumeFailed,
    /// The server fired the watch
    Notification,
    /// The node is known to exist now
    NodeCreated,
    /// A delayed retry is due
    Retry {
        /// Generation the retry was scheduled for
        generation: u64,
    },
    /// The arm request completed
    ArmResult {
        /// Generation the request was sent for
        generation: u64,
        /// Reply or error
        result: Result<Response, ZkError>,
    },
}

/// Actions requested by the watch machine
#[derive(Debug, Clone)]
pub enum WatchAction {
    /// Send `request` on the current connection and report back
    Arm {
        /// Request to send
        request: Request,
        /// Generation to report with the result
        generation: u64,
    },
    /// Feed `Retry` back after `delay`
    RetryAfter {
        /// Delay
        delay: Duration,
        /// Generation to report with the retry
        generation: u64,
    },
    /// Deliver an event to subscribers
    Emit(NodeEvent),
    /// The node exists
    NodeExists,
    /// The event entered `wait_node`
    NeedNode,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FireMark {
    Zxid(i64),
    Absent,
}

/// State machine for one path and category
#[derive(Debug)]
pub struct WatchEvent {
    path: String,
    category: WatchCategory,
    state: WatchState,
    generation: u64,
    backoff: bool,
    last_fired: Option<FireMark>,
    server_armed: bool,
}

impl WatchEvent {
    /// A disarmed event
    pub fn new(path: impl Into<String>, category: WatchCategory) -> Self {
        Self {
            path: path.into(),
            category,
            state: WatchState::Disarmed,
            generation: 0,
            backoff: false,
            last_fired: None,
            server_armed: false,
        }
    }

    /// Watched path
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Watch category
    pub fn category(&self) -> WatchCategory {
        self.category
    }

    /// Current state
    pub fn state(&self) -> WatchState {
        self.state
    }

    /// Whether the event has listeners
    pub fn is_live(&self) -> bool {
        self.state != WatchState::Disarmed
    }

    /// Whether a notification for this category has somewhere to go
    pub fn accepts_notification(&self) -> bool {
        self.is_live() || self.server_armed
    }

    /// Feed one input
    pub fn handle(&mut self, input: WatchInput, view: SessionView) -> Vec<WatchAction> {
        let mut actions = Vec::new();
        let before = self.state;

        match input {
            WatchInput::Listen => {
                if self.state == WatchState::Disarmed {
                    self.state = WatchState::WaitSession;
                    self.advance(view, &mut actions);
                }
            }
            WatchInput::Unlisten => {
                if self.state != WatchState::Disarmed {
                    self.server_armed = matches!(
                        self.state,
                        WatchState::Arming | WatchState::Armed | WatchState::Resuming
                    );
                    self.state = WatchState::Disarmed;
                    self.generation += 1;
                    self.backoff = false;
                    self.last_fired = None;
                }
            }
            WatchInput::Advance => self.advance(view, &mut actions),
            WatchInput::Disconnected => {
                if self.state == WatchState::Armed {
                    self.state = WatchState::Resuming;
                }
            }
            WatchInput::Resumed => {
                if self.state == WatchState::Resuming {
                    self.state = WatchState::Armed;
                }
            }
            WatchInput::ResumeFailed => {
                if self.state == WatchState::Resuming {
                    self.restart(view, &mut actions);
                }
            }
            WatchInput::Notification => match self.state {
                WatchState::Disarmed => self.server_armed = false,
                WatchState::Armed | WatchState::Resuming | WatchState::Arming => {
                    self.restart(view, &mut actions);
                }
                _ => {}
            },
            WatchInput::NodeCreated => {
                if self.state == WatchState::WaitNode {
                    self.restart(view, &mut actions);
                }
            }
            WatchInput::Retry { generation } => {
                if generation == self.generation && self.state == WatchState::WaitSession {
                    self.backoff = false;
                    self.advance(view, &mut actions);
                }
            }
            WatchInput::ArmResult { generation, result } => {
                if generation == self.generation && self.state == WatchState::Arming {
                    self.on_arm_result(result, view, &mut actions);
                }
            }
        }

        if self.state != before {
            trace!(
                "watch {} {:?}: {:?} -> {:?}",
                self.path,
                self.category,
                before,
                self.state
            );
        }
        actions
    }

    fn restart(&mut self, view: SessionView, actions: &mut Vec<WatchAction>) {
        self.state = WatchState::WaitSession;
        self.generation += 1;
        self.backoff = false;
        self.advance(view, actions);
    }

    fn advance(&mut self, view: SessionView, actions: &mut Vec<WatchAction>) {
        loop {
            match self.state {
                WatchState::WaitSession if view.attached && !self.backoff => {
                    self.state = WatchState::WaitConnected;
                }
                WatchState::WaitConnected if !view.attached => {
                    self.state = WatchState::WaitSession;
                }
                WatchState::WaitConnected if view.connected => {
                    self.state = WatchState::Arming;
                    self.generation += 1;
                    actions.push(WatchAction::Arm {
                        request: self.category.arm_request(&self.path),
                        generation: self.generation,
                    });
                }
                _ => break,
            }
        }
    }

    fn on_arm_result(
        &mut self,
        result: Result<Response, ZkError>,
        view: SessionView,
        actions: &mut Vec<WatchAction>,
    ) {
        let fired = match (self.category, result) {
            (WatchCategory::CreatedOrDeleted, Ok(Response::Exists { stat })) => {
                actions.push(WatchAction::NodeExists);
                Some((FireMark::Zxid(stat.czxid), NodeEvent::Created { stat }))
            }
            (WatchCategory::DataChanged, Ok(Response::GetData { data, stat })) => {
                actions.push(WatchAction::NodeExists);
                Some((
                    FireMark::Zxid(stat.mzxid),
                    NodeEvent::DataChanged { data, stat },
                ))
            }
            (WatchCategory::ChildrenChanged, Ok(Response::GetChildren2 { children, stat })) => {
                actions.push(WatchAction::NodeExists);
                Some((
                    FireMark::Zxid(stat.pzxid),
                    NodeEvent::ChildrenChanged { children, stat },
                ))
            }
            (WatchCategory::CreatedOrDeleted, Err(error)) if error.is_no_node() => {
                // an EXISTS on a missing node still leaves a watch
                Some((FireMark::Absent, NodeEvent::Deleted))
            }
            (_, Err(error)) if error.is_no_node() => {
                self.state = WatchState::WaitNode;
                actions.push(WatchAction::NeedNode);
                return;
            }
            (_, Err(error)) if error.is_connection_error() => {
                trace!("watch {} arm lost its connection: {}", self.path, error);
                self.state = WatchState::WaitSession;
                self.advance(view, actions);
                return;
            }
            (_, other) => {
                trace!(
                    "watch {} arm failed, retrying in {:?}: {:?}",
                    self.path,
                    ARM_RETRY_DELAY,
                    other.err()
                );
                self.state = WatchState::WaitSession;
                self.backoff = true;
                actions.push(WatchAction::RetryAfter {
                    delay: ARM_RETRY_DELAY,
                    generation: self.generation,
                });
                return;
            }
        };

        self.state = WatchState::Armed;
        if let Some((mark, event)) = fired {
            if self.is_newer(mark) {
                self.last_fired = Some(mark);
                actions.push(WatchAction::Emit(event));
            }
        }
    }

    fn is_newer(&self, mark: FireMark) -> bool {
        match (self.last_fired, mark) {
            (None, _) => true,
            (Some(FireMark::Zxid(last)), FireMark::Zxid(next)) => next > last,
            (Some(FireMark::Absent), FireMark::Absent) => false,
            _ => true,
        }
    }
}
