//! Per-path watcher registry and the public subscription handles.

use futures::Stream;
use std::collections::{HashMap, VecDeque};
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::mpsc;
use zk_wire::{NotificationType, Request};

use crate::session::DriverCommand;
use crate::watch::{
    NodeEvent, SessionView, WatchAction, WatchCategory, WatchEvent, WatchInput, WatchKind,
    WatchState,
};

/// Work the session has to carry out for a watcher
#[derive(Debug, Clone)]
pub(crate) enum WatcherRequest {
    Arm {
        category: WatchCategory,
        request: Request,
        generation: u64,
    },
    Retry {
        category: WatchCategory,
        delay: Duration,
        generation: u64,
    },
}

struct Listener {
    id: u64,
    tx: mpsc::UnboundedSender<NodeEvent>,
}

/// Listeners and watch events for one path
pub(crate) struct WatcherEntry {
    path: String,
    listeners: HashMap<WatchKind, Vec<Listener>>,
    events: [WatchEvent; 3],
    /// Last state reported by each live category
    current: [Option<NodeEvent>; 3],
}

impl WatcherEntry {
    pub(crate) fn new(path: &str) -> Self {
        Self {
            path: path.to_string(),
            listeners: HashMap::new(),
            events: WatchCategory::ALL.map(|category| WatchEvent::new(path, category)),
            current: [None, None, None],
        }
    }

    pub(crate) fn path(&self) -> &str {
        &self.path
    }

    pub(crate) fn state(&self, category: WatchCategory) -> WatchState {
        self.events[category.index()].state()
    }

    /// Nothing listens and no server-side watch can still fire
    pub(crate) fn is_idle(&self) -> bool {
        self.listeners.values().all(Vec::is_empty)
            && self.events.iter().all(|event| !event.accepts_notification())
    }

    /// Categories waiting for bulk re-registration
    pub(crate) fn resuming(&self) -> impl Iterator<Item = WatchCategory> + '_ {
        self.events
            .iter()
            .filter(|event| event.state() == WatchState::Resuming)
            .map(WatchEvent::category)
    }

    pub(crate) fn subscribe(
        &mut self,
        kind: WatchKind,
        id: u64,
        tx: mpsc::UnboundedSender<NodeEvent>,
        view: SessionView,
    ) -> Vec<WatcherRequest> {
        let listeners = self.listeners.entry(kind).or_default();
        // the first listener of a kind gets the node's current state, which
        // a category armed for another kind may already know
        if listeners.is_empty() {
            if let Some(event) = &self.current[kind.category().index()] {
                if event.kind() == kind {
                    tx.send(event.clone()).ok();
                }
            }
        }
        listeners.push(Listener { id, tx });
        self.run(VecDeque::new(), view)
    }

    pub(crate) fn unsubscribe(&mut self, id: u64, view: SessionView) -> Vec<WatcherRequest> {
        for listeners in self.listeners.values_mut() {
            listeners.retain(|listener| listener.id != id);
        }
        self.run(VecDeque::new(), view)
    }

    /// Feed one input to one category
    pub(crate) fn input(
        &mut self,
        category: WatchCategory,
        input: WatchInput,
        view: SessionView,
    ) -> Vec<WatcherRequest> {
        self.run(VecDeque::from([(category, input)]), view)
    }

    /// Feed the same input to every category
    pub(crate) fn broadcast(&mut self, input: WatchInput, view: SessionView) -> Vec<WatcherRequest> {
        let queue = WatchCategory::ALL
            .iter()
            .map(|category| (*category, input.clone()))
            .collect();
        self.run(queue, view)
    }

    /// Route a notification. Returns `None` when no category could take it.
    pub(crate) fn notify(
        &mut self,
        kind: NotificationType,
        view: SessionView,
    ) -> Option<Vec<WatcherRequest>> {
        let categories: &[WatchCategory] = match kind {
            NotificationType::Created => &[WatchCategory::CreatedOrDeleted],
            NotificationType::Deleted => &WatchCategory::ALL,
            NotificationType::DataChanged => {
                &[WatchCategory::DataChanged, WatchCategory::CreatedOrDeleted]
            }
            NotificationType::ChildrenChanged => &[WatchCategory::ChildrenChanged],
        };

        let mut queue: VecDeque<(WatchCategory, WatchInput)> = categories
            .iter()
            .filter(|category| self.events[category.index()].accepts_notification())
            .map(|category| (*category, WatchInput::Notification))
            .collect();

        if kind == NotificationType::Created {
            self.wake_waiting(None, &mut queue);
        }
        if queue.is_empty() {
            return None;
        }
        Some(self.run(queue, view))
    }

    fn run(
        &mut self,
        mut queue: VecDeque<(WatchCategory, WatchInput)>,
        view: SessionView,
    ) -> Vec<WatcherRequest> {
        let mut out = Vec::new();
        loop {
            while let Some((category, input)) = queue.pop_front() {
                let actions = self.events[category.index()].handle(input, view);
                for action in actions {
                    match action {
                        WatchAction::Arm {
                            request,
                            generation,
                        } => out.push(WatcherRequest::Arm {
                            category,
                            request,
                            generation,
                        }),
                        WatchAction::RetryAfter { delay, generation } => {
                            out.push(WatcherRequest::Retry {
                                category,
                                delay,
                                generation,
                            })
                        }
                        WatchAction::Emit(event) => {
                            self.current[category.index()] = Some(event.clone());
                            self.dispatch(event);
                        }
                        WatchAction::NodeExists => self.wake_waiting(Some(category), &mut queue),
                        WatchAction::NeedNode => {}
                    }
                }
            }

            self.reconcile(&mut queue);
            if queue.is_empty() {
                for (current, event) in self.current.iter_mut().zip(&self.events) {
                    if !event.is_live() {
                        *current = None;
                    }
                }
                return out;
            }
        }
    }

    fn wake_waiting(
        &self,
        except: Option<WatchCategory>,
        queue: &mut VecDeque<(WatchCategory, WatchInput)>,
    ) {
        for event in &self.events {
            if Some(event.category()) != except && event.state() == WatchState::WaitNode {
                queue.push_back((event.category(), WatchInput::NodeCreated));
            }
        }
    }

    /// Listen or unlisten each category so it matches what is wanted
    fn reconcile(&self, queue: &mut VecDeque<(WatchCategory, WatchInput)>) {
        let waiting_for_node = self
            .events
            .iter()
            .any(|event| event.state() == WatchState::WaitNode);

        for event in &self.events {
            let category = event.category();
            let wanted = self.has_listeners(category)
                || (category == WatchCategory::CreatedOrDeleted && waiting_for_node);
            if wanted && !event.is_live() {
                queue.push_back((category, WatchInput::Listen));
            } else if !wanted && event.is_live() {
                queue.push_back((category, WatchInput::Unlisten));
            }
        }
    }

    fn has_listeners(&self, category: WatchCategory) -> bool {
        WatchKind::ALL
            .iter()
            .filter(|kind| kind.category() == category)
            .any(|kind| self.listeners.get(kind).is_some_and(|l| !l.is_empty()))
    }

    fn dispatch(&mut self, event: NodeEvent) {
        if let Some(listeners) = self.listeners.get_mut(&event.kind()) {
            listeners.retain(|listener| listener.tx.send(event.clone()).is_ok());
        }
    }
}

/// Per-path handle for subscribing to node events
#[derive(Clone)]
pub struct Watcher {
    path: String,
    commands: mpsc::UnboundedSender<DriverCommand>,
    ids: Arc<AtomicU64>,
}

impl Watcher {
    pub(crate) fn new(
        path: String,
        commands: mpsc::UnboundedSender<DriverCommand>,
        ids: Arc<AtomicU64>,
    ) -> Self {
        Self {
            path,
            commands,
            ids,
        }
    }

    /// Watched path
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Subscribe to one kind of event.
    ///
    /// The first subscriber of a kind arms the server-side watch and receives
    /// the node's current state; dropping the last one disarms it.
    pub fn subscribe(&self, kind: WatchKind) -> Subscription {
        let id = self.ids.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        self.commands
            .send(DriverCommand::Subscribe {
                path: self.path.clone(),
                kind,
                id,
                tx,
            })
            .ok();
        Subscription {
            id,
            path: self.path.clone(),
            kind,
            rx,
            commands: self.commands.clone(),
        }
    }
}

/// Stream of events for one path and kind
pub struct Subscription {
    id: u64,
    path: String,
    kind: WatchKind,
    rx: mpsc::UnboundedReceiver<NodeEvent>,
    commands: mpsc::UnboundedSender<DriverCommand>,
}

impl Subscription {
    /// Watched path
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Subscribed kind
    pub fn kind(&self) -> WatchKind {
        self.kind
    }

    /// Next event; `None` once the session is gone
    pub async fn recv(&mut self) -> Option<NodeEvent> {
        self.rx.recv().await
    }
}

impl Stream for Subscription {
    type Item = NodeEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<NodeEvent>> {
        self.rx.poll_recv(cx)
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.commands
            .send(DriverCommand::Unsubscribe {
                path: self.path.clone(),
                id: self.id,
            })
            .ok();
    }
}
