//! Backend event delivery and local fan-out
//!
//! The backend pushes events for running sessions through an
//! [`EventPublisher`]. A single dispatcher drains the matching
//! [`EventInbox`], so events for one session are applied in emission order.
//! Interested observers then receive them through per-session output
//! channels, registered snapshot observers, or the lifecycle stream.

use crate::session::{SessionId, SessionStatus, Snapshot, WatchTarget};
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, trace};

/// Event pushed by the backend, tagged with the id supplied at start time
#[derive(Debug, Clone, PartialEq)]
pub enum BackendEvent {
    CommandOutput {
        session_id: SessionId,
        line: String,
    },
    CommandCompleted {
        session_id: SessionId,
        exit_code: Option<i32>,
        success: bool,
        error_message: Option<String>,
    },
    /// The execute call itself failed before the command could finish
    CommandFailed {
        session_id: SessionId,
        message: String,
    },
    WatchSnapshot {
        session_id: SessionId,
        snapshot: Snapshot,
    },
    WatchFailed {
        session_id: SessionId,
        message: String,
    },
}

impl BackendEvent {
    pub fn session_id(&self) -> &SessionId {
        match self {
            BackendEvent::CommandOutput { session_id, .. }
            | BackendEvent::CommandCompleted { session_id, .. }
            | BackendEvent::CommandFailed { session_id, .. }
            | BackendEvent::WatchSnapshot { session_id, .. }
            | BackendEvent::WatchFailed { session_id, .. } => session_id,
        }
    }
}

/// Backend-side handle for pushing events
#[derive(Debug, Clone)]
pub struct EventPublisher {
    sender: mpsc::UnboundedSender<BackendEvent>,
}

impl EventPublisher {
    /// Push an event. Returns false once the manager has shut down.
    pub fn publish(&self, event: BackendEvent) -> bool {
        self.sender.send(event).is_ok()
    }

    pub fn output(&self, session_id: &SessionId, line: impl Into<String>) -> bool {
        self.publish(BackendEvent::CommandOutput {
            session_id: session_id.clone(),
            line: line.into(),
        })
    }

    pub fn completed(&self, session_id: &SessionId, exit_code: Option<i32>, success: bool) -> bool {
        self.publish(BackendEvent::CommandCompleted {
            session_id: session_id.clone(),
            exit_code,
            success,
            error_message: None,
        })
    }

    pub fn command_failed(&self, session_id: &SessionId, message: impl Into<String>) -> bool {
        self.publish(BackendEvent::CommandFailed {
            session_id: session_id.clone(),
            message: message.into(),
        })
    }

    pub fn snapshot(&self, session_id: &SessionId, snapshot: Snapshot) -> bool {
        self.publish(BackendEvent::WatchSnapshot {
            session_id: session_id.clone(),
            snapshot,
        })
    }

    pub fn watch_failed(&self, session_id: &SessionId, message: impl Into<String>) -> bool {
        self.publish(BackendEvent::WatchFailed {
            session_id: session_id.clone(),
            message: message.into(),
        })
    }
}

/// Manager-side end of the backend event channel
#[derive(Debug)]
pub struct EventInbox {
    receiver: mpsc::UnboundedReceiver<BackendEvent>,
}

impl EventInbox {
    pub async fn recv(&mut self) -> Option<BackendEvent> {
        self.receiver.recv().await
    }

    /// Take an already-queued event without waiting
    pub fn try_recv(&mut self) -> Option<BackendEvent> {
        self.receiver.try_recv().ok()
    }
}

/// Create a connected publisher/inbox pair
pub fn channel() -> (EventPublisher, EventInbox) {
    let (sender, receiver) = mpsc::unbounded_channel();
    (EventPublisher { sender }, EventInbox { receiver })
}

/// Event delivered to observers of one process session
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutputEvent {
    Line(String),
    Finished {
        status: SessionStatus,
        exit_code: Option<i32>,
    },
}

/// Registry-level change, for observers that track every session
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LifecycleEvent {
    Registered(SessionId),
    StatusChanged {
        session_id: SessionId,
        status: SessionStatus,
    },
    Removed(SessionId),
    ActiveChanged(Option<SessionId>),
}

/// Receives snapshot updates for a watch session
pub trait SnapshotObserver: Send + Sync {
    fn on_snapshot(&self, session_id: &SessionId, target: &WatchTarget, snapshot: &Snapshot);
}

impl<F> SnapshotObserver for F
where
    F: Fn(&SessionId, &WatchTarget, &Snapshot) + Send + Sync,
{
    fn on_snapshot(&self, session_id: &SessionId, target: &WatchTarget, snapshot: &Snapshot) {
        self(session_id, target, snapshot)
    }
}

/// Fan-out of session events to local observers
pub struct EventHub {
    capacity: usize,
    output: RwLock<HashMap<SessionId, broadcast::Sender<OutputEvent>>>,
    snapshots: RwLock<HashMap<SessionId, Arc<dyn SnapshotObserver>>>,
    lifecycle: broadcast::Sender<LifecycleEvent>,
}

impl EventHub {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (lifecycle, _) = broadcast::channel(capacity);
        Self {
            capacity,
            output: RwLock::new(HashMap::new()),
            snapshots: RwLock::new(HashMap::new()),
            lifecycle,
        }
    }

    /// Open the output channel for a process session
    pub fn open_output(&self, id: &SessionId) {
        let mut output = self.output.write().unwrap_or_else(PoisonError::into_inner);
        output
            .entry(id.clone())
            .or_insert_with(|| broadcast::channel(self.capacity).0);
    }

    /// Subscribe to a process session's output. `None` once the session's
    /// channel has been released.
    pub fn subscribe_output(&self, id: &SessionId) -> Option<broadcast::Receiver<OutputEvent>> {
        let output = self.output.read().unwrap_or_else(PoisonError::into_inner);
        output.get(id).map(broadcast::Sender::subscribe)
    }

    pub fn release_output(&self, id: &SessionId) -> bool {
        let mut output = self.output.write().unwrap_or_else(PoisonError::into_inner);
        output.remove(id).is_some()
    }

    pub fn has_output(&self, id: &SessionId) -> bool {
        let output = self.output.read().unwrap_or_else(PoisonError::into_inner);
        output.contains_key(id)
    }

    pub fn emit_output(&self, id: &SessionId, event: OutputEvent) {
        let output = self.output.read().unwrap_or_else(PoisonError::into_inner);
        if let Some(sender) = output.get(id) {
            if sender.send(event).is_err() {
                trace!(session_id = %id, "No output subscribers");
            }
        }
    }

    pub fn attach_snapshot_observer(&self, id: &SessionId, observer: Arc<dyn SnapshotObserver>) {
        let mut snapshots = self.snapshots.write().unwrap_or_else(PoisonError::into_inner);
        snapshots.insert(id.clone(), observer);
    }

    pub fn detach_snapshot_observer(&self, id: &SessionId) -> bool {
        let mut snapshots = self.snapshots.write().unwrap_or_else(PoisonError::into_inner);
        snapshots.remove(id).is_some()
    }

    pub fn has_snapshot_observer(&self, id: &SessionId) -> bool {
        let snapshots = self.snapshots.read().unwrap_or_else(PoisonError::into_inner);
        snapshots.contains_key(id)
    }

    /// Forward a snapshot to the session's observer. The lock is released
    /// before the observer runs.
    pub fn emit_snapshot(&self, id: &SessionId, target: &WatchTarget, snapshot: &Snapshot) {
        let observer = {
            let snapshots = self.snapshots.read().unwrap_or_else(PoisonError::into_inner);
            snapshots.get(id).cloned()
        };
        if let Some(observer) = observer {
            observer.on_snapshot(id, target, snapshot);
        }
    }

    pub fn subscribe_lifecycle(&self) -> broadcast::Receiver<LifecycleEvent> {
        self.lifecycle.subscribe()
    }

    pub fn emit_lifecycle(&self, event: LifecycleEvent) {
        if let Err(e) = self.lifecycle.send(event) {
            debug!("No subscribers for lifecycle event: {}", e);
        }
    }

    /// Announce a removal, and the focus loss when the session was active
    pub fn emit_removed(&self, id: &SessionId, was_active: bool) {
        self.emit_lifecycle(LifecycleEvent::Removed(id.clone()));
        if was_active {
            self.emit_lifecycle(LifecycleEvent::ActiveChanged(None));
        }
    }
}
