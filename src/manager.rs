//! Session manager service
//!
//! Owns one registry, one connection gate and both controllers, and runs
//! the dispatcher that applies backend events in arrival order. Construct
//! one per backend connection and share it by reference.

use crate::bridge::{CommandBridge, LocalBridge};
use crate::config::ManagerConfig;
use crate::error::Result;
use crate::events::{
    self, BackendEvent, EventHub, EventInbox, EventPublisher, LifecycleEvent, OutputEvent,
    SnapshotObserver,
};
use crate::gate::ConnectionGate;
use crate::process::{CancelOutcome, ProcessController, ProcessRequest};
use crate::registry::SessionRegistry;
use crate::session::{ResourceKind, Session, SessionId, SessionKind, SessionStatus};
use crate::watch::{StopReport, WatchController, WatchHandle, WatchRequest};
use std::sync::Arc;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace};

/// What [`SessionManager::shutdown`] tore down
#[derive(Debug, Default)]
pub struct ShutdownReport {
    pub cancelled: Vec<CancelOutcome>,
    pub watches: StopReport,
}

pub struct SessionManager {
    config: ManagerConfig,
    registry: Arc<SessionRegistry>,
    hub: Arc<EventHub>,
    gate: Arc<ConnectionGate>,
    processes: ProcessController,
    watches: WatchController,
    dispatcher: JoinHandle<()>,
}

impl SessionManager {
    /// Wire a manager to `bridge`.
    ///
    /// `publisher` must feed `inbox`; the backend pushes its events through
    /// clones of the same publisher. Must be called within a tokio runtime.
    pub fn new(
        bridge: Arc<dyn CommandBridge>,
        publisher: EventPublisher,
        inbox: EventInbox,
        config: ManagerConfig,
    ) -> Self {
        let registry = Arc::new(SessionRegistry::new());
        let hub = Arc::new(EventHub::new(config.observer_capacity));
        let gate = Arc::new(ConnectionGate::new(bridge.clone(), config.max_init_attempts));
        let processes =
            ProcessController::new(bridge.clone(), registry.clone(), hub.clone(), publisher);
        let watches = WatchController::new(bridge, registry.clone(), hub.clone(), gate.clone());
        let dispatcher = Self::spawn_dispatcher(processes.clone(), watches.clone(), inbox);

        Self {
            config,
            registry,
            hub,
            gate,
            processes,
            watches,
            dispatcher,
        }
    }

    /// Manager backed by local child processes
    pub fn with_local_backend(config: ManagerConfig) -> Self {
        let (publisher, inbox) = events::channel();
        let bridge = Arc::new(LocalBridge::new(publisher.clone()));
        Self::new(bridge, publisher, inbox, config)
    }

    fn spawn_dispatcher(
        processes: ProcessController,
        watches: WatchController,
        mut inbox: EventInbox,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            while let Some(event) = inbox.recv().await {
                trace!(session_id = %event.session_id(), "Dispatching {:?}", event);
                match event {
                    BackendEvent::CommandOutput { session_id, line } => {
                        processes.on_output_line(&session_id, line);
                    }
                    BackendEvent::CommandCompleted {
                        session_id,
                        exit_code,
                        success,
                        error_message,
                    } => {
                        processes.on_completed(&session_id, exit_code, success, error_message);
                    }
                    BackendEvent::CommandFailed {
                        session_id,
                        message,
                    } => {
                        processes.on_failed(&session_id, message);
                    }
                    BackendEvent::WatchSnapshot {
                        session_id,
                        snapshot,
                    } => {
                        watches.on_snapshot(&session_id, snapshot);
                    }
                    BackendEvent::WatchFailed {
                        session_id,
                        message,
                    } => {
                        watches.on_failed(&session_id, message);
                    }
                }
            }
            debug!("Backend event channel closed");
        })
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    pub fn default_namespace(&self) -> Option<&str> {
        self.config.default_namespace.as_deref()
    }

    // Connection

    pub async fn ensure_connected(&self) -> bool {
        self.gate.ensure_connected().await
    }

    pub async fn health_check(&self) -> bool {
        self.gate.health_check().await
    }

    pub fn reset_connection(&self) {
        self.gate.reset_init_state();
    }

    pub fn is_connected(&self) -> bool {
        self.gate.is_ready()
    }

    pub fn connection_attempts(&self) -> u32 {
        self.gate.attempts()
    }

    // Processes

    pub fn start_process(&self, request: ProcessRequest) -> Result<SessionId> {
        self.processes.start(request)
    }

    pub fn start_process_streaming(
        &self,
        request: ProcessRequest,
    ) -> Result<(SessionId, broadcast::Receiver<OutputEvent>)> {
        self.processes.start_streaming(request)
    }

    pub async fn cancel_process(&self, id: &SessionId) -> Option<CancelOutcome> {
        self.processes.cancel(id).await
    }

    pub async fn cancel_all_processes(&self) -> Vec<CancelOutcome> {
        self.processes.cancel_all().await
    }

    pub fn clear_output(&self, id: &SessionId) -> bool {
        self.processes.clear_output(id)
    }

    pub fn process_history(&self) -> Vec<Session> {
        self.processes.history()
    }

    // Watches

    pub async fn start_watch(
        &self,
        request: WatchRequest,
        observer: Arc<dyn SnapshotObserver>,
    ) -> Result<WatchHandle> {
        self.watches.start_watch(request, observer).await
    }

    pub async fn stop_watch(&self, handle: &WatchHandle) -> Result<bool> {
        handle.unsubscribe().await
    }

    pub async fn stop_all_watches(&self) -> StopReport {
        self.watches.stop_all().await
    }

    pub async fn switch_namespace(
        &self,
        namespace: Option<&str>,
        kinds: &[ResourceKind],
        observer: Arc<dyn SnapshotObserver>,
    ) -> Result<Vec<WatchHandle>> {
        self.watches
            .switch_namespace(namespace, kinds, observer)
            .await
    }

    pub fn active_namespace(&self) -> Option<String> {
        self.watches.active_namespace()
    }

    pub async fn start_log_stream(
        &self,
        namespace: &str,
        pod: &str,
        observer: Arc<dyn SnapshotObserver>,
    ) -> Result<WatchHandle> {
        self.watches.start_log_stream(namespace, pod, observer).await
    }

    pub async fn stop_log_stream(&self, namespace: &str, pod: &str) -> Result<bool> {
        self.watches.stop_log_stream(namespace, pod).await
    }

    // Registry

    pub fn get_session(&self, id: &SessionId) -> Option<Session> {
        self.registry.get(id)
    }

    pub fn list_sessions(&self) -> Vec<Session> {
        self.registry.list()
    }

    pub fn list_running(&self) -> Vec<Session> {
        self.registry.list_by_status(SessionStatus::Running)
    }

    /// Release whatever the session still holds, then forget it. Running
    /// processes are cancelled and watches unsubscribed first.
    pub async fn remove_session(&self, id: &SessionId) -> Result<bool> {
        match self.registry.get(id).map(|session| session.kind()) {
            Some(SessionKind::Process) => Ok(self.processes.remove(id).await),
            Some(SessionKind::Watch) => self.watches.stop_watch(id).await,
            None => Ok(false),
        }
    }

    pub fn set_active(&self, id: Option<&SessionId>) -> bool {
        let changed = self.registry.set_active(id);
        if changed {
            self.hub
                .emit_lifecycle(LifecycleEvent::ActiveChanged(id.cloned()));
        }
        changed
    }

    pub fn active_session(&self) -> Option<Session> {
        self.registry
            .active_id()
            .and_then(|id| self.registry.get(&id))
    }

    // Observation

    pub fn subscribe_output(&self, id: &SessionId) -> Option<broadcast::Receiver<OutputEvent>> {
        self.hub.subscribe_output(id)
    }

    pub fn subscribe_lifecycle(&self) -> broadcast::Receiver<LifecycleEvent> {
        self.hub.subscribe_lifecycle()
    }

    /// Wait until the session reaches a terminal state. `None` if it is
    /// unknown or removed before finishing.
    pub async fn wait_for_terminal(&self, id: &SessionId) -> Option<Session> {
        let mut lifecycle = self.hub.subscribe_lifecycle();
        loop {
            let session = self.registry.get(id)?;
            if session.is_terminal() {
                return Some(session);
            }

            loop {
                match lifecycle.recv().await {
                    Ok(LifecycleEvent::StatusChanged { session_id, status })
                        if &session_id == id && status.is_terminal() =>
                    {
                        break
                    }
                    Ok(LifecycleEvent::Removed(session_id)) if &session_id == id => break,
                    Ok(_) => continue,
                    Err(RecvError::Lagged(_)) => break,
                    Err(RecvError::Closed) => return None,
                }
            }
        }
    }

    /// Cancel every running process and stop every watch
    pub async fn shutdown(&self) -> ShutdownReport {
        info!("Shutting down session manager");
        let cancelled = self.processes.cancel_all().await;
        let watches = self.watches.stop_all().await;
        ShutdownReport { cancelled, watches }
    }
}

impl Drop for SessionManager {
    fn drop(&mut self) {
        self.dispatcher.abort();
    }
}
