//! Watch session controller
//!
//! Opens backend subscriptions for resource collections and pod log
//! streams, replaces each session's snapshot wholesale on every update and
//! forwards it to the session's observer. A subscription is released only
//! through its token, which the controller keeps on the session until
//! exactly one stop claims it.

use crate::bridge::{commands, parse_subscription_token, CommandBridge};
use crate::error::{Result, SessionError};
use crate::events::{EventHub, LifecycleEvent, SnapshotObserver};
use crate::gate::ConnectionGate;
use crate::registry::SessionRegistry;
use crate::session::{
    ResourceKind, Session, SessionId, SessionKind, SessionStatus, Snapshot, SubscriptionToken,
    WatchTarget,
};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, info, warn};

/// What to watch, plus optional backend-side filters
#[derive(Debug, Clone, PartialEq)]
pub struct WatchRequest {
    pub target: WatchTarget,
    pub filters: Option<Value>,
}

impl WatchRequest {
    pub fn resource(kind: ResourceKind, namespace: impl Into<String>) -> Self {
        Self {
            target: WatchTarget::Resource {
                kind,
                namespace: namespace.into(),
            },
            filters: None,
        }
    }

    pub fn logs(namespace: impl Into<String>, pod: impl Into<String>) -> Self {
        Self {
            target: WatchTarget::Logs {
                namespace: namespace.into(),
                pod: pod.into(),
            },
            filters: None,
        }
    }

    pub fn with_filters(mut self, filters: Value) -> Self {
        self.filters = Some(filters);
        self
    }

    fn validate(&self) -> Result<()> {
        if self.target.namespace().trim().is_empty() {
            return Err(SessionError::setup("Namespace is required"));
        }
        match &self.target {
            WatchTarget::Logs { pod, .. } if pod.trim().is_empty() => {
                Err(SessionError::setup("Pod name is required"))
            }
            WatchTarget::Resource {
                kind: ResourceKind::Logs,
                ..
            } => Err(SessionError::setup("Log streams are opened per pod")),
            _ => Ok(()),
        }
    }
}

/// Outcome of stopping many watches at once
#[derive(Debug, Default)]
pub struct StopReport {
    pub stopped: usize,
    pub failures: Vec<SessionError>,
}

impl StopReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

type LogKey = (String, String);

struct WatchInner {
    bridge: Arc<dyn CommandBridge>,
    registry: Arc<SessionRegistry>,
    hub: Arc<EventHub>,
    gate: Arc<ConnectionGate>,
    log_streams: Mutex<HashMap<LogKey, SessionId>>,
    active_namespace: Mutex<Option<String>>,
    /// Serializes namespace switches
    switch_lock: tokio::sync::Mutex<()>,
}

#[derive(Clone)]
pub struct WatchController {
    inner: Arc<WatchInner>,
}

/// Release capability for one watch session.
///
/// Clones share the released flag, so the subscription is torn down at
/// most once however many holders call [`unsubscribe`](Self::unsubscribe).
#[must_use = "dropping a WatchHandle leaks the backend subscription until stop_all"]
#[derive(Clone)]
pub struct WatchHandle {
    session_id: SessionId,
    target: WatchTarget,
    controller: WatchController,
    released: Arc<AtomicBool>,
}

impl std::fmt::Debug for WatchHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WatchHandle")
            .field("session_id", &self.session_id)
            .field("target", &self.target)
            .field("released", &self.is_released())
            .finish()
    }
}

impl WatchHandle {
    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    pub fn target(&self) -> &WatchTarget {
        &self.target
    }

    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::SeqCst)
    }

    /// Release the subscription and drop the session from the registry.
    ///
    /// Returns `Ok(false)` when this handle was already released.
    pub async fn unsubscribe(&self) -> Result<bool> {
        if self.released.swap(true, Ordering::SeqCst) {
            return Ok(false);
        }
        self.controller.stop_watch(&self.session_id).await
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn log_key(target: &WatchTarget) -> Option<LogKey> {
    match target {
        WatchTarget::Logs { namespace, pod } => Some((namespace.clone(), pod.clone())),
        WatchTarget::Resource { .. } => None,
    }
}

impl WatchController {
    pub fn new(
        bridge: Arc<dyn CommandBridge>,
        registry: Arc<SessionRegistry>,
        hub: Arc<EventHub>,
        gate: Arc<ConnectionGate>,
    ) -> Self {
        Self {
            inner: Arc::new(WatchInner {
                bridge,
                registry,
                hub,
                gate,
                log_streams: Mutex::new(HashMap::new()),
                active_namespace: Mutex::new(None),
                switch_lock: tokio::sync::Mutex::new(()),
            }),
        }
    }

    /// Open a watch.
    ///
    /// The backend connection must already be initialized; this never
    /// starts an initialization itself. A failed subscribe call leaves no
    /// trace in the registry and is returned to the caller.
    pub async fn start_watch(
        &self,
        request: WatchRequest,
        observer: Arc<dyn SnapshotObserver>,
    ) -> Result<WatchHandle> {
        request.validate()?;
        self.inner.gate.require_ready()?;

        let key = log_key(&request.target);
        let target = request.target.clone();
        let session = Session::watch(request.target, request.filters.clone());
        let id = session.id.clone();
        if !self.inner.registry.register(session) {
            return Err(SessionError::setup(format!("Session {id} is already registered")));
        }
        self.inner.hub.attach_snapshot_observer(&id, observer);
        self.inner
            .hub
            .emit_lifecycle(LifecycleEvent::Registered(id.clone()));

        // Claimed before subscribing: overlapping starts for one pod replace
        // each other and at most one stays live
        if let Some(key) = &key {
            let replaced = lock(&self.inner.log_streams).insert(key.clone(), id.clone());
            if let Some(existing) = replaced {
                debug!(session_id = %existing, "Replacing log stream for {}/{}", key.0, key.1);
                if let Err(e) = self.stop_watch(&existing).await {
                    warn!("Failed to release replaced log stream: {}", e);
                }
            }
        }

        let command = target.kind().watch_command();
        let mut args = json!({
            "namespace": target.namespace(),
            "filters": request.filters,
            "sessionId": id.as_str(),
        });
        if let WatchTarget::Logs { pod, .. } = &target {
            args["pod"] = json!(pod);
        }

        let token = match self
            .inner
            .bridge
            .invoke(command, args)
            .await
            .and_then(|value| parse_subscription_token(command, &value))
        {
            Ok(token) => token,
            Err(e) => {
                warn!(session_id = %id, "Failed to start watch for {}: {}", target, e);
                self.release_log_key(&target, &id);
                self.discard(&id);
                return Err(SessionError::setup(format!(
                    "Failed to start watch for {target}: {e}"
                )));
            }
        };

        let started = self.inner.registry.update(&id, |session| {
            if let Some(watch) = session.as_watch_mut() {
                watch.token = Some(token.clone());
            }
            session.transition(SessionStatus::Running)
        });

        match started {
            None => {
                // Stopped while the subscribe call was in flight
                if let Err(e) = self.release_token(&id, &token).await {
                    warn!(session_id = %id, "{}", e);
                }
                return Err(SessionError::setup(format!(
                    "Watch for {target} was stopped while starting"
                )));
            }
            Some(true) => {
                self.inner.hub.emit_lifecycle(LifecycleEvent::StatusChanged {
                    session_id: id.clone(),
                    status: SessionStatus::Running,
                });
            }
            Some(false) => {
                debug!(session_id = %id, "Watch finished before its subscription was acknowledged");
            }
        }

        info!(session_id = %id, "Watching {}", target);
        Ok(WatchHandle {
            session_id: id,
            target,
            controller: self.clone(),
            released: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Forget the pod's log stream entry if it still points at `id`
    fn release_log_key(&self, target: &WatchTarget, id: &SessionId) {
        if let Some(key) = log_key(target) {
            let mut streams = lock(&self.inner.log_streams);
            if streams.get(&key) == Some(id) {
                streams.remove(&key);
            }
        }
    }

    fn discard(&self, id: &SessionId) {
        self.inner.hub.detach_snapshot_observer(id);
        if let Some(removed) = self.inner.registry.remove(id) {
            self.inner.hub.emit_removed(id, removed.was_active);
        }
    }

    async fn release_token(&self, id: &SessionId, token: &SubscriptionToken) -> Result<()> {
        self.inner
            .bridge
            .invoke(
                commands::UNWATCH,
                json!({ "token": token.as_str(), "sessionId": id.as_str() }),
            )
            .await
            .map(|_| ())
            .map_err(|e| SessionError::Teardown {
                session_id: id.clone(),
                message: e.to_string(),
            })
    }

    /// Stop a watch: release its subscription, then drop it from the
    /// registry. The entry is removed even when the backend teardown fails;
    /// that failure is returned.
    ///
    /// Returns `Ok(false)` for unknown ids and for watches another stop has
    /// already claimed.
    pub async fn stop_watch(&self, id: &SessionId) -> Result<bool> {
        let claimed = self.inner.registry.update(id, |session| {
            let watch = session.as_watch_mut()?;
            let token = watch.token.take();
            let target = watch.target.clone();
            let was_live = !session.is_terminal();
            session.transition(SessionStatus::Cancelled);
            Some((token, target, was_live))
        });

        let Some(Some((token, target, was_live))) = claimed else {
            return Ok(false);
        };
        if token.is_none() && !was_live {
            debug!(session_id = %id, "Watch already being stopped");
            return Ok(false);
        }

        if was_live {
            self.inner.hub.emit_lifecycle(LifecycleEvent::StatusChanged {
                session_id: id.clone(),
                status: SessionStatus::Cancelled,
            });
        }

        let teardown = match &token {
            Some(token) => self.release_token(id, token).await,
            None => Ok(()),
        };

        self.release_log_key(&target, id);
        self.discard(id);

        match teardown {
            Ok(()) => {
                info!(session_id = %id, "Stopped watching {}", target);
                Ok(true)
            }
            Err(e) => {
                warn!(session_id = %id, "{}", e);
                Err(e)
            }
        }
    }

    /// Replace the session's snapshot and forward it to the observer.
    /// Updates for finished or unknown sessions are dropped.
    pub fn on_snapshot(&self, id: &SessionId, snapshot: Snapshot) -> bool {
        let target = self
            .inner
            .registry
            .update(id, |session| {
                // Pending counts: the backend may push the first list before
                // the subscribe call returns its token
                if session.is_terminal() {
                    return None;
                }
                let watch = session.as_watch_mut()?;
                watch.snapshot = snapshot.clone();
                watch.updates += 1;
                Some(watch.target.clone())
            })
            .flatten();

        match target {
            Some(target) => {
                self.inner.hub.emit_snapshot(id, &target, &snapshot);
                true
            }
            None => {
                debug!(session_id = %id, "Dropping snapshot for finished or unknown watch");
                false
            }
        }
    }

    /// Record a stream failure. The token stays on the session so a later
    /// stop still releases the subscription; the watch is not retried.
    pub fn on_failed(&self, id: &SessionId, message: String) -> bool {
        let changed = self
            .inner
            .registry
            .update(id, |session| {
                if session.kind() != SessionKind::Watch
                    || !session.transition(SessionStatus::Error)
                {
                    return false;
                }
                if let Some(watch) = session.as_watch_mut() {
                    watch.error_message = Some(message.clone());
                }
                true
            })
            .unwrap_or(false);

        if changed {
            warn!(session_id = %id, "Watch stream failed: {}", message);
            self.inner.hub.emit_lifecycle(LifecycleEvent::StatusChanged {
                session_id: id.clone(),
                status: SessionStatus::Error,
            });
        }
        changed
    }

    /// Stop every registered watch, carrying on past individual failures
    pub async fn stop_all(&self) -> StopReport {
        let ids: Vec<SessionId> = self
            .inner
            .registry
            .list_by_kind(SessionKind::Watch)
            .into_iter()
            .map(|session| session.id)
            .collect();

        let mut report = StopReport::default();
        for id in ids {
            match self.stop_watch(&id).await {
                Ok(true) => report.stopped += 1,
                Ok(false) => {}
                Err(e) => report.failures.push(e),
            }
        }
        if !report.is_clean() {
            warn!(
                "Stopped {} watches, {} teardowns failed",
                report.stopped,
                report.failures.len()
            );
        }
        report
    }

    /// Make `namespace` the active one.
    ///
    /// Every watch outside it, log streams included, is stopped before any
    /// new watch starts. `None` just stops everything. Kinds already
    /// watched in the namespace are kept. If one start fails, the watches
    /// this call opened are torn down again and the error is returned.
    pub async fn switch_namespace(
        &self,
        namespace: Option<&str>,
        kinds: &[ResourceKind],
        observer: Arc<dyn SnapshotObserver>,
    ) -> Result<Vec<WatchHandle>> {
        if let Some(namespace) = namespace {
            if namespace.trim().is_empty() {
                return Err(SessionError::setup("Namespace is required"));
            }
        }
        if kinds.contains(&ResourceKind::Logs) {
            return Err(SessionError::setup("Log streams are opened per pod"));
        }

        let _switching = self.inner.switch_lock.lock().await;

        let stale: Vec<SessionId> = self
            .inner
            .registry
            .filter(|session| {
                session
                    .as_watch()
                    .is_some_and(|watch| Some(watch.target.namespace()) != namespace)
            })
            .into_iter()
            .map(|session| session.id)
            .collect();
        if !stale.is_empty() {
            info!("Stopping {} watches outside {:?}", stale.len(), namespace);
        }
        for id in &stale {
            if let Err(e) = self.stop_watch(id).await {
                warn!("{}", e);
            }
        }

        *lock(&self.inner.active_namespace) = namespace.map(str::to_string);
        let Some(namespace) = namespace else {
            return Ok(Vec::new());
        };

        let mut started: Vec<WatchHandle> = Vec::new();
        for kind in kinds {
            if self.is_watching(*kind, namespace) {
                debug!("Already watching {} in {}", kind, namespace);
                continue;
            }
            match self
                .start_watch(WatchRequest::resource(*kind, namespace), observer.clone())
                .await
            {
                Ok(handle) => started.push(handle),
                Err(e) => {
                    warn!("Namespace switch to {} failed: {}", namespace, e);
                    for handle in &started {
                        if let Err(teardown) = handle.unsubscribe().await {
                            warn!("{}", teardown);
                        }
                    }
                    return Err(e);
                }
            }
        }
        Ok(started)
    }

    pub async fn start_log_stream(
        &self,
        namespace: &str,
        pod: &str,
        observer: Arc<dyn SnapshotObserver>,
    ) -> Result<WatchHandle> {
        self.start_watch(WatchRequest::logs(namespace, pod), observer)
            .await
    }

    pub async fn stop_log_stream(&self, namespace: &str, pod: &str) -> Result<bool> {
        let key = (namespace.to_string(), pod.to_string());
        let id = lock(&self.inner.log_streams).get(&key).cloned();
        match id {
            Some(id) => self.stop_watch(&id).await,
            None => Ok(false),
        }
    }

    /// Session id of the open log stream for a pod
    pub fn log_stream(&self, namespace: &str, pod: &str) -> Option<SessionId> {
        let key = (namespace.to_string(), pod.to_string());
        lock(&self.inner.log_streams).get(&key).cloned()
    }

    pub fn active_namespace(&self) -> Option<String> {
        lock(&self.inner.active_namespace).clone()
    }

    /// Whether a live watch exists for `kind` in `namespace`
    pub fn is_watching(&self, kind: ResourceKind, namespace: &str) -> bool {
        !self
            .inner
            .registry
            .filter(|session| {
                !session.is_terminal()
                    && session.as_watch().is_some_and(|watch| match &watch.target {
                        WatchTarget::Resource { kind: k, namespace: ns } => {
                            *k == kind && ns == namespace
                        }
                        WatchTarget::Logs { .. } => false,
                    })
            })
            .is_empty()
    }
}
