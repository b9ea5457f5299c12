//! Process session controller
//!
//! Starts external commands through the backend, appends their streamed
//! output in emission order and finalizes them on completion or cancel.
//! The start call resolves only when the command has finished; its result
//! is fed back through the event inbox so it is applied after every output
//! line the backend emitted before it.

use crate::bridge::{commands, CommandBridge, CommandResult};
use crate::error::{Result, SessionError};
use crate::events::{BackendEvent, EventHub, EventPublisher, LifecycleEvent, OutputEvent};
use crate::registry::SessionRegistry;
use crate::session::{Session, SessionId, SessionKind, SessionStatus};
use futures::future::join_all;
use serde_json::json;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

/// A command to run as a process session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessRequest {
    pub command: String,
    pub args: Vec<String>,
    pub working_directory: Option<PathBuf>,
}

impl ProcessRequest {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            args: Vec::new(),
            working_directory: None,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_directory = Some(dir.into());
        self
    }
}

/// Backend side of a cancel request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendAck {
    Acknowledged,
    /// The kill request failed; the session is cancelled locally anyway
    Failed(String),
    /// Nothing was sent because the session had already finished
    Skipped,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CancelOutcome {
    pub session_id: SessionId,
    pub local_state: SessionStatus,
    pub backend: BackendAck,
}

impl CancelOutcome {
    /// Whether the session is now shown as cancelled
    pub fn success(&self) -> bool {
        self.local_state == SessionStatus::Cancelled
    }

    pub fn backend_ack(&self) -> bool {
        matches!(self.backend, BackendAck::Acknowledged)
    }
}

#[derive(Clone)]
pub struct ProcessController {
    bridge: Arc<dyn CommandBridge>,
    registry: Arc<SessionRegistry>,
    hub: Arc<EventHub>,
    loopback: EventPublisher,
}

impl ProcessController {
    pub fn new(
        bridge: Arc<dyn CommandBridge>,
        registry: Arc<SessionRegistry>,
        hub: Arc<EventHub>,
        loopback: EventPublisher,
    ) -> Self {
        Self {
            bridge,
            registry,
            hub,
            loopback,
        }
    }

    /// Register a running session and issue the backend start call.
    ///
    /// Returns as soon as the request is issued; completion arrives later
    /// through the event inbox.
    pub fn start(&self, request: ProcessRequest) -> Result<SessionId> {
        let id = self.register(&request)?;
        self.execute(id.clone(), request);
        Ok(id)
    }

    /// Like [`start`](Self::start), with an output subscription taken
    /// before the backend call is issued so no line can be missed
    pub fn start_streaming(
        &self,
        request: ProcessRequest,
    ) -> Result<(SessionId, broadcast::Receiver<OutputEvent>)> {
        let id = self.register(&request)?;
        let receiver = self
            .hub
            .subscribe_output(&id)
            .ok_or_else(|| SessionError::setup(format!("Output channel for {id} is missing")))?;
        self.execute(id.clone(), request);
        Ok((id, receiver))
    }

    fn register(&self, request: &ProcessRequest) -> Result<SessionId> {
        if request.command.trim().is_empty() {
            return Err(SessionError::setup("Command is required"));
        }

        let session = Session::process(
            request.command.clone(),
            request.args.clone(),
            request.working_directory.clone(),
        );
        let id = session.id.clone();
        if !self.registry.register(session) {
            return Err(SessionError::setup(format!("Session {id} is already registered")));
        }

        self.hub.open_output(&id);
        self.hub.emit_lifecycle(LifecycleEvent::Registered(id.clone()));
        if self.registry.set_active(Some(&id)) {
            self.hub
                .emit_lifecycle(LifecycleEvent::ActiveChanged(Some(id.clone())));
        }

        info!(
            session_id = %id,
            "Started process session: {} {}",
            request.command,
            request.args.join(" ")
        );
        Ok(id)
    }

    fn execute(&self, id: SessionId, request: ProcessRequest) {
        let bridge = self.bridge.clone();
        let loopback = self.loopback.clone();
        let args = json!({
            "command": request.command,
            "args": request.args,
            "workingDirectory": request.working_directory,
            "processId": id.as_str(),
        });

        tokio::spawn(async move {
            let outcome = bridge
                .invoke(commands::EXECUTE_COMMAND, args)
                .await
                .and_then(CommandResult::from_value);

            let delivered = match outcome {
                Ok(result) => loopback.publish(BackendEvent::CommandCompleted {
                    session_id: id.clone(),
                    exit_code: result.exit_code,
                    success: result.success,
                    error_message: result.error_message,
                }),
                Err(e) => loopback.command_failed(&id, e.to_string()),
            };
            if !delivered {
                debug!(session_id = %id, "Manager gone before process result arrived");
            }
        });
    }

    /// Append one output line. Lines for terminal or unknown sessions are
    /// discarded.
    pub fn on_output_line(&self, id: &SessionId, line: String) -> bool {
        let appended = self
            .registry
            .update(id, |session| {
                if session.is_terminal() {
                    return false;
                }
                match session.as_process_mut() {
                    Some(process) => {
                        process.output.push(line.clone());
                        true
                    }
                    None => false,
                }
            })
            .unwrap_or(false);

        if appended {
            self.hub.emit_output(id, OutputEvent::Line(line));
        } else {
            debug!(session_id = %id, "Discarding output for finished or unknown session");
        }
        appended
    }

    /// Finalize from a completion signal. Repeated signals are absorbed.
    pub fn on_completed(
        &self,
        id: &SessionId,
        exit_code: Option<i32>,
        success: bool,
        error_message: Option<String>,
    ) -> bool {
        let status = if success {
            SessionStatus::Success
        } else {
            SessionStatus::Error
        };

        let changed = self
            .registry
            .update(id, |session| {
                if session.kind() != SessionKind::Process || !session.transition(status) {
                    return false;
                }
                if let Some(process) = session.as_process_mut() {
                    process.exit_code = exit_code;
                    if !success {
                        process.error_message = error_message
                            .or_else(|| exit_code.map(|code| format!("Process exited with code {code}")));
                    }
                }
                true
            })
            .unwrap_or(false);

        if changed {
            info!(session_id = %id, "Process session finished: {:?} (exit code {:?})", status, exit_code);
            self.finish(id, status, exit_code);
        } else {
            debug!(session_id = %id, "Ignoring completion for finished or unknown session");
        }
        changed
    }

    /// Record a failed start call on an already registered session
    pub fn on_failed(&self, id: &SessionId, message: String) -> bool {
        let changed = self
            .registry
            .update(id, |session| {
                if session.kind() != SessionKind::Process
                    || !session.transition(SessionStatus::Error)
                {
                    return false;
                }
                if let Some(process) = session.as_process_mut() {
                    process.error_message = Some(message.clone());
                }
                true
            })
            .unwrap_or(false);

        if changed {
            let error = SessionError::Stream {
                session_id: id.clone(),
                message,
            };
            warn!(session_id = %id, "{}", error);
            self.finish(id, SessionStatus::Error, None);
        }
        changed
    }

    fn finish(&self, id: &SessionId, status: SessionStatus, exit_code: Option<i32>) {
        self.hub
            .emit_output(id, OutputEvent::Finished { status, exit_code });
        self.hub.emit_lifecycle(LifecycleEvent::StatusChanged {
            session_id: id.clone(),
            status,
        });
    }

    /// Cancel a process session.
    ///
    /// The session is marked Cancelled before the backend kill request is
    /// sent, and stays Cancelled whatever the backend answers. Unknown ids
    /// yield `None`.
    pub async fn cancel(&self, id: &SessionId) -> Option<CancelOutcome> {
        let (cancelled, status) = self.registry.update(id, |session| {
            if session.kind() != SessionKind::Process {
                return (false, session.status);
            }
            (session.transition(SessionStatus::Cancelled), session.status)
        })?;

        if !cancelled {
            debug!(session_id = %id, "Cancel skipped, session is {:?}", status);
            return Some(CancelOutcome {
                session_id: id.clone(),
                local_state: status,
                backend: BackendAck::Skipped,
            });
        }

        info!(session_id = %id, "Cancelled process session");
        self.finish(id, SessionStatus::Cancelled, None);

        let backend = match self
            .bridge
            .invoke(commands::CANCEL_PROCESS, json!({ "processId": id.as_str() }))
            .await
        {
            Ok(_) => BackendAck::Acknowledged,
            Err(e) => {
                let error = SessionError::Cancellation {
                    session_id: id.clone(),
                    message: e.to_string(),
                };
                warn!(session_id = %id, "{}", error);
                self.registry.update(id, |session| {
                    if let Some(process) = session.as_process_mut() {
                        process.error_message = Some(format!("Cancellation failed: {e}"));
                    }
                });
                BackendAck::Failed(e.to_string())
            }
        };

        Some(CancelOutcome {
            session_id: id.clone(),
            local_state: SessionStatus::Cancelled,
            backend,
        })
    }

    /// Cancel every running process session. One failure never stops the
    /// others.
    pub async fn cancel_all(&self) -> Vec<CancelOutcome> {
        let running: Vec<SessionId> = self
            .registry
            .filter(|session| session.kind() == SessionKind::Process && session.status.is_running())
            .into_iter()
            .map(|session| session.id)
            .collect();

        if !running.is_empty() {
            info!("Cancelling {} running process sessions", running.len());
        }
        join_all(running.iter().map(|id| self.cancel(id)))
            .await
            .into_iter()
            .flatten()
            .collect()
    }

    /// Empty a session's output buffer
    pub fn clear_output(&self, id: &SessionId) -> bool {
        self.registry
            .update(id, |session| match session.as_process_mut() {
                Some(process) => {
                    process.output.clear();
                    true
                }
                None => false,
            })
            .unwrap_or(false)
    }

    /// Process sessions, newest first
    pub fn history(&self) -> Vec<Session> {
        let mut sessions = self.registry.list_by_kind(SessionKind::Process);
        sessions.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        sessions
    }

    /// Drop a process session, cancelling it first if still running
    pub async fn remove(&self, id: &SessionId) -> bool {
        match self.registry.status(id) {
            None => return false,
            Some(status) if status.is_running() => {
                self.cancel(id).await;
            }
            Some(_) => {}
        }

        self.hub.release_output(id);
        match self.registry.remove(id) {
            Some(removed) => {
                self.hub.emit_removed(id, removed.was_active);
                true
            }
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::MockBridge;
    use crate::events::{self, EventInbox};

    fn controller() -> (ProcessController, MockBridge, EventInbox) {
        let (publisher, inbox) = events::channel();
        let bridge = MockBridge::new(publisher.clone());
        let controller = ProcessController::new(
            Arc::new(bridge.clone()),
            Arc::new(SessionRegistry::new()),
            Arc::new(EventHub::new(64)),
            publisher,
        );
        (controller, bridge, inbox)
    }

    #[tokio::test]
    async fn test_start_registers_running_session() {
        let (controller, bridge, mut inbox) = controller();
        bridge.expect("execute_command_live").returns_exit_code(0).finish();

        let id = controller
            .start(ProcessRequest::new("echo").arg("a").current_dir("/tmp"))
            .unwrap();

        let session = controller.registry.get(&id).unwrap();
        assert_eq!(session.status, SessionStatus::Running);
        assert!(controller.hub.has_output(&id));
        assert_eq!(controller.registry.active_id(), Some(id.clone()));

        let event = inbox.recv().await.unwrap();
        assert_eq!(
            event,
            BackendEvent::CommandCompleted {
                session_id: id.clone(),
                exit_code: Some(0),
                success: true,
                error_message: None,
            }
        );
        let call = &bridge.calls_to("execute_command_live")[0];
        assert_eq!(call.args["command"], json!("echo"));
        assert_eq!(call.args["workingDirectory"], json!("/tmp"));
        assert_eq!(call.session_id(), Some(id));
    }

    #[tokio::test]
    async fn test_empty_command_is_rejected() {
        let (controller, bridge, _inbox) = controller();
        let err = controller.start(ProcessRequest::new("  ")).unwrap_err();
        assert!(err.is_setup());
        assert!(controller.registry.is_empty());
        assert!(bridge.calls().is_empty());
    }

    #[tokio::test]
    async fn test_failed_start_call_marks_error() {
        let (controller, bridge, mut inbox) = controller();
        bridge.expect("execute_command_live").fails("spawn failed").finish();

        let id = controller.start(ProcessRequest::new("nope")).unwrap();
        match inbox.recv().await.unwrap() {
            BackendEvent::CommandFailed { session_id, message } => {
                assert_eq!(session_id, id);
                assert!(controller.on_failed(&session_id, message));
            }
            other => panic!("unexpected event {other:?}"),
        }

        let session = controller.registry.get(&id).unwrap();
        assert_eq!(session.status, SessionStatus::Error);
        assert!(session.ended_at.is_some());
        assert!(session
            .as_process()
            .unwrap()
            .error_message
            .as_deref()
            .unwrap()
            .contains("spawn failed"));
    }

    #[tokio::test]
    async fn test_late_output_is_discarded() {
        let (controller, bridge, _inbox) = controller();
        bridge
            .expect("execute_command_live")
            .delayed(std::time::Duration::from_secs(60))
            .finish();
        bridge.expect("cancel_process").returns(json!(true)).finish();

        let id = controller.start(ProcessRequest::new("tail").arg("-f")).unwrap();
        assert!(controller.on_output_line(&id, "first".to_string()));

        let outcome = controller.cancel(&id).await.unwrap();
        assert!(outcome.success());
        assert!(outcome.backend_ack());

        assert!(!controller.on_output_line(&id, "late".to_string()));
        assert!(!controller.on_completed(&id, Some(0), true, None));

        let session = controller.registry.get(&id).unwrap();
        assert_eq!(session.status, SessionStatus::Cancelled);
        assert_eq!(session.as_process().unwrap().output, vec!["first".to_string()]);
    }

    #[tokio::test]
    async fn test_completion_is_idempotent() {
        let (controller, bridge, _inbox) = controller();
        bridge
            .expect("execute_command_live")
            .delayed(std::time::Duration::from_secs(60))
            .finish();
        let id = controller.start(ProcessRequest::new("false")).unwrap();
        let mut output = controller.hub.subscribe_output(&id).unwrap();

        assert!(controller.on_completed(&id, Some(1), false, None));
        let first = controller.registry.get(&id).unwrap();
        assert!(!controller.on_completed(&id, Some(0), true, None));
        let second = controller.registry.get(&id).unwrap();

        assert_eq!(second.status, SessionStatus::Error);
        assert_eq!(second.ended_at, first.ended_at);
        assert_eq!(second.as_process().unwrap().exit_code, Some(1));
        assert_eq!(
            second.as_process().unwrap().error_message.as_deref(),
            Some("Process exited with code 1")
        );
        assert_eq!(
            output.recv().await.unwrap(),
            OutputEvent::Finished {
                status: SessionStatus::Error,
                exit_code: Some(1)
            }
        );
        assert!(output.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_cancel_survives_backend_failure() {
        let (controller, bridge, _inbox) = controller();
        bridge
            .expect("execute_command_live")
            .delayed(std::time::Duration::from_secs(60))
            .finish();
        bridge.expect("cancel_process").fails("no such process").finish();

        let id = controller.start(ProcessRequest::new("sleep").arg("100")).unwrap();
        let outcome = controller.cancel(&id).await.unwrap();

        assert!(outcome.success());
        assert!(matches!(outcome.backend, BackendAck::Failed(_)));
        let session = controller.registry.get(&id).unwrap();
        assert_eq!(session.status, SessionStatus::Cancelled);
        assert!(session.ended_at.is_some());
        assert!(session
            .as_process()
            .unwrap()
            .error_message
            .as_deref()
            .unwrap()
            .starts_with("Cancellation failed"));

        // Second cancel is a no-op that keeps the first outcome
        let again = controller.cancel(&id).await.unwrap();
        assert_eq!(again.backend, BackendAck::Skipped);
        assert_eq!(again.local_state, SessionStatus::Cancelled);
        assert_eq!(bridge.call_count("cancel_process"), 1);
    }

    #[tokio::test]
    async fn test_cancel_unknown_session() {
        let (controller, _bridge, _inbox) = controller();
        let id = SessionId::new(SessionKind::Process);
        assert!(controller.cancel(&id).await.is_none());
    }

    #[tokio::test]
    async fn test_cancel_all_continues_past_failures() {
        let (controller, bridge, _inbox) = controller();
        bridge
            .expect("execute_command_live")
            .delayed(std::time::Duration::from_secs(60))
            .finish();
        bridge.expect("cancel_process").fails("boom").times(1).finish();
        bridge.expect("cancel_process").returns(json!(true)).finish();

        let ids: Vec<SessionId> = (0..3)
            .map(|i| controller.start(ProcessRequest::new("sleep").arg(i.to_string())).unwrap())
            .collect();
        let outcomes = controller.cancel_all().await;

        assert_eq!(outcomes.len(), 3);
        assert!(outcomes.iter().all(CancelOutcome::success));
        assert_eq!(outcomes.iter().filter(|o| !o.backend_ack()).count(), 1);
        for id in &ids {
            assert_eq!(controller.registry.status(id), Some(SessionStatus::Cancelled));
        }
    }

    #[tokio::test]
    async fn test_remove_releases_output_channel() {
        let (controller, bridge, _inbox) = controller();
        bridge
            .expect("execute_command_live")
            .delayed(std::time::Duration::from_secs(60))
            .finish();
        bridge.expect("cancel_process").returns(json!(true)).finish();

        let id = controller.start(ProcessRequest::new("sleep").arg("5")).unwrap();
        assert!(controller.remove(&id).await);

        assert!(!controller.hub.has_output(&id));
        assert!(controller.registry.get(&id).is_none());
        assert_eq!(controller.registry.active_id(), None);
        assert_eq!(bridge.call_count("cancel_process"), 1);
        assert!(!controller.remove(&id).await);
    }

    #[tokio::test]
    async fn test_history_newest_first() {
        let (controller, bridge, _inbox) = controller();
        bridge
            .expect("execute_command_live")
            .delayed(std::time::Duration::from_secs(60))
            .finish();

        let first = controller.start(ProcessRequest::new("echo").arg("1")).unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        let second = controller.start(ProcessRequest::new("echo").arg("2")).unwrap();

        let history: Vec<SessionId> = controller.history().into_iter().map(|s| s.id).collect();
        assert_eq!(history, vec![second, first]);
    }
}
