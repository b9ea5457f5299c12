//! Session records and status

use super::lifecycle::validate_transition;
use super::{SessionId, SessionKind, Snapshot, SubscriptionToken, WatchTarget};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::PathBuf;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    /// Registered, backend has not acknowledged yet
    Pending,
    Running,
    Success,
    Error,
    Cancelled,
}

impl SessionStatus {
    /// Check if this is a terminal state
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SessionStatus::Success | SessionStatus::Error | SessionStatus::Cancelled
        )
    }

    pub fn is_running(&self) -> bool {
        matches!(self, SessionStatus::Running)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ProcessSession {
    pub command: String,
    pub args: Vec<String>,
    pub working_directory: Option<PathBuf>,
    /// Append-only, in backend emission order
    pub output: Vec<String>,
    pub exit_code: Option<i32>,
    pub error_message: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct WatchSession {
    pub target: WatchTarget,
    pub filters: Option<serde_json::Value>,
    /// Latest collection, replaced wholesale on each update
    pub snapshot: Snapshot,
    pub updates: u64,
    pub error_message: Option<String>,
    /// Present until the backend subscription has been released
    #[serde(skip)]
    pub token: Option<SubscriptionToken>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum SessionDetail {
    Process(ProcessSession),
    Watch(WatchSession),
}

#[derive(Debug, Clone, Serialize)]
pub struct Session {
    pub id: SessionId,
    pub status: SessionStatus,
    pub started_at: DateTime<Utc>,
    /// Set if and only if the status is terminal
    pub ended_at: Option<DateTime<Utc>>,
    pub detail: SessionDetail,
}

impl Session {
    pub fn process(
        command: impl Into<String>,
        args: Vec<String>,
        working_directory: Option<PathBuf>,
    ) -> Self {
        Self {
            id: SessionId::new(SessionKind::Process),
            status: SessionStatus::Running,
            started_at: Utc::now(),
            ended_at: None,
            detail: SessionDetail::Process(ProcessSession {
                command: command.into(),
                args,
                working_directory,
                output: Vec::new(),
                exit_code: None,
                error_message: None,
            }),
        }
    }

    pub fn watch(target: WatchTarget, filters: Option<serde_json::Value>) -> Self {
        Self {
            id: SessionId::new(SessionKind::Watch),
            status: SessionStatus::Pending,
            started_at: Utc::now(),
            ended_at: None,
            detail: SessionDetail::Watch(WatchSession {
                target,
                filters,
                snapshot: Vec::new(),
                updates: 0,
                error_message: None,
                token: None,
            }),
        }
    }

    pub fn kind(&self) -> SessionKind {
        match self.detail {
            SessionDetail::Process(_) => SessionKind::Process,
            SessionDetail::Watch(_) => SessionKind::Watch,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn as_process(&self) -> Option<&ProcessSession> {
        match &self.detail {
            SessionDetail::Process(process) => Some(process),
            SessionDetail::Watch(_) => None,
        }
    }

    pub fn as_process_mut(&mut self) -> Option<&mut ProcessSession> {
        match &mut self.detail {
            SessionDetail::Process(process) => Some(process),
            SessionDetail::Watch(_) => None,
        }
    }

    pub fn as_watch(&self) -> Option<&WatchSession> {
        match &self.detail {
            SessionDetail::Watch(watch) => Some(watch),
            SessionDetail::Process(_) => None,
        }
    }

    pub fn as_watch_mut(&mut self) -> Option<&mut WatchSession> {
        match &mut self.detail {
            SessionDetail::Watch(watch) => Some(watch),
            SessionDetail::Process(_) => None,
        }
    }

    /// Move to `status`, stamping `ended_at` on terminal states.
    ///
    /// Returns false without touching the session when the transition is not
    /// allowed, which includes every transition out of a terminal state.
    pub fn transition(&mut self, status: SessionStatus) -> bool {
        if self.status == status || validate_transition(&self.status, &status).is_err() {
            return false;
        }
        self.status = status;
        if status.is_terminal() {
            self.ended_at = Some(Utc::now());
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_states() {
        assert!(!SessionStatus::Pending.is_terminal());
        assert!(!SessionStatus::Running.is_terminal());
        assert!(SessionStatus::Success.is_terminal());
        assert!(SessionStatus::Error.is_terminal());
        assert!(SessionStatus::Cancelled.is_terminal());
    }

    #[test]
    fn test_transition_stamps_end_time() {
        let mut session = Session::process("echo", vec!["a".to_string()], None);
        assert_eq!(session.status, SessionStatus::Running);
        assert!(session.ended_at.is_none());

        assert!(session.transition(SessionStatus::Success));
        assert!(session.ended_at.is_some());
        let ended = session.ended_at;

        // Terminal states are absorbing
        assert!(!session.transition(SessionStatus::Cancelled));
        assert!(!session.transition(SessionStatus::Running));
        assert_eq!(session.status, SessionStatus::Success);
        assert_eq!(session.ended_at, ended);
    }

    #[test]
    fn test_watch_starts_pending() {
        let session = Session::watch(
            WatchTarget::Resource {
                kind: crate::session::ResourceKind::Pods,
                namespace: "default".to_string(),
            },
            None,
        );
        assert_eq!(session.kind(), SessionKind::Watch);
        assert_eq!(session.status, SessionStatus::Pending);
        assert!(session.as_watch().is_some());
        assert!(session.as_process().is_none());
    }
}
