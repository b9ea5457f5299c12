//! Error taxonomy for the session manager
//!
//! Setup failures surface to the immediate caller. Failures after a session
//! is registered are recorded on the session instead of being returned, so
//! most of these variants only reach callers of the start operations.

use crate::session::SessionId;

/// Failure reported by the native backend through the command bridge
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BridgeError {
    #[error("Backend command '{command}' failed: {message}")]
    Failed { command: String, message: String },

    #[error("Backend does not support command '{0}'")]
    Unsupported(String),

    #[error("Backend is disconnected")]
    Disconnected,

    #[error("Backend command '{command}' returned an invalid response: {message}")]
    InvalidResponse { command: String, message: String },
}

impl BridgeError {
    pub fn failed(command: &str, message: impl Into<String>) -> Self {
        Self::Failed {
            command: command.to_string(),
            message: message.into(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// The initiating backend call failed before a session was registered
    #[error("Failed to start session: {message}")]
    Setup { message: String },

    /// A registered session's stream reported failure after start
    #[error("Session {session_id} failed: {message}")]
    Stream {
        session_id: SessionId,
        message: String,
    },

    /// Best-effort backend cancellation failed
    #[error("Backend cancellation of {session_id} failed: {message}")]
    Cancellation {
        session_id: SessionId,
        message: String,
    },

    /// Backend client initialization failed or attempts are exhausted
    #[error("Backend connection unavailable after {attempts}/{max_attempts} attempts")]
    Connection { attempts: u32, max_attempts: u32 },

    #[error("Session not found: {0}")]
    NotFound(SessionId),

    /// Releasing a watch subscription failed at the backend
    #[error("Failed to release subscription for {session_id}: {message}")]
    Teardown {
        session_id: SessionId,
        message: String,
    },

    #[error(transparent)]
    Bridge(#[from] BridgeError),
}

impl SessionError {
    pub fn setup(message: impl Into<String>) -> Self {
        Self::Setup {
            message: message.into(),
        }
    }

    /// Whether this error was raised before any session was registered
    pub fn is_setup(&self) -> bool {
        matches!(
            self,
            SessionError::Setup { .. } | SessionError::Connection { .. } | SessionError::Bridge(_)
        )
    }
}

pub type Result<T, E = SessionError> = std::result::Result<T, E>;
