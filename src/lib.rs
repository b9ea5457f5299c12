//! # kubedeck
//!
//! Session management for a cluster control panel: long-running command
//! executions and resource watches driven through a native backend.
//!
//! ## Modules
//!
//! - `session` - Session data model and lifecycle transitions
//! - `registry` - In-memory table of every tracked session
//! - `bridge` - Command bridge into the backend, plus mock and local backends
//! - `events` - Backend event channel and per-session fan-out
//! - `gate` - Bounded, single-flight backend initialization
//! - `process` - Process session controller
//! - `watch` - Watch session controller, log streams and namespace switching
//! - `manager` - The `SessionManager` service tying it together
//! - `config` - Manager configuration
//! - `logging` - Tracing setup for the binary

pub mod bridge;
pub mod config;
pub mod error;
pub mod events;
pub mod gate;
pub mod logging;
pub mod manager;
pub mod process;
pub mod registry;
pub mod session;
pub mod watch;

pub use error::{BridgeError, SessionError};
pub use manager::{SessionManager, ShutdownReport};
pub use process::{BackendAck, CancelOutcome, ProcessRequest};
pub use session::{ResourceKind, Session, SessionId, SessionKind, SessionStatus, WatchTarget};
pub use watch::{StopReport, WatchHandle, WatchRequest};
