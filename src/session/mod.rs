//! Session data model
//!
//! A session is a tracked long-lived asynchronous operation: either an
//! external command execution (process session) or a continuous resource
//! subscription against the cluster (watch session).

pub mod lifecycle;
pub mod state;

pub use lifecycle::{can_transition, validate_transition};
pub use state::{ProcessSession, Session, SessionDetail, SessionStatus, WatchSession};

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Unique identifier for a session
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SessionId(String);

impl SessionId {
    /// Create a new session ID for the given kind
    pub fn new(kind: SessionKind) -> Self {
        Self(format!("{}-{}", kind.prefix(), Uuid::new_v4()))
    }

    /// Create from an existing string
    pub fn from_string(id: String) -> Self {
        Self(id)
    }

    /// Get the inner string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionKind {
    Process,
    Watch,
}

impl SessionKind {
    fn prefix(self) -> &'static str {
        match self {
            SessionKind::Process => "process",
            SessionKind::Watch => "watch",
        }
    }
}

/// Cluster resource collections that can be watched
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceKind {
    Pods,
    Deployments,
    Services,
    Logs,
}

impl ResourceKind {
    /// Backend command that opens a subscription for this kind
    pub fn watch_command(self) -> &'static str {
        match self {
            ResourceKind::Pods => "k8s_watch_pods",
            ResourceKind::Deployments => "k8s_watch_deployments",
            ResourceKind::Services => "k8s_watch_services",
            ResourceKind::Logs => "k8s_watch_logs",
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ResourceKind::Pods => "pods",
            ResourceKind::Deployments => "deployments",
            ResourceKind::Services => "services",
            ResourceKind::Logs => "logs",
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a watch session is subscribed to
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum WatchTarget {
    /// A resource collection scoped to a namespace
    Resource {
        kind: ResourceKind,
        namespace: String,
    },
    /// A log stream for one pod; several may be open per namespace
    Logs { namespace: String, pod: String },
}

impl WatchTarget {
    pub fn namespace(&self) -> &str {
        match self {
            WatchTarget::Resource { namespace, .. } | WatchTarget::Logs { namespace, .. } => {
                namespace
            }
        }
    }

    pub fn kind(&self) -> ResourceKind {
        match self {
            WatchTarget::Resource { kind, .. } => *kind,
            WatchTarget::Logs { .. } => ResourceKind::Logs,
        }
    }
}

impl fmt::Display for WatchTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WatchTarget::Resource { kind, namespace } => write!(f, "{kind} in {namespace}"),
            WatchTarget::Logs { namespace, pod } => write!(f, "logs of {namespace}/{pod}"),
        }
    }
}

/// Full collection pushed by the backend on each watch update
pub type Snapshot = Vec<serde_json::Value>;

/// Opaque token returned by the backend subscription call
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SubscriptionToken(String);

impl SubscriptionToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SubscriptionToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
