//! Command bridge into the native backend
//!
//! Every interaction with the backend goes through [`CommandBridge::invoke`].
//! Streaming operations are correlated with the session id passed in the
//! arguments; the backend pushes their events through an
//! [`EventPublisher`](crate::events::EventPublisher).

pub mod local;
pub mod mock;

pub use local::LocalBridge;
pub use mock::{BridgeCall, MockBridge, MockExpectationConfig};

use crate::error::BridgeError;
use crate::session::SubscriptionToken;
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;

/// Backend command names
pub mod commands {
    pub const INIT: &str = "init_k8s";
    pub const HEALTH_CHECK: &str = "k8s_health_check";
    pub const EXECUTE_COMMAND: &str = "execute_command_live";
    pub const CANCEL_PROCESS: &str = "cancel_process";
    pub const UNWATCH: &str = "k8s_unwatch";
}

#[async_trait]
pub trait CommandBridge: Send + Sync {
    /// Forward a named operation to the backend
    async fn invoke(&self, command: &str, args: Value) -> Result<Value, BridgeError>;
}

/// Result of a finished `execute_command_live` call
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct CommandResult {
    pub success: bool,
    pub exit_code: Option<i32>,
    pub error_message: Option<String>,
}

impl CommandResult {
    pub fn from_value(value: Value) -> Result<Self, BridgeError> {
        serde_json::from_value(value).map_err(|e| BridgeError::InvalidResponse {
            command: commands::EXECUTE_COMMAND.to_string(),
            message: e.to_string(),
        })
    }
}

/// Extract the subscription token from a watch command response.
///
/// Accepts either a bare string or an object carrying a `token` field.
pub fn parse_subscription_token(command: &str, value: &Value) -> Result<SubscriptionToken, BridgeError> {
    let token = match value {
        Value::String(token) => Some(token.as_str()),
        Value::Object(map) => map.get("token").and_then(Value::as_str),
        _ => None,
    };

    match token {
        Some(token) if !token.is_empty() => Ok(SubscriptionToken::new(token)),
        _ => Err(BridgeError::InvalidResponse {
            command: command.to_string(),
            message: format!("expected a subscription token, got {value}"),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_command_result_defaults() {
        let result = CommandResult::from_value(json!({"success": true})).unwrap();
        assert!(result.success);
        assert_eq!(result.exit_code, None);

        let result = CommandResult::from_value(json!({
            "success": false,
            "output": "ignored",
            "exit_code": 2,
            "error_message": "boom"
        }))
        .unwrap();
        assert_eq!(result.exit_code, Some(2));
        assert_eq!(result.error_message.as_deref(), Some("boom"));

        assert!(CommandResult::from_value(json!("nope")).is_err());
    }

    #[test]
    fn test_parse_subscription_token() {
        assert_eq!(
            parse_subscription_token("k8s_watch_pods", &json!("sub-1")).unwrap(),
            SubscriptionToken::new("sub-1")
        );
        assert_eq!(
            parse_subscription_token("k8s_watch_pods", &json!({"token": "sub-2"})).unwrap(),
            SubscriptionToken::new("sub-2")
        );
        assert!(parse_subscription_token("k8s_watch_pods", &json!(null)).is_err());
        assert!(parse_subscription_token("k8s_watch_pods", &json!("")).is_err());
    }
}
