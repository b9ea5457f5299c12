use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use super::CommandBridge;
use crate::error::BridgeError;
use crate::events::EventPublisher;
use crate::session::{SessionId, Snapshot};

/// Scripted backend for tests: each expectation matches a command name (and
/// optionally its arguments), may push events for the session named in the
/// arguments, and then resolves with a canned response.
#[derive(Clone)]
pub struct MockBridge {
    expectations: Arc<Mutex<Vec<MockExpectation>>>,
    call_history: Arc<Mutex<Vec<BridgeCall>>>,
    publisher: EventPublisher,
    next_token: Arc<AtomicU64>,
}

/// A recorded invocation
#[derive(Debug, Clone, PartialEq)]
pub struct BridgeCall {
    pub command: String,
    pub args: Value,
}

impl BridgeCall {
    /// Session id the call was correlated with, if any
    pub fn session_id(&self) -> Option<SessionId> {
        session_id_from(&self.args)
    }
}

#[derive(Clone)]
enum MockResponse {
    Value(Value),
    Error(BridgeError),
    Token,
}

type ArgsMatcher = Arc<dyn Fn(&Value) -> bool + Send + Sync>;

#[derive(Clone)]
struct MockExpectation {
    command: String,
    args_matcher: Option<ArgsMatcher>,
    response: MockResponse,
    output: Vec<String>,
    snapshots: Vec<Snapshot>,
    delay: Option<Duration>,
    times_called: usize,
    expected_times: Option<usize>,
}

impl MockExpectation {
    fn matches(&self, command: &str, args: &Value) -> bool {
        if self.command != command {
            return false;
        }
        if let Some(expected) = self.expected_times {
            if self.times_called >= expected {
                return false;
            }
        }
        match &self.args_matcher {
            Some(matcher) => matcher(args),
            None => true,
        }
    }
}

pub struct MockExpectationConfig {
    bridge: MockBridge,
    expectation: MockExpectation,
}

fn session_id_from(args: &Value) -> Option<SessionId> {
    args.get("processId")
        .or_else(|| args.get("sessionId"))
        .and_then(Value::as_str)
        .map(|id| SessionId::from_string(id.to_string()))
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl MockBridge {
    pub fn new(publisher: EventPublisher) -> Self {
        Self {
            expectations: Arc::new(Mutex::new(Vec::new())),
            call_history: Arc::new(Mutex::new(Vec::new())),
            publisher,
            next_token: Arc::new(AtomicU64::new(1)),
        }
    }

    pub fn expect(&self, command: &str) -> MockExpectationConfig {
        MockExpectationConfig {
            bridge: self.clone(),
            expectation: MockExpectation {
                command: command.to_string(),
                args_matcher: None,
                response: MockResponse::Value(Value::Null),
                output: Vec::new(),
                snapshots: Vec::new(),
                delay: None,
                times_called: 0,
                expected_times: None,
            },
        }
    }

    /// Handle for pushing backend events outside of a scripted call
    pub fn publisher(&self) -> EventPublisher {
        self.publisher.clone()
    }

    pub fn calls(&self) -> Vec<BridgeCall> {
        lock(&self.call_history).clone()
    }

    pub fn calls_to(&self, command: &str) -> Vec<BridgeCall> {
        lock(&self.call_history)
            .iter()
            .filter(|call| call.command == command)
            .cloned()
            .collect()
    }

    pub fn call_count(&self, command: &str) -> usize {
        lock(&self.call_history)
            .iter()
            .filter(|call| call.command == command)
            .count()
    }

    pub fn verify_called(&self, command: &str, times: usize) -> bool {
        self.call_count(command) == times
    }

    pub fn reset(&self) {
        lock(&self.expectations).clear();
        lock(&self.call_history).clear();
    }
}

#[async_trait]
impl CommandBridge for MockBridge {
    async fn invoke(&self, command: &str, args: Value) -> Result<Value, BridgeError> {
        lock(&self.call_history).push(BridgeCall {
            command: command.to_string(),
            args: args.clone(),
        });

        let plan = {
            let mut expectations = lock(&self.expectations);
            expectations
                .iter_mut()
                .find(|expectation| expectation.matches(command, &args))
                .map(|expectation| {
                    expectation.times_called += 1;
                    expectation.clone()
                })
        };

        let Some(plan) = plan else {
            return Err(BridgeError::failed(
                command,
                format!("No expectation found for command: {command} {args}"),
            ));
        };

        if let Some(delay) = plan.delay {
            tokio::time::sleep(delay).await;
        }

        if let Some(session_id) = session_id_from(&args) {
            for line in plan.output {
                self.publisher.output(&session_id, line);
            }
            for snapshot in plan.snapshots {
                self.publisher.snapshot(&session_id, snapshot);
            }
        }

        match plan.response {
            MockResponse::Value(value) => Ok(value),
            MockResponse::Error(error) => Err(error),
            MockResponse::Token => {
                let n = self.next_token.fetch_add(1, Ordering::SeqCst);
                Ok(json!(format!("mock-sub-{n}")))
            }
        }
    }
}

impl MockExpectationConfig {
    pub fn with_args<F>(mut self, matcher: F) -> Self
    where
        F: Fn(&Value) -> bool + Send + Sync + 'static,
    {
        self.expectation.args_matcher = Some(Arc::new(matcher));
        self
    }

    pub fn returns(mut self, value: Value) -> Self {
        self.expectation.response = MockResponse::Value(value);
        self
    }

    /// Resolve with a fresh subscription token
    pub fn returns_token(mut self) -> Self {
        self.expectation.response = MockResponse::Token;
        self
    }

    /// Resolve like a finished `execute_command_live` call
    pub fn returns_exit_code(mut self, code: i32) -> Self {
        self.expectation.response = MockResponse::Value(json!({
            "success": code == 0,
            "exit_code": code,
        }));
        self
    }

    pub fn fails(mut self, message: &str) -> Self {
        let error = BridgeError::failed(&self.expectation.command, message);
        self.expectation.response = MockResponse::Error(error);
        self
    }

    pub fn fails_with(mut self, error: BridgeError) -> Self {
        self.expectation.response = MockResponse::Error(error);
        self
    }

    pub fn emits_output<I, S>(mut self, lines: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.expectation
            .output
            .extend(lines.into_iter().map(Into::into));
        self
    }

    pub fn emits_snapshot(mut self, snapshot: Snapshot) -> Self {
        self.expectation.snapshots.push(snapshot);
        self
    }

    pub fn delayed(mut self, delay: Duration) -> Self {
        self.expectation.delay = Some(delay);
        self
    }

    /// Match at most `n` calls; later calls fall through to the next
    /// expectation for the same command
    pub fn times(mut self, n: usize) -> Self {
        self.expectation.expected_times = Some(n);
        self
    }

    pub fn finish(self) {
        lock(&self.bridge.expectations).push(self.expectation);
    }
}
