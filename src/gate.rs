//! Connection gate
//!
//! Guards backend client initialization. Concurrent callers share one
//! in-flight initialization, failed attempts are bounded, and once the
//! bound is reached no further backend calls are made until
//! [`ConnectionGate::reset_init_state`].

use crate::bridge::{commands, CommandBridge};
use crate::error::{Result, SessionError};
use futures::future::{BoxFuture, FutureExt, Shared};
use serde_json::{json, Value};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, info, warn};

type InitFuture = Shared<BoxFuture<'static, bool>>;

struct GateState {
    initialized: bool,
    in_flight: Option<InitFuture>,
    attempts: u32,
    max_attempts: u32,
    /// Bumped on reset so a stale in-flight attempt cannot write back
    generation: u64,
}

pub struct ConnectionGate {
    bridge: Arc<dyn CommandBridge>,
    state: Arc<Mutex<GateState>>,
}

fn lock(state: &Mutex<GateState>) -> MutexGuard<'_, GateState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

impl ConnectionGate {
    pub fn new(bridge: Arc<dyn CommandBridge>, max_attempts: u32) -> Self {
        Self {
            bridge,
            state: Arc::new(Mutex::new(GateState {
                initialized: false,
                in_flight: None,
                attempts: 0,
                max_attempts,
                generation: 0,
            })),
        }
    }

    /// Make sure the backend client is initialized.
    ///
    /// Returns immediately when already initialized. Callers arriving while
    /// an initialization is in flight await that same attempt and observe
    /// its outcome. Once the attempt limit is reached this returns false
    /// without contacting the backend.
    pub async fn ensure_connected(&self) -> bool {
        let init = {
            let mut state = lock(&self.state);
            if state.initialized {
                debug!("Backend client already initialized");
                return true;
            }
            if let Some(in_flight) = &state.in_flight {
                debug!("Backend initialization already in progress, waiting");
                in_flight.clone()
            } else if state.attempts >= state.max_attempts {
                warn!(
                    "Backend initialization attempts exhausted ({}/{})",
                    state.attempts, state.max_attempts
                );
                return false;
            } else {
                let init = Self::initialize(
                    self.bridge.clone(),
                    self.state.clone(),
                    state.generation,
                    state.attempts + 1,
                    state.max_attempts,
                )
                .boxed()
                .shared();
                state.in_flight = Some(init.clone());
                init
            }
        };

        init.await
    }

    async fn initialize(
        bridge: Arc<dyn CommandBridge>,
        state: Arc<Mutex<GateState>>,
        generation: u64,
        attempt: u32,
        max_attempts: u32,
    ) -> bool {
        info!("Initializing backend client (attempt {attempt}/{max_attempts})");
        let result = bridge.invoke(commands::INIT, json!({})).await;

        let mut state = lock(&state);
        let current = state.generation == generation;
        if current {
            state.in_flight = None;
        }

        match result {
            Ok(_) => {
                if current {
                    state.initialized = true;
                    state.attempts = 0;
                }
                info!("Backend client initialized");
                true
            }
            Err(e) => {
                if current {
                    state.attempts += 1;
                }
                warn!("Failed to initialize backend client (attempt {attempt}/{max_attempts}): {e}");
                false
            }
        }
    }

    /// Clear the initialized flag, the attempt counter and any in-flight
    /// attempt. Callers already awaiting that attempt still receive its
    /// result, but it no longer updates the gate.
    pub fn reset_init_state(&self) {
        let mut state = lock(&self.state);
        state.initialized = false;
        state.in_flight = None;
        state.attempts = 0;
        state.generation += 1;
        debug!("Backend initialization state reset");
    }

    /// Lightweight probe that never touches initialization state
    pub async fn health_check(&self) -> bool {
        match self.bridge.invoke(commands::HEALTH_CHECK, json!({})).await {
            Ok(Value::Bool(healthy)) => healthy,
            Ok(_) => true,
            Err(e) => {
                warn!("Backend health check failed: {}", e);
                false
            }
        }
    }

    pub fn is_ready(&self) -> bool {
        lock(&self.state).initialized
    }

    pub fn attempts(&self) -> u32 {
        lock(&self.state).attempts
    }

    pub fn max_attempts(&self) -> u32 {
        lock(&self.state).max_attempts
    }

    /// Fail with a connection error unless initialized. Never triggers an
    /// initialization attempt.
    pub fn require_ready(&self) -> Result<()> {
        let state = lock(&self.state);
        if state.initialized {
            Ok(())
        } else {
            Err(SessionError::Connection {
                attempts: state.attempts,
                max_attempts: state.max_attempts,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::MockBridge;
    use crate::events;
    use std::time::Duration;

    fn gate_with(bridge: &MockBridge, max_attempts: u32) -> ConnectionGate {
        ConnectionGate::new(Arc::new(bridge.clone()), max_attempts)
    }

    #[tokio::test]
    async fn test_concurrent_callers_share_one_attempt() {
        let (publisher, _inbox) = events::channel();
        let bridge = MockBridge::new(publisher);
        bridge
            .expect("init_k8s")
            .returns(json!(true))
            .delayed(Duration::from_millis(20))
            .finish();
        let gate = gate_with(&bridge, 3);

        let results = futures::future::join_all((0..8).map(|_| gate.ensure_connected())).await;

        assert!(results.iter().all(|ok| *ok));
        assert_eq!(bridge.call_count("init_k8s"), 1);
        assert!(gate.is_ready());

        // Initialized: no further backend calls
        assert!(gate.ensure_connected().await);
        assert_eq!(bridge.call_count("init_k8s"), 1);
    }

    #[tokio::test]
    async fn test_concurrent_callers_share_one_failure() {
        let (publisher, _inbox) = events::channel();
        let bridge = MockBridge::new(publisher);
        bridge
            .expect("init_k8s")
            .fails("cluster unreachable")
            .delayed(Duration::from_millis(20))
            .finish();
        let gate = gate_with(&bridge, 3);

        let results = futures::future::join_all((0..8).map(|_| gate.ensure_connected())).await;

        assert!(results.iter().all(|ok| !*ok));
        assert_eq!(bridge.call_count("init_k8s"), 1);
        assert_eq!(gate.attempts(), 1);
        assert!(!gate.is_ready());
    }

    #[tokio::test]
    async fn test_attempts_exhausted_short_circuits() {
        let (publisher, _inbox) = events::channel();
        let bridge = MockBridge::new(publisher);
        bridge.expect("init_k8s").fails("no kubeconfig").finish();
        let gate = gate_with(&bridge, 3);

        for attempt in 1..=3 {
            assert!(!gate.ensure_connected().await);
            assert_eq!(gate.attempts(), attempt);
        }
        assert!(!gate.ensure_connected().await);
        assert_eq!(bridge.call_count("init_k8s"), 3);

        gate.reset_init_state();
        assert_eq!(gate.attempts(), 0);
        assert!(!gate.ensure_connected().await);
        assert_eq!(bridge.call_count("init_k8s"), 4);
    }

    #[tokio::test]
    async fn test_success_resets_attempts() {
        let (publisher, _inbox) = events::channel();
        let bridge = MockBridge::new(publisher);
        bridge.expect("init_k8s").fails("timeout").times(2).finish();
        bridge.expect("init_k8s").returns(json!(true)).finish();
        let gate = gate_with(&bridge, 3);

        assert!(!gate.ensure_connected().await);
        assert!(!gate.ensure_connected().await);
        assert_eq!(gate.attempts(), 2);
        assert!(gate.require_ready().is_err());

        assert!(gate.ensure_connected().await);
        assert_eq!(gate.attempts(), 0);
        assert!(gate.require_ready().is_ok());
    }

    #[tokio::test]
    async fn test_health_check_leaves_state_alone() {
        let (publisher, _inbox) = events::channel();
        let bridge = MockBridge::new(publisher);
        bridge.expect("k8s_health_check").returns(json!(false)).times(1).finish();
        bridge.expect("k8s_health_check").fails("unreachable").finish();
        let gate = gate_with(&bridge, 3);

        assert!(!gate.health_check().await);
        assert!(!gate.health_check().await);
        assert_eq!(gate.attempts(), 0);
        assert!(!gate.is_ready());
        assert_eq!(bridge.call_count("init_k8s"), 0);
    }

    #[tokio::test]
    async fn test_reset_during_flight_discards_result() {
        let (publisher, _inbox) = events::channel();
        let bridge = MockBridge::new(publisher);
        bridge
            .expect("init_k8s")
            .returns(json!(true))
            .delayed(Duration::from_millis(30))
            .finish();
        let gate = Arc::new(gate_with(&bridge, 3));

        let waiter = {
            let gate = gate.clone();
            tokio::spawn(async move { gate.ensure_connected().await })
        };
        tokio::time::sleep(Duration::from_millis(5)).await;
        gate.reset_init_state();

        assert!(waiter.await.unwrap());
        assert!(!gate.is_ready());
    }
}
