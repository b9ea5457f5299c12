//! Local process backend
//!
//! Runs `execute_command_live` requests as child processes of this
//! process and streams their stdout/stderr lines back as output events.
//! Cluster commands are not available locally.

use super::{commands, CommandBridge};
use crate::error::BridgeError;
use crate::events::EventPublisher;
use crate::session::SessionId;
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ExecuteArgs {
    command: String,
    #[serde(default)]
    args: Vec<String>,
    working_directory: Option<PathBuf>,
    process_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CancelArgs {
    process_id: String,
}

#[derive(Default)]
struct KillSwitches {
    armed: HashMap<String, oneshot::Sender<()>>,
    /// Cancels that arrived before their execute call
    early: HashSet<String>,
}

#[derive(Clone)]
pub struct LocalBridge {
    publisher: EventPublisher,
    kill_switches: Arc<Mutex<KillSwitches>>,
}

impl LocalBridge {
    pub fn new(publisher: EventPublisher) -> Self {
        Self {
            publisher,
            kill_switches: Arc::new(Mutex::new(KillSwitches::default())),
        }
    }

    fn switches(&self) -> MutexGuard<'_, KillSwitches> {
        self.kill_switches
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Number of child processes currently tracked
    pub fn running(&self) -> usize {
        self.switches().armed.len()
    }

    fn normalize_line(mut line: String) -> String {
        if line.ends_with('\n') {
            line.pop();
            if line.ends_with('\r') {
                line.pop();
            }
        }
        line
    }

    /// Forward every line of `reader` as output for `session_id`
    fn pump_lines<R>(&self, reader: R, session_id: SessionId) -> JoinHandle<()>
    where
        R: AsyncRead + Send + Unpin + 'static,
    {
        let publisher = self.publisher.clone();
        tokio::spawn(async move {
            let mut reader = BufReader::new(reader);
            loop {
                let mut line = String::new();
                match reader.read_line(&mut line).await {
                    Ok(0) => break,
                    Ok(_) => {
                        if !publisher.output(&session_id, Self::normalize_line(line)) {
                            break;
                        }
                    }
                    Err(e) => {
                        warn!(session_id = %session_id, "Failed to read process output: {}", e);
                        break;
                    }
                }
            }
        })
    }

    fn parse_args<T: for<'de> Deserialize<'de>>(command: &str, args: Value) -> Result<T, BridgeError> {
        serde_json::from_value(args)
            .map_err(|e| BridgeError::failed(command, format!("Invalid arguments: {e}")))
    }

    async fn execute(&self, args: Value) -> Result<Value, BridgeError> {
        let request: ExecuteArgs = Self::parse_args(commands::EXECUTE_COMMAND, args)?;
        let session_id = SessionId::from_string(request.process_id.clone());

        // Armed before spawning so a cancel racing this call always finds it
        let (kill_tx, kill_rx) = oneshot::channel();
        {
            let mut switches = self.switches();
            if switches.early.remove(&request.process_id) {
                debug!(session_id = %session_id, "Cancelled before spawn");
                return Err(BridgeError::failed(commands::EXECUTE_COMMAND, "Process was killed"));
            }
            switches.armed.insert(request.process_id.clone(), kill_tx);
        }

        let mut cmd = Command::new(&request.command);
        cmd.args(&request.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &request.working_directory {
            cmd.current_dir(dir);
        }

        debug!(session_id = %session_id, "Spawning {} {:?}", request.command, request.args);
        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                self.switches().armed.remove(&request.process_id);
                return Err(BridgeError::failed(
                    commands::EXECUTE_COMMAND,
                    format!("Failed to spawn '{}': {}", request.command, e),
                ));
            }
        };

        let mut pumps = Vec::with_capacity(2);
        if let Some(stdout) = child.stdout.take() {
            pumps.push(self.pump_lines(stdout, session_id.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            pumps.push(self.pump_lines(stderr, session_id.clone()));
        }

        let exited = tokio::select! {
            status = child.wait() => Some(status),
            _ = kill_rx => None,
        };

        self.switches().armed.remove(&request.process_id);

        let result = match exited {
            Some(status) => status.map_err(|e| {
                BridgeError::failed(commands::EXECUTE_COMMAND, format!("Failed to wait for process: {e}"))
            }),
            None => {
                if let Err(e) = child.kill().await {
                    warn!(session_id = %session_id, "Failed to kill process: {}", e);
                }
                Err(BridgeError::failed(commands::EXECUTE_COMMAND, "Process was killed"))
            }
        };

        // All output is published before the call resolves
        for pump in pumps {
            if let Err(e) = pump.await {
                warn!(session_id = %session_id, "Output reader task failed: {}", e);
            }
        }

        let status = result?;
        let error_message = match status.code() {
            Some(0) => None,
            Some(code) => Some(format!("Process exited with code {code}")),
            None => Some("Process terminated by signal".to_string()),
        };
        Ok(json!({
            "success": status.success(),
            "exit_code": status.code(),
            "error_message": error_message,
        }))
    }

    /// Kill a tracked process. An id with no process yet is remembered so
    /// its execute call is refused when it arrives.
    fn cancel(&self, args: Value) -> Result<Value, BridgeError> {
        let request: CancelArgs = Self::parse_args(commands::CANCEL_PROCESS, args)?;
        let mut switches = self.switches();
        match switches.armed.remove(&request.process_id) {
            Some(kill) => {
                // The receiver is gone only if the process already exited
                let _ = kill.send(());
                Ok(json!({ "success": true }))
            }
            None => {
                debug!("Process {} not started yet, parking cancel", request.process_id);
                switches.early.insert(request.process_id);
                Ok(json!({ "success": true, "pending": true }))
            }
        }
    }
}

#[async_trait]
impl CommandBridge for LocalBridge {
    async fn invoke(&self, command: &str, args: Value) -> Result<Value, BridgeError> {
        match command {
            commands::EXECUTE_COMMAND => self.execute(args).await,
            commands::CANCEL_PROCESS => self.cancel(args),
            other => Err(BridgeError::Unsupported(other.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{self, BackendEvent};

    #[test]
    fn test_normalize_line() {
        assert_eq!(LocalBridge::normalize_line("a\r\n".to_string()), "a");
        assert_eq!(LocalBridge::normalize_line("b\n".to_string()), "b");
        assert_eq!(LocalBridge::normalize_line("c".to_string()), "c");
    }

    #[tokio::test]
    async fn test_cluster_commands_unsupported() {
        let (publisher, _inbox) = events::channel();
        let bridge = LocalBridge::new(publisher);
        let err = bridge.invoke("k8s_watch_pods", json!({})).await.unwrap_err();
        assert_eq!(err, BridgeError::Unsupported("k8s_watch_pods".to_string()));
    }

    #[tokio::test]
    async fn test_cancel_before_execute_refuses_spawn() {
        let (publisher, _inbox) = events::channel();
        let bridge = LocalBridge::new(publisher);
        let ack = bridge
            .invoke(commands::CANCEL_PROCESS, json!({"processId": "process-x"}))
            .await
            .unwrap();
        assert_eq!(ack["pending"], json!(true));

        let err = bridge
            .invoke(
                commands::EXECUTE_COMMAND,
                json!({"command": "sleep", "args": ["30"], "processId": "process-x"}),
            )
            .await
            .unwrap_err();
        assert!(err.to_string().contains("Process was killed"));
        assert_eq!(bridge.running(), 0);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_execute_streams_output_before_resolving() {
        let (publisher, mut inbox) = events::channel();
        let bridge = LocalBridge::new(publisher);
        let result = bridge
            .invoke(
                commands::EXECUTE_COMMAND,
                json!({
                    "command": "sh",
                    "args": ["-c", "echo one; echo two; exit 3"],
                    "processId": "process-1",
                }),
            )
            .await
            .unwrap();

        assert_eq!(result["success"], json!(false));
        assert_eq!(result["exit_code"], json!(3));

        let mut lines = Vec::new();
        while let Some(event) = inbox.try_recv() {
            if let BackendEvent::CommandOutput { line, .. } = event {
                lines.push(line);
            }
        }
        assert_eq!(lines, vec!["one", "two"]);
        assert_eq!(bridge.running(), 0);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_cancel_kills_running_process() {
        let (publisher, _inbox) = events::channel();
        let bridge = LocalBridge::new(publisher);
        let runner = bridge.clone();
        let run = tokio::spawn(async move {
            runner
                .invoke(
                    commands::EXECUTE_COMMAND,
                    json!({"command": "sleep", "args": ["30"], "processId": "process-2"}),
                )
                .await
        });

        while bridge.running() == 0 {
            tokio::task::yield_now().await;
        }
        bridge
            .invoke(commands::CANCEL_PROCESS, json!({"processId": "process-2"}))
            .await
            .unwrap();

        let outcome = run.await.unwrap();
        assert!(outcome.is_err());
    }

    #[tokio::test]
    async fn test_spawn_failure_is_an_error() {
        let (publisher, _inbox) = events::channel();
        let bridge = LocalBridge::new(publisher);
        let err = bridge
            .invoke(
                commands::EXECUTE_COMMAND,
                json!({"command": "definitely-not-a-real-binary-xyz", "processId": "p"}),
            )
            .await
            .unwrap_err();
        assert!(err.to_string().contains("Failed to spawn"));
        assert_eq!(bridge.running(), 0);
    }
}
