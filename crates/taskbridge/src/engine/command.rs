//! Command engine - runs each session as a child process.
//!
//! Two launch modes:
//! - **Container**: `<runtime> run --rm -i ... <image>` (docker, podman)
//! - **Host**: a configured agent program run directly, workspace as cwd
//!
//! The agent reads one JSON prompt line on stdin and reports progress as NDJSON
//! [`EngineEvent`]s on stdout. Non-JSON stdout lines become info logs, stderr lines
//! become warn logs.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::{
    EngineError, EngineEvent, EngineEvents, EngineSession, ExecutionEngine, LogEvent,
    SessionConfig,
};
use crate::bridge::protocol::{ExecutionStatus, LogLevel};

/// How sessions are launched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LaunchMode {
    Container { runtime: String },
    Host { program: String, args: Vec<String> },
}

impl Default for LaunchMode {
    fn default() -> Self {
        Self::Container {
            runtime: "docker".to_string(),
        }
    }
}

/// Fully resolved process invocation for one session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchSpec {
    pub program: String,
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub current_dir: Option<PathBuf>,
    pub container_id: Option<String>,
}

const CONTAINER_WORKSPACE: &str = "/workspace";

/// Request metadata exported to the agent alongside the request's own env.
fn agent_env(config: &SessionConfig) -> BTreeMap<String, String> {
    let mut env = config.env.clone();
    env.insert("TASKBRIDGE_EXECUTION_ID".into(), config.execution_id.clone());
    env.insert("TASKBRIDGE_TASK_ID".into(), config.task_id.clone());
    env.insert("TASKBRIDGE_AGENT_ID".into(), config.agent_id.clone());
    env.insert("TASKBRIDGE_MODEL".into(), config.model.clone());
    env.insert("TASKBRIDGE_PROVIDER".into(), config.provider.clone());
    env
}

pub fn launch_spec(mode: &LaunchMode, config: &SessionConfig, session_id: &str) -> LaunchSpec {
    let env = agent_env(config);
    match mode {
        LaunchMode::Container { runtime } => {
            let name = format!("taskbridge-{}", session_id);
            let mut args = vec![
                "run".to_string(),
                "--rm".to_string(),
                "-i".to_string(),
                "--name".to_string(),
                name.clone(),
                "--memory".to_string(),
                format!("{}m", config.memory_mb),
                "--cpus".to_string(),
                config.cpu_cores.to_string(),
            ];
            // Values stay in the runtime's environment, not on its command line.
            for key in env.keys() {
                args.push("-e".to_string());
                args.push(key.clone());
            }
            if let Some(ref workspace) = config.workspace {
                args.push("-v".to_string());
                args.push(format!("{}:{}", workspace.display(), CONTAINER_WORKSPACE));
                args.push("-w".to_string());
                args.push(CONTAINER_WORKSPACE.to_string());
            }
            args.push(config.image.clone());

            LaunchSpec {
                program: runtime.clone(),
                args,
                env,
                current_dir: None,
                container_id: Some(name),
            }
        }
        LaunchMode::Host { program, args } => LaunchSpec {
            program: program.clone(),
            args: args.clone(),
            env,
            current_dir: config.workspace.clone(),
            container_id: None,
        },
    }
}

/// Bound on one `<runtime> kill` / `<runtime> rm -f` call.
const RUNTIME_CALL_TIMEOUT: Duration = Duration::from_secs(10);

/// A named container behind a runtime client process.
#[derive(Debug, Clone)]
struct ContainerRef {
    runtime: String,
    name: String,
}

impl ContainerRef {
    fn for_launch(mode: &LaunchMode, spec: &LaunchSpec) -> Option<Self> {
        match (mode, &spec.container_id) {
            (LaunchMode::Container { runtime }, Some(name)) => Some(Self {
                runtime: runtime.clone(),
                name: name.clone(),
            }),
            _ => None,
        }
    }

    async fn runtime_call(&self, args: &[&str]) -> bool {
        let call = Command::new(&self.runtime)
            .args(args)
            .arg(&self.name)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output();
        match tokio::time::timeout(RUNTIME_CALL_TIMEOUT, call).await {
            Ok(Ok(output)) if output.status.success() => true,
            Ok(Ok(output)) => {
                tracing::debug!(
                    container = %self.name,
                    command = %args.join(" "),
                    status = %output.status,
                    stderr = %String::from_utf8_lossy(&output.stderr).trim(),
                    "Container runtime call failed"
                );
                false
            }
            Ok(Err(e)) => {
                tracing::warn!(container = %self.name, runtime = %self.runtime, error = %e, "Failed to run container runtime");
                false
            }
            Err(_) => {
                tracing::warn!(container = %self.name, command = %args.join(" "), "Container runtime call timed out");
                false
            }
        }
    }

    /// Kill the container itself; killing the client does not reach it.
    async fn kill(&self) {
        if self.runtime_call(&["kill"]).await {
            return;
        }
        if !self.runtime_call(&["rm", "-f"]).await {
            tracing::warn!(container = %self.name, "Container may still be running");
        }
    }
}

struct RunningSession {
    stdin: Mutex<Option<ChildStdin>>,
    cancel: CancellationToken,
    finished: watch::Receiver<bool>,
}

/// Engine that runs every session as a child process.
pub struct CommandEngine {
    mode: LaunchMode,
    stop_grace: Duration,
    sessions: Arc<DashMap<String, Arc<RunningSession>>>,
}

impl CommandEngine {
    pub fn new(mode: LaunchMode) -> Self {
        Self {
            mode,
            stop_grace: Duration::from_secs(5),
            sessions: Arc::new(DashMap::new()),
        }
    }

    pub fn with_stop_grace(mut self, grace: Duration) -> Self {
        self.stop_grace = grace;
        self
    }

    pub fn active_sessions(&self) -> usize {
        self.sessions.len()
    }

    fn running(&self, session_id: &str) -> Option<Arc<RunningSession>> {
        self.sessions.get(session_id).map(|s| Arc::clone(s.value()))
    }
}

#[async_trait]
impl ExecutionEngine for CommandEngine {
    fn name(&self) -> &str {
        match self.mode {
            LaunchMode::Container { .. } => "container",
            LaunchMode::Host { .. } => "host",
        }
    }

    async fn create_session(
        &self,
        config: SessionConfig,
        events: EngineEvents,
    ) -> Result<EngineSession, EngineError> {
        let session_id = uuid::Uuid::new_v4().to_string();
        let spec = launch_spec(&self.mode, &config, &session_id);

        tracing::debug!(
            execution_id = %config.execution_id,
            %session_id,
            program = %spec.program,
            "Launching engine session"
        );

        let mut command = Command::new(&spec.program);
        command
            .args(&spec.args)
            .envs(&spec.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(ref dir) = spec.current_dir {
            command.current_dir(dir);
        }

        let container = ContainerRef::for_launch(&self.mode, &spec);
        let mut child = command.spawn().map_err(EngineError::Spawn)?;
        let pid = child.id();

        let stdin = child.stdin.take();
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| EngineError::Rejected("stdout not captured".to_string()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| EngineError::Rejected("stderr not captured".to_string()))?;

        let stdout_reader = tokio::spawn(read_stdout(stdout, events.clone()));
        let stderr_reader = tokio::spawn(read_stderr(stderr, events.clone()));

        let cancel = CancellationToken::new();
        let (finished_tx, finished_rx) = watch::channel(false);
        self.sessions.insert(
            session_id.clone(),
            Arc::new(RunningSession {
                stdin: Mutex::new(stdin),
                cancel: cancel.clone(),
                finished: finished_rx,
            }),
        );

        let sessions = Arc::clone(&self.sessions);
        let stop_grace = self.stop_grace;
        let timeout = config.timeout;
        let id_for_task = session_id.clone();
        tokio::spawn(async move {
            supervise(
                child,
                Readers {
                    stdout: stdout_reader,
                    stderr: stderr_reader,
                },
                events,
                container,
                cancel,
                timeout,
                stop_grace,
            )
            .await;
            sessions.remove(&id_for_task);
            let _ = finished_tx.send(true);
        });

        let container_id = spec
            .container_id
            .unwrap_or_else(|| format!("pid-{}", pid.unwrap_or_default()));

        Ok(EngineSession {
            session_id,
            container_id,
            container_status: "running".to_string(),
        })
    }

    async fn prompt(&self, session: &EngineSession, prompt: &str) -> Result<(), EngineError> {
        let running = self
            .running(&session.session_id)
            .ok_or_else(|| EngineError::NotRunning(session.session_id.clone()))?;

        let mut guard = running.stdin.lock().await;
        let mut stdin = guard
            .take()
            .ok_or_else(|| EngineError::Rejected("prompt already delivered".to_string()))?;

        let mut line = serde_json::to_vec(&serde_json::json!({ "prompt": prompt }))
            .map_err(|e| EngineError::Rejected(format!("failed to encode prompt: {}", e)))?;
        line.push(b'\n');

        stdin.write_all(&line).await?;
        stdin.flush().await?;
        // Dropping stdin closes it so the agent sees EOF after the prompt.
        Ok(())
    }

    async fn stop_session(&self, session: &EngineSession) -> Result<(), EngineError> {
        let Some(running) = self.running(&session.session_id) else {
            tracing::debug!(session_id = %session.session_id, "Stop requested for finished session");
            return Ok(());
        };

        running.cancel.cancel();
        let mut finished = running.finished.clone();
        finished
            .wait_for(|done| *done)
            .await
            .map_err(|_| EngineError::NotRunning(session.session_id.clone()))?;
        Ok(())
    }
}

struct Readers {
    stdout: JoinHandle<Option<(ExecutionStatus, Option<String>)>>,
    stderr: JoinHandle<()>,
}

enum Outcome {
    Exited(std::io::Result<ExitStatus>),
    Stopped,
    TimedOut(Duration),
}

async fn supervise(
    mut child: Child,
    readers: Readers,
    events: EngineEvents,
    container: Option<ContainerRef>,
    cancel: CancellationToken,
    timeout: Option<Duration>,
    stop_grace: Duration,
) {
    let deadline = async {
        match timeout {
            Some(t) => tokio::time::sleep(t).await,
            None => std::future::pending::<()>().await,
        }
    };

    let outcome = tokio::select! {
        status = child.wait() => Outcome::Exited(status),
        _ = cancel.cancelled() => {
            terminate(&mut child, container.as_ref(), stop_grace).await;
            Outcome::Stopped
        }
        _ = deadline => {
            tracing::debug!(execution_id = %events.execution_id(), "Killing timed out session");
            force_kill(&mut child, container.as_ref()).await;
            Outcome::TimedOut(timeout.unwrap_or_default())
        }
    };

    // Completion must follow every line the agent printed.
    let reported = match tokio::time::timeout(stop_grace, readers.stdout).await {
        Ok(Ok(reported)) => reported,
        _ => None,
    };
    let _ = tokio::time::timeout(stop_grace, readers.stderr).await;

    let (status, error) = match outcome {
        Outcome::Stopped => {
            tracing::debug!(execution_id = %events.execution_id(), "Engine session stopped");
            return;
        }
        Outcome::TimedOut(t) => (
            ExecutionStatus::Failed,
            Some(format!("execution timed out after {}s", t.as_secs())),
        ),
        Outcome::Exited(Err(e)) => (
            ExecutionStatus::Failed,
            Some(format!("failed to wait for agent: {}", e)),
        ),
        Outcome::Exited(Ok(exit)) => match reported {
            Some(reported) => reported,
            None if exit.success() => (ExecutionStatus::Completed, None),
            None => (
                ExecutionStatus::Failed,
                Some(format!("agent exited with {}", exit)),
            ),
        },
    };

    if events.complete(status, error).is_err() {
        tracing::debug!(execution_id = %events.execution_id(), "Event channel closed before completion");
    }
}

/// SIGTERM, then a hard kill after the grace period.
async fn terminate(child: &mut Child, container: Option<&ContainerRef>, grace: Duration) {
    #[cfg(unix)]
    if let Some(pid) = child.id() {
        use nix::sys::signal::{Signal, kill};
        use nix::unistd::Pid;

        // The runtime client proxies SIGTERM to the container.
        if let Err(e) = kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
            tracing::debug!(pid, error = %e, "Failed to send SIGTERM");
        } else if tokio::time::timeout(grace, child.wait()).await.is_ok() {
            return;
        }
    }

    force_kill(child, container).await;
}

/// Kill the container through its runtime first, then the local process.
async fn force_kill(child: &mut Child, container: Option<&ContainerRef>) {
    if let Some(container) = container {
        container.kill().await;
    }
    if let Err(e) = child.kill().await {
        tracing::warn!(error = %e, "Failed to kill engine session");
    }
}

/// Forward agent stdout. Returns the agent-reported completion, if any.
async fn read_stdout<R: AsyncRead + Unpin>(
    stdout: R,
    events: EngineEvents,
) -> Option<(ExecutionStatus, Option<String>)> {
    let mut lines = BufReader::new(stdout).lines();
    let mut reported = None;

    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                if line.trim().is_empty() {
                    continue;
                }
                let event = match serde_json::from_str::<EngineEvent>(&line) {
                    Ok(EngineEvent::Complete { status, error }) => {
                        reported = Some(if status.is_terminal() {
                            (status, error)
                        } else {
                            (
                                ExecutionStatus::Failed,
                                Some(format!("agent reported non-terminal status {}", status)),
                            )
                        });
                        continue;
                    }
                    Ok(event) => event,
                    Err(_) => EngineEvent::Log(LogEvent::new(LogLevel::Info, line).with_source("stdout")),
                };
                if events.emit(event).is_err() {
                    break;
                }
            }
            Ok(None) => break,
            Err(e) => {
                tracing::warn!(execution_id = %events.execution_id(), error = %e, "Agent stdout read failed");
                break;
            }
        }
    }

    reported
}

async fn read_stderr<R: AsyncRead + Unpin>(stderr: R, events: EngineEvents) {
    let mut lines = BufReader::new(stderr).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                if line.trim().is_empty() {
                    continue;
                }
                let event = EngineEvent::Log(LogEvent::new(LogLevel::Warn, line).with_source("stderr"));
                if events.emit(event).is_err() {
                    break;
                }
            }
            Ok(None) => break,
            Err(e) => {
                tracing::warn!(execution_id = %events.execution_id(), error = %e, "Agent stderr read failed");
                break;
            }
        }
    }
}
