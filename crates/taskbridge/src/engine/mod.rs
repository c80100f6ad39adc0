//! Execution engine capability interface.
//!
//! The bridge core only talks to engines through [`ExecutionEngine`]. Engines report
//! progress by pushing [`EngineEvent`]s through the [`EngineEvents`] handle they are
//! given at session creation; every event lands on one per-process channel that the
//! session manager drains in order.

use std::collections::BTreeMap;
use std::io;
use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::sync::mpsc;

use crate::bridge::protocol::{ArtifactKind, ExecutionStatus, LogLevel, ResourceUsage};

pub mod command;
#[cfg(test)]
pub(crate) mod mock;

pub use command::{CommandEngine, LaunchMode};

/// Engine-facing configuration derived from an execution request.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionConfig {
    pub execution_id: String,
    pub task_id: String,
    pub agent_id: String,
    pub model: String,
    pub provider: String,
    pub image: String,
    pub memory_mb: u64,
    pub cpu_cores: f64,
    pub timeout: Option<Duration>,
    pub workspace: Option<PathBuf>,
    pub env: BTreeMap<String, String>,
}

/// Opaque handle to a session living inside the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineSession {
    pub session_id: String,
    pub container_id: String,
    pub container_status: String,
}

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("failed to launch session: {0}")]
    Spawn(#[source] io::Error),

    #[error("engine I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("engine rejected request: {0}")]
    Rejected(String),

    #[error("engine call timed out after {0:?}")]
    Timeout(Duration),

    #[error("engine session {0} is not running")]
    NotRunning(String),
}

/// Capability interface implemented by concrete engines.
#[async_trait]
pub trait ExecutionEngine: Send + Sync + 'static {
    fn name(&self) -> &str;

    /// Create a session. `events` is the session's subscription: everything the engine
    /// reports for this session must go through it.
    async fn create_session(
        &self,
        config: SessionConfig,
        events: EngineEvents,
    ) -> Result<EngineSession, EngineError>;

    /// Hand the task prompt to a created session. Returns once the engine accepted it.
    async fn prompt(&self, session: &EngineSession, prompt: &str) -> Result<(), EngineError>;

    /// Stop a session and wait for it to settle.
    async fn stop_session(&self, session: &EngineSession) -> Result<(), EngineError>;
}

/// Log line reported by an engine, before sequencing.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct LogEvent {
    #[serde(default = "default_level")]
    pub level: LogLevel,
    pub message: String,
    #[serde(default)]
    pub source: Option<String>,
    #[serde(default)]
    pub metadata: Option<serde_json::Value>,
    #[serde(default)]
    pub stack_trace: Option<String>,
}

fn default_level() -> LogLevel {
    LogLevel::Info
}

impl LogEvent {
    pub fn new(level: LogLevel, message: impl Into<String>) -> Self {
        Self {
            level,
            message: message.into(),
            source: None,
            metadata: None,
            stack_trace: None,
        }
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }

    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = Some(metadata);
        self
    }
}

/// Artifact reported by an engine. Missing name, mime type and storage are filled in
/// by the multiplexer.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ArtifactEvent {
    pub kind: ArtifactKind,
    pub path: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub size: Option<u64>,
    #[serde(default)]
    pub mime_type: Option<String>,
    #[serde(default)]
    pub storage: Option<String>,
    #[serde(default)]
    pub checksum: Option<String>,
}

impl ArtifactEvent {
    pub fn new(kind: ArtifactKind, path: impl Into<String>) -> Self {
        Self {
            kind,
            path: path.into(),
            name: None,
            size: None,
            mime_type: None,
            storage: None,
            checksum: None,
        }
    }
}

/// Engine notification. Also the NDJSON vocabulary agents print on stdout.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EngineEvent {
    Log(LogEvent),

    Error {
        message: String,
        #[serde(default)]
        stack_trace: Option<String>,
        #[serde(default)]
        fatal: bool,
    },

    Resources(ResourceUsage),

    Artifact(ArtifactEvent),

    Complete {
        status: ExecutionStatus,
        #[serde(default)]
        error: Option<String>,
    },
}

/// An event tagged with the execution it belongs to.
#[derive(Debug, Clone)]
pub struct EngineMessage {
    pub execution_id: String,
    pub event: EngineEvent,
}

/// Per-execution sender handed to the engine at session creation.
///
/// Cheap to clone. Events are queued on an unbounded channel and never block the engine.
#[derive(Debug, Clone)]
pub struct EngineEvents {
    execution_id: String,
    tx: mpsc::UnboundedSender<EngineMessage>,
}

impl EngineEvents {
    pub fn new(execution_id: impl Into<String>, tx: mpsc::UnboundedSender<EngineMessage>) -> Self {
        Self {
            execution_id: execution_id.into(),
            tx,
        }
    }

    pub fn execution_id(&self) -> &str {
        &self.execution_id
    }

    pub fn emit(&self, event: EngineEvent) -> io::Result<()> {
        self.tx
            .send(EngineMessage {
                execution_id: self.execution_id.clone(),
                event,
            })
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "engine event channel closed"))
    }

    pub fn log(&self, level: LogLevel, message: impl Into<String>) -> io::Result<()> {
        self.emit(EngineEvent::Log(LogEvent::new(level, message)))
    }

    pub fn error(&self, message: impl Into<String>, stack_trace: Option<String>) -> io::Result<()> {
        self.emit(EngineEvent::Error {
            message: message.into(),
            stack_trace,
            fatal: false,
        })
    }

    pub fn resources(&self, usage: ResourceUsage) -> io::Result<()> {
        self.emit(EngineEvent::Resources(usage))
    }

    pub fn artifact(&self, artifact: ArtifactEvent) -> io::Result<()> {
        self.emit(EngineEvent::Artifact(artifact))
    }

    pub fn complete(&self, status: ExecutionStatus, error: Option<String>) -> io::Result<()> {
        self.emit(EngineEvent::Complete { status, error })
    }
}
