//! Wire protocol types for supervisor-bridge communication.
//!
//! A single tagged union travels in both directions:
//! - **Inbound** (supervisor → bridge): Ping, Execute, Stop
//! - **Outbound** (bridge → supervisor): Pong, ExecutionStarted, Log, ExecutionComplete,
//!   Artifact, ResourceUpdate, Error

use std::collections::BTreeMap;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One message unit crossing the process boundary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Envelope {
    Ping,

    /// Readiness signal and ping reply.
    Pong {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        version: Option<String>,
    },

    Execute {
        request: ExecutionRequest,
    },

    Stop {
        execution_id: String,
    },

    ExecutionStarted {
        response: ExecutionResponse,
    },

    Log {
        log: LogEntry,
    },

    /// Terminal signal for an execution. Emitted exactly once per execution id.
    ExecutionComplete {
        execution_id: String,
        status: ExecutionStatus,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error_message: Option<String>,
    },

    Artifact {
        artifact: Artifact,
    },

    ResourceUpdate {
        execution_id: String,
        usage: ResourceUsage,
    },

    Error {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        execution_id: Option<String>,
        error: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        details: Option<serde_json::Value>,
    },
}

impl Envelope {
    pub fn pong() -> Self {
        Self::Pong {
            version: Some(crate::BRIDGE_VERSION.to_string()),
        }
    }

    pub fn error(
        execution_id: Option<&str>,
        error: impl Into<String>,
        details: Option<serde_json::Value>,
    ) -> Self {
        Self::Error {
            execution_id: execution_id.map(str::to_string),
            error: error.into(),
            details,
        }
    }

    pub fn complete(
        execution_id: impl Into<String>,
        status: ExecutionStatus,
        error_message: Option<String>,
    ) -> Self {
        Self::ExecutionComplete {
            execution_id: execution_id.into(),
            status,
            error_message,
        }
    }

    /// Execution id this envelope refers to, if any.
    pub fn execution_id(&self) -> Option<&str> {
        match self {
            Self::Ping | Self::Pong { .. } => None,
            Self::Execute { request } => Some(&request.execution_id),
            Self::Stop { execution_id } => Some(execution_id),
            Self::ExecutionStarted { response } => Some(&response.execution_id),
            Self::Log { log } => Some(&log.execution_id),
            Self::ExecutionComplete { execution_id, .. } => Some(execution_id),
            Self::Artifact { artifact } => Some(&artifact.execution_id),
            Self::ResourceUpdate { execution_id, .. } => Some(execution_id),
            Self::Error { execution_id, .. } => execution_id.as_deref(),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Ping => "ping",
            Self::Pong { .. } => "pong",
            Self::Execute { .. } => "execute",
            Self::Stop { .. } => "stop",
            Self::ExecutionStarted { .. } => "execution_started",
            Self::Log { .. } => "log",
            Self::ExecutionComplete { .. } => "execution_complete",
            Self::Artifact { .. } => "artifact",
            Self::ResourceUpdate { .. } => "resource_update",
            Self::Error { .. } => "error",
        }
    }
}

/// Resource ceilings applied to the engine session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceLimits {
    pub memory_mb: u64,
    pub cpu_cores: f64,
    /// Zero disables the timeout.
    pub timeout_seconds: u64,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            memory_mb: 2048,
            cpu_cores: 1.0,
            timeout_seconds: 0,
        }
    }
}

/// A task-execution request. Immutable once accepted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionRequest {
    pub execution_id: String,
    pub task_id: String,
    pub agent_id: String,
    pub model: String,
    pub prompt: String,
    pub provider: String,
    pub container_image: String,
    #[serde(default)]
    pub resource_limits: ResourceLimits,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workspace_path: Option<PathBuf>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl ExecutionStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Running)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Returned once the engine has accepted a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionResponse {
    pub execution_id: String,
    pub container_id: String,
    pub status: ExecutionStatus,
    pub container_status: String,
    pub session_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
    Fatal,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub execution_id: String,
    pub timestamp: DateTime<Utc>,
    pub level: LogLevel,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack_trace: Option<String>,
    /// Gapless per execution id, starting at 0.
    pub sequence: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactKind {
    File,
    Screenshot,
    TestReport,
    Coverage,
    Output,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Artifact {
    pub execution_id: String,
    pub kind: ArtifactKind,
    pub path: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
    pub mime_type: String,
    /// Storage backend tag, e.g. `local` or `s3`.
    pub storage: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Point-in-time resource sample. The bridge keeps no history.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ResourceUsage {
    pub memory_mb: f64,
    pub cpu_percent: f64,
}
