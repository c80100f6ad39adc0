//! Session arena.
//!
//! One [`Session`] per accepted execution id, owned by the session manager's actor.
//! Nothing else mutates the table, so completion and explicit stop can never both
//! remove the same session.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::oneshot;

use crate::bridge::protocol::{ExecutionRequest, ExecutionStatus};
use crate::engine::{EngineEvent, EngineSession};

/// Default number of terminal execution ids remembered.
pub const DEFAULT_FINISHED_RETENTION: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// Engine session creation in flight.
    Starting,
    Running,
    /// Engine stop call in flight.
    Stopping,
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SessionError {
    #[error("execution {execution_id} is already active")]
    DuplicateExecution { execution_id: String },

    #[error("execution {execution_id} already finished with status {status}")]
    AlreadyFinished {
        execution_id: String,
        status: ExecutionStatus,
    },

    #[error("execution {execution_id} not found")]
    NotFound { execution_id: String },

    #[error("failed to start execution {execution_id}: {message}")]
    Engine {
        execution_id: String,
        message: String,
    },

    #[error("bridge is shutting down")]
    ShuttingDown,

    #[error("session manager is closed")]
    Closed,
}

pub(crate) type Waiter = oneshot::Sender<Result<(), SessionError>>;

/// Live record of one accepted execution.
pub(crate) struct Session {
    pub(crate) request: Arc<ExecutionRequest>,
    pub(crate) engine: Option<EngineSession>,
    pub(crate) state: SessionState,
    next_sequence: u64,
    pub(crate) started_at: DateTime<Utc>,
    /// Engine events received while `Starting`, flushed after execution_started.
    pub(crate) pending: Vec<EngineEvent>,
    pub(crate) start_waiter: Option<Waiter>,
    pub(crate) stop_waiters: Vec<Waiter>,
    /// Stop arrived while `Starting`; issued once creation settles.
    pub(crate) stop_requested: bool,
    /// Engine stop failures are logged but not reported to the supervisor.
    pub(crate) stop_quietly: bool,
}

impl Session {
    pub(crate) fn new(request: Arc<ExecutionRequest>) -> Self {
        Self {
            request,
            engine: None,
            state: SessionState::Starting,
            next_sequence: 0,
            started_at: Utc::now(),
            pending: Vec::new(),
            start_waiter: None,
            stop_waiters: Vec::new(),
            stop_requested: false,
            stop_quietly: false,
        }
    }

    pub(crate) fn execution_id(&self) -> &str {
        &self.request.execution_id
    }

    /// Read-and-increment the log sequence counter.
    pub(crate) fn next_sequence(&mut self) -> u64 {
        let seq = self.next_sequence;
        self.next_sequence += 1;
        seq
    }

    pub(crate) fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            execution_id: self.request.execution_id.clone(),
            state: self.state,
            next_sequence: self.next_sequence,
            started_at: self.started_at,
            session_id: self.engine.as_ref().map(|e| e.session_id.clone()),
            container_id: self.engine.as_ref().map(|e| e.container_id.clone()),
            request: Arc::clone(&self.request),
        }
    }
}

/// Read-only view of a session, as returned by lookup.
#[derive(Debug, Clone, Serialize)]
pub struct SessionSnapshot {
    pub execution_id: String,
    pub state: SessionState,
    pub next_sequence: u64,
    pub started_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub container_id: Option<String>,
    #[serde(skip)]
    pub request: Arc<ExecutionRequest>,
}

/// Active sessions keyed by execution id, plus a bounded memory of terminal ids.
pub(crate) struct SessionTable {
    active: HashMap<String, Session>,
    finished: HashMap<String, ExecutionStatus>,
    finished_order: VecDeque<String>,
    retention: usize,
}

impl SessionTable {
    pub(crate) fn new(retention: usize) -> Self {
        Self {
            active: HashMap::new(),
            finished: HashMap::new(),
            finished_order: VecDeque::new(),
            retention,
        }
    }

    /// Returns false if the id is already active.
    pub(crate) fn insert(&mut self, session: Session) -> bool {
        let id = session.execution_id().to_string();
        if self.active.contains_key(&id) {
            return false;
        }
        self.active.insert(id, session);
        true
    }

    pub(crate) fn get(&self, execution_id: &str) -> Option<&Session> {
        self.active.get(execution_id)
    }

    pub(crate) fn get_mut(&mut self, execution_id: &str) -> Option<&mut Session> {
        self.active.get_mut(execution_id)
    }

    /// Remove without recording a terminal state (creation failed).
    pub(crate) fn remove(&mut self, execution_id: &str) -> Option<Session> {
        self.active.remove(execution_id)
    }

    /// Remove and remember the terminal status.
    pub(crate) fn finish(&mut self, execution_id: &str, status: ExecutionStatus) -> Option<Session> {
        let session = self.active.remove(execution_id)?;
        if self.retention > 0 {
            if self.finished_order.len() >= self.retention
                && let Some(oldest) = self.finished_order.pop_front()
            {
                self.finished.remove(&oldest);
            }
            self.finished.insert(execution_id.to_string(), status);
            self.finished_order.push_back(execution_id.to_string());
        }
        Some(session)
    }

    pub(crate) fn finished_status(&self, execution_id: &str) -> Option<ExecutionStatus> {
        self.finished.get(execution_id).copied()
    }

    pub(crate) fn len(&self) -> usize {
        self.active.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.active.is_empty()
    }

    pub(crate) fn ids(&self) -> Vec<String> {
        self.active.keys().cloned().collect()
    }
}
