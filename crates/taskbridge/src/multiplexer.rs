//! Engine events → outbound envelopes.
//!
//! Runs inside the session manager's actor with exclusive access to the table:
//! - Log: stamp the next sequence number
//! - Error: a log line (error or fatal) followed by an error envelope
//! - Resources / Artifact: forwarded unsequenced
//! - Complete: the only place a running session is removed
//!
//! Events for a session that is still `Starting` are buffered until execution_started
//! is out. Events for absent or finished ids are dropped.

use std::path::Path;

use chrono::Utc;

use crate::bridge::protocol::{
    Artifact, Envelope, ExecutionResponse, ExecutionStatus, LogEntry, LogLevel,
};
use crate::engine::{ArtifactEvent, EngineEvent, EngineMessage, EngineSession, LogEvent};
use crate::session::{SessionState, SessionTable};
use crate::transport::Outbound;

const DEFAULT_STORAGE: &str = "local";

pub(crate) struct EventMultiplexer {
    outbound: Outbound,
}

impl EventMultiplexer {
    pub(crate) fn new(outbound: Outbound) -> Self {
        Self { outbound }
    }

    pub(crate) fn emit(&self, envelope: Envelope) {
        self.outbound.send(envelope);
    }

    pub(crate) fn dispatch(&self, table: &mut SessionTable, message: EngineMessage) {
        let EngineMessage {
            execution_id,
            event,
        } = message;

        let Some(session) = table.get_mut(&execution_id) else {
            tracing::debug!(
                %execution_id,
                finished = table.finished_status(&execution_id).is_some(),
                "Dropping event for inactive execution"
            );
            return;
        };

        if session.state == SessionState::Starting {
            session.pending.push(event);
            return;
        }

        self.apply(table, &execution_id, event);
    }

    /// Mark the session running, emit execution_started and flush buffered events.
    pub(crate) fn started(
        &self,
        table: &mut SessionTable,
        engine: EngineSession,
        response: ExecutionResponse,
    ) {
        let execution_id = response.execution_id.clone();
        let Some(session) = table.get_mut(&execution_id) else {
            return;
        };
        session.engine = Some(engine);
        session.state = SessionState::Running;
        let pending = std::mem::take(&mut session.pending);

        self.emit(Envelope::ExecutionStarted { response });

        for event in pending {
            if table.get(&execution_id).is_none() {
                tracing::debug!(%execution_id, "Dropping buffered events after completion");
                break;
            }
            self.apply(table, &execution_id, event);
        }
    }

    /// Remove the session and emit its completion. Returns false if it was already gone.
    pub(crate) fn complete(
        &self,
        table: &mut SessionTable,
        execution_id: &str,
        status: ExecutionStatus,
        error: Option<String>,
    ) -> bool {
        let Some(session) = table.finish(execution_id, status) else {
            return false;
        };

        tracing::info!(
            %execution_id,
            %status,
            duration_ms = (Utc::now() - session.started_at).num_milliseconds(),
            "Execution finished"
        );
        self.emit(Envelope::complete(execution_id, status, error));

        for waiter in session.stop_waiters {
            let _ = waiter.send(Ok(()));
        }
        true
    }

    fn apply(&self, table: &mut SessionTable, execution_id: &str, event: EngineEvent) {
        match event {
            EngineEvent::Log(log) => self.log(table, execution_id, log),

            EngineEvent::Error {
                message,
                stack_trace,
                fatal,
            } => {
                let level = if fatal { LogLevel::Fatal } else { LogLevel::Error };
                let mut log = LogEvent::new(level, message.clone());
                log.stack_trace = stack_trace;
                self.log(table, execution_id, log);
                self.emit(Envelope::error(Some(execution_id), message, None));
            }

            EngineEvent::Resources(usage) => {
                self.emit(Envelope::ResourceUpdate {
                    execution_id: execution_id.to_string(),
                    usage,
                });
            }

            EngineEvent::Artifact(artifact) => {
                self.emit(Envelope::Artifact {
                    artifact: artifact_envelope(execution_id, artifact),
                });
            }

            EngineEvent::Complete { status, error } => {
                let (status, error) = if status.is_terminal() {
                    (status, error)
                } else {
                    tracing::warn!(%execution_id, %status, "Engine completed with non-terminal status");
                    (
                        ExecutionStatus::Failed,
                        error.or_else(|| Some(format!("engine reported status {status}"))),
                    )
                };
                self.complete(table, execution_id, status, error);
            }
        }
    }

    fn log(&self, table: &mut SessionTable, execution_id: &str, log: LogEvent) {
        let Some(session) = table.get_mut(execution_id) else {
            return;
        };
        let entry = LogEntry {
            execution_id: execution_id.to_string(),
            timestamp: Utc::now(),
            level: log.level,
            message: log.message,
            source: log.source,
            metadata: log.metadata,
            stack_trace: log.stack_trace,
            sequence: session.next_sequence(),
        };
        self.emit(Envelope::Log { log: entry });
    }
}

fn artifact_envelope(execution_id: &str, artifact: ArtifactEvent) -> Artifact {
    let path = Path::new(&artifact.path);
    let name = artifact.name.unwrap_or_else(|| {
        path.file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| artifact.path.clone())
    });
    let mime_type = artifact
        .mime_type
        .unwrap_or_else(|| mime_guess::from_path(path).first_or_octet_stream().to_string());

    Artifact {
        execution_id: execution_id.to_string(),
        kind: artifact.kind,
        path: artifact.path,
        name,
        size: artifact.size,
        mime_type,
        storage: artifact
            .storage
            .unwrap_or_else(|| DEFAULT_STORAGE.to_string()),
        checksum: artifact.checksum,
        created_at: Utc::now(),
    }
}
