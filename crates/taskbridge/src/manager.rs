//! Session manager.
//!
//! A single actor task owns the [`SessionTable`] and is the only writer to it. It
//! consumes three channels:
//! - commands from [`SessionManager`] handles (start, stop, lookup, stop-all)
//! - reports from the tasks it spawns for engine create and stop calls
//! - engine events, passed to the [`EventMultiplexer`]
//!
//! Handle methods enqueue their command before returning, so commands are applied in
//! the order the caller issued them even when the returned futures are awaited later.

use std::future::Future;
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};

use crate::adapter::EngineAdapter;
use crate::bridge::protocol::{Envelope, ExecutionRequest, ExecutionResponse, ExecutionStatus};
use crate::engine::{EngineError, EngineEvent, EngineEvents, EngineMessage, EngineSession};
use crate::multiplexer::EventMultiplexer;
use crate::session::{Session, SessionError, SessionSnapshot, SessionState, SessionTable, Waiter};
use crate::transport::Outbound;

/// Consecutive engine events handled before a waiting command gets a turn.
const EVENT_BATCH: usize = 64;

/// Buffered agent lines attached to a creation failure.
const RECENT_LOG_LIMIT: usize = 8;

fn recent_output(pending: &[EngineEvent]) -> Vec<String> {
    let lines: Vec<String> = pending
        .iter()
        .filter_map(|event| match event {
            EngineEvent::Log(log) => Some(log.message.clone()),
            EngineEvent::Error { message, .. } => Some(message.clone()),
            _ => None,
        })
        .collect();
    let skip = lines.len().saturating_sub(RECENT_LOG_LIMIT);
    lines.into_iter().skip(skip).collect()
}

enum Command {
    Start {
        request: ExecutionRequest,
        reply: Waiter,
    },
    Stop {
        execution_id: String,
        reply: Waiter,
    },
    Lookup {
        execution_id: String,
        reply: oneshot::Sender<Option<SessionSnapshot>>,
    },
    ActiveCount {
        reply: oneshot::Sender<usize>,
    },
    StopAll {
        reply: oneshot::Sender<()>,
    },
}

enum Report {
    Created {
        execution_id: String,
        result: Result<(EngineSession, ExecutionResponse), EngineError>,
    },
    Stopped {
        execution_id: String,
        result: Result<(), EngineError>,
    },
}

/// Handle to the session actor. Cheap to clone.
#[derive(Clone)]
pub struct SessionManager {
    commands: mpsc::UnboundedSender<Command>,
}

impl SessionManager {
    pub fn spawn(adapter: EngineAdapter, outbound: Outbound, finished_retention: usize) -> Self {
        let (commands, commands_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (reports_tx, reports_rx) = mpsc::unbounded_channel();

        let actor = Actor {
            adapter: Arc::new(adapter),
            table: SessionTable::new(finished_retention),
            mux: EventMultiplexer::new(outbound),
            events_tx,
            reports_tx,
            closed: false,
            drain_waiters: Vec::new(),
        };
        tokio::spawn(actor.run(commands_rx, events_rx, reports_rx));

        Self { commands }
    }

    /// Accept an execution. Resolves once execution_started was emitted or creation failed.
    pub fn start(
        &self,
        request: ExecutionRequest,
    ) -> impl Future<Output = Result<(), SessionError>> + Send + 'static {
        let (reply, rx) = oneshot::channel();
        let sent = self.commands.send(Command::Start { request, reply }).is_ok();
        await_reply(sent, rx)
    }

    /// Stop an execution. Resolves once its completion was emitted.
    pub fn stop(
        &self,
        execution_id: &str,
    ) -> impl Future<Output = Result<(), SessionError>> + Send + 'static {
        let (reply, rx) = oneshot::channel();
        let sent = self
            .commands
            .send(Command::Stop {
                execution_id: execution_id.to_string(),
                reply,
            })
            .is_ok();
        await_reply(sent, rx)
    }

    pub fn lookup(
        &self,
        execution_id: &str,
    ) -> impl Future<Output = Option<SessionSnapshot>> + Send + 'static {
        let (reply, rx) = oneshot::channel();
        let _ = self.commands.send(Command::Lookup {
            execution_id: execution_id.to_string(),
            reply,
        });
        async move { rx.await.ok().flatten() }
    }

    pub fn active_count(&self) -> impl Future<Output = usize> + Send + 'static {
        let (reply, rx) = oneshot::channel();
        let _ = self.commands.send(Command::ActiveCount { reply });
        async move { rx.await.unwrap_or(0) }
    }

    /// Refuse new executions, stop every active one and resolve once none are left.
    /// Individual stop failures are logged, not reported.
    pub fn stop_all(&self) -> impl Future<Output = ()> + Send + 'static {
        let (reply, rx) = oneshot::channel();
        let _ = self.commands.send(Command::StopAll { reply });
        async move {
            let _ = rx.await;
        }
    }
}

async fn await_reply(
    sent: bool,
    rx: oneshot::Receiver<Result<(), SessionError>>,
) -> Result<(), SessionError> {
    if !sent {
        return Err(SessionError::Closed);
    }
    rx.await.unwrap_or(Err(SessionError::Closed))
}

struct Actor {
    adapter: Arc<EngineAdapter>,
    table: SessionTable,
    mux: EventMultiplexer,
    events_tx: mpsc::UnboundedSender<EngineMessage>,
    reports_tx: mpsc::UnboundedSender<Report>,
    closed: bool,
    drain_waiters: Vec<oneshot::Sender<()>>,
}

impl Actor {
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut events: mpsc::UnboundedReceiver<EngineMessage>,
        mut reports: mpsc::UnboundedReceiver<Report>,
    ) {
        tracing::debug!(engine = self.adapter.engine_name(), "Session manager started");

        let mut streak = 0;
        loop {
            tokio::select! {
                biased;
                Some(report) = reports.recv() => {
                    // Events the engine queued before the call returned come first.
                    while let Ok(message) = events.try_recv() {
                        self.mux.dispatch(&mut self.table, message);
                    }
                    self.on_report(report);
                }
                Some(message) = events.recv() => {
                    self.mux.dispatch(&mut self.table, message);
                    streak += 1;
                    // A chatty agent must not starve stop and lookup.
                    if streak >= EVENT_BATCH {
                        streak = 0;
                        if let Ok(command) = commands.try_recv() {
                            self.on_command(command);
                        }
                    }
                }
                command = commands.recv() => {
                    streak = 0;
                    match command {
                        Some(command) => self.on_command(command),
                        None => break,
                    }
                }
            }
            self.check_drained();
        }

        tracing::debug!(active = self.table.len(), "Session manager stopped");
    }

    fn on_command(&mut self, command: Command) {
        match command {
            Command::Start { request, reply } => self.start(request, reply),
            Command::Stop {
                execution_id,
                reply,
            } => self.stop(execution_id, reply),
            Command::Lookup {
                execution_id,
                reply,
            } => {
                let _ = reply.send(self.table.get(&execution_id).map(Session::snapshot));
            }
            Command::ActiveCount { reply } => {
                let _ = reply.send(self.table.len());
            }
            Command::StopAll { reply } => self.stop_all(reply),
        }
    }

    fn on_report(&mut self, report: Report) {
        match report {
            Report::Created {
                execution_id,
                result: Ok((engine, response)),
            } => self.created(&execution_id, engine, response),
            Report::Created {
                execution_id,
                result: Err(e),
            } => self.creation_failed(&execution_id, e),
            Report::Stopped {
                execution_id,
                result,
            } => self.stopped(&execution_id, result),
        }
    }

    fn start(&mut self, request: ExecutionRequest, reply: Waiter) {
        let execution_id = request.execution_id.clone();

        if self.closed {
            self.reject(reply, &execution_id, SessionError::ShuttingDown);
            return;
        }
        if self.table.get(&execution_id).is_some() {
            let error = SessionError::DuplicateExecution {
                execution_id: execution_id.clone(),
            };
            self.reject(reply, &execution_id, error);
            return;
        }
        if let Some(status) = self.table.finished_status(&execution_id) {
            let error = SessionError::AlreadyFinished {
                execution_id: execution_id.clone(),
                status,
            };
            self.reject(reply, &execution_id, error);
            return;
        }

        let request = Arc::new(request);
        let mut session = Session::new(Arc::clone(&request));
        session.start_waiter = Some(reply);
        self.table.insert(session);

        tracing::info!(
            %execution_id,
            task_id = %request.task_id,
            agent_id = %request.agent_id,
            model = %request.model,
            "Execution accepted"
        );

        let adapter = Arc::clone(&self.adapter);
        let events = EngineEvents::new(execution_id.clone(), self.events_tx.clone());
        let reports = self.reports_tx.clone();
        tokio::spawn(async move {
            let task = tokio::spawn(async move { adapter.begin(&request, events).await });
            let result = task.await.unwrap_or_else(|e| {
                Err(EngineError::Rejected(format!("engine task failed: {e}")))
            });
            let _ = reports.send(Report::Created {
                execution_id,
                result,
            });
        });
    }

    fn created(&mut self, execution_id: &str, engine: EngineSession, response: ExecutionResponse) {
        let Some(session) = self.table.get_mut(execution_id) else {
            tracing::warn!(%execution_id, "Session vanished during creation");
            return;
        };
        let waiter = session.start_waiter.take();

        tracing::info!(
            %execution_id,
            session_id = %engine.session_id,
            container_id = %engine.container_id,
            "Execution started"
        );
        self.mux.started(&mut self.table, engine, response);
        if let Some(waiter) = waiter {
            let _ = waiter.send(Ok(()));
        }

        if self
            .table
            .get(execution_id)
            .is_some_and(|s| s.stop_requested)
        {
            self.begin_stop(execution_id);
        }
    }

    fn creation_failed(&mut self, execution_id: &str, error: EngineError) {
        let Some(mut session) = self.table.remove(execution_id) else {
            return;
        };

        tracing::warn!(%execution_id, error = %error, "Execution failed to start");
        if !session.pending.is_empty() {
            tracing::debug!(
                %execution_id,
                dropped = session.pending.len(),
                "Discarding events from failed session"
            );
        }

        let failure = SessionError::Engine {
            execution_id: execution_id.to_string(),
            message: error.to_string(),
        };
        let response = EngineAdapter::failed_response(execution_id, &error);
        let mut details = serde_json::to_value(&response).ok();
        // Agent output buffered while starting.
        let recent = recent_output(&session.pending);
        if !recent.is_empty()
            && let Some(serde_json::Value::Object(map)) = details.as_mut()
        {
            map.insert("recent_logs".to_string(), serde_json::json!(recent));
        }
        self.mux.emit(Envelope::error(Some(execution_id), failure.to_string(), details));

        if let Some(waiter) = session.start_waiter.take() {
            let _ = waiter.send(Err(failure));
        }
        for waiter in session.stop_waiters.drain(..) {
            let _ = waiter.send(Ok(()));
        }
    }

    fn stop(&mut self, execution_id: String, reply: Waiter) {
        let Some(session) = self.table.get_mut(&execution_id) else {
            let error = SessionError::NotFound {
                execution_id: execution_id.clone(),
            };
            self.reject(reply, &execution_id, error);
            return;
        };

        session.stop_waiters.push(reply);
        match session.state {
            SessionState::Starting => {
                tracing::debug!(%execution_id, "Stop deferred until session is created");
                session.stop_requested = true;
            }
            SessionState::Stopping => {
                tracing::debug!(%execution_id, "Stop already in progress");
            }
            SessionState::Running => self.begin_stop(&execution_id),
        }
    }

    fn stop_all(&mut self, reply: oneshot::Sender<()>) {
        if !self.closed {
            self.closed = true;
            tracing::info!(active = self.table.len(), "Stopping all executions");
        }
        self.drain_waiters.push(reply);

        for execution_id in self.table.ids() {
            let Some(session) = self.table.get_mut(&execution_id) else {
                continue;
            };
            session.stop_quietly = true;
            match session.state {
                SessionState::Starting => session.stop_requested = true,
                SessionState::Stopping => {}
                SessionState::Running => self.begin_stop(&execution_id),
            }
        }
    }

    fn begin_stop(&mut self, execution_id: &str) {
        let Some(session) = self.table.get_mut(execution_id) else {
            return;
        };
        let Some(engine) = session.engine.clone() else {
            return;
        };
        session.state = SessionState::Stopping;
        session.stop_requested = false;

        tracing::info!(%execution_id, "Stopping execution");

        let adapter = Arc::clone(&self.adapter);
        let reports = self.reports_tx.clone();
        let execution_id = execution_id.to_string();
        tokio::spawn(async move {
            let task = tokio::spawn(async move { adapter.stop(&engine).await });
            let result = task.await.unwrap_or_else(|e| {
                Err(EngineError::Rejected(format!("engine task failed: {e}")))
            });
            let _ = reports.send(Report::Stopped {
                execution_id,
                result,
            });
        });
    }

    fn stopped(&mut self, execution_id: &str, result: Result<(), EngineError>) {
        let Some(session) = self.table.get(execution_id) else {
            tracing::debug!(%execution_id, "Execution finished before stop settled");
            return;
        };

        if let Err(e) = result {
            if session.stop_quietly {
                tracing::warn!(%execution_id, error = %e, "Engine stop failed during shutdown");
            } else {
                tracing::warn!(%execution_id, error = %e, "Engine stop failed");
                self.mux.emit(Envelope::error(
                    Some(execution_id),
                    format!("failed to stop execution: {e}"),
                    None,
                ));
            }
        }

        self.mux
            .complete(&mut self.table, execution_id, ExecutionStatus::Cancelled, None);
    }

    /// Report a rejected command. Finished ids are only named in the details so nothing
    /// referencing them follows their completion.
    fn reject(&self, reply: Waiter, execution_id: &str, error: SessionError) {
        let (reported, details) = match self.table.finished_status(execution_id) {
            Some(status) => (
                None,
                serde_json::json!({ "execution_id": execution_id, "status": status }),
            ),
            None => (
                Some(execution_id),
                serde_json::json!({ "execution_id": execution_id }),
            ),
        };
        tracing::debug!(%execution_id, error = %error, "Command rejected");
        self.mux
            .emit(Envelope::error(reported, error.to_string(), Some(details)));
        let _ = reply.send(Err(error));
    }

    fn check_drained(&mut self) {
        if self.closed && self.table.is_empty() && !self.drain_waiters.is_empty() {
            tracing::info!("All executions stopped");
            for waiter in self.drain_waiters.drain(..) {
                let _ = waiter.send(());
            }
        }
    }
}
