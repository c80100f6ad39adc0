//! BridgeService: wires transport, session manager and shutdown together.
//!
//! Lifecycle:
//! 1. Start the writer task and the session actor, emit a readiness pong
//! 2. Read inbound envelopes until the stream closes, a signal arrives or a fault is
//!    triggered
//! 3. Stop every session (bounded by the shutdown timeout), drain the writer, report
//!    the exit code

use std::future::Future;
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::sync::CancellationToken;

use crate::adapter::EngineAdapter;
use crate::bridge::protocol::Envelope;
use crate::config::BridgeConfig;
use crate::engine::ExecutionEngine;
use crate::manager::SessionManager;
use crate::shutdown::{ShutdownCoordinator, ShutdownReason};
use crate::transport::{Outbound, run_reader, run_writer};

/// How the bridge ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShutdownOutcome {
    pub reason: ShutdownReason,
    pub exit_code: u8,
}

pub struct BridgeService {
    config: BridgeConfig,
    engine: Arc<dyn ExecutionEngine>,
    shutdown: ShutdownCoordinator,
}

impl BridgeService {
    pub fn new(config: BridgeConfig, engine: Arc<dyn ExecutionEngine>) -> Self {
        Self {
            config,
            engine,
            shutdown: ShutdownCoordinator::new(),
        }
    }

    /// Handle for triggering shutdown from outside, e.g. the panic hook.
    pub fn shutdown_handle(&self) -> ShutdownCoordinator {
        self.shutdown.clone()
    }

    pub async fn run<R, W, S>(self, reader: R, writer: W, signal: S) -> ShutdownOutcome
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
        S: Future<Output = ShutdownReason> + Send,
    {
        let (outbound, outbound_rx) = Outbound::channel();
        let close = CancellationToken::new();

        let writer_shutdown = self.shutdown.clone();
        let writer_close = close.clone();
        let writer_task = tokio::spawn(async move {
            let result = run_writer(writer, outbound_rx, writer_close).await;
            if let Err(ref e) = result {
                tracing::error!(error = %e, "Outbound stream failed");
                writer_shutdown.trigger(ShutdownReason::StreamClosed);
            }
            result
        });

        let adapter =
            EngineAdapter::new(Arc::clone(&self.engine)).with_stop_timeout(self.config.stop_timeout);
        let manager =
            SessionManager::spawn(adapter, outbound.clone(), self.config.finished_retention);

        tracing::info!(
            bridge = crate::BRIDGE_VERSION,
            engine = self.engine.name(),
            "Bridge ready"
        );
        outbound.send(Envelope::pong());

        let reader = run_reader(
            reader,
            self.config.max_line_length,
            manager.clone(),
            outbound,
            self.shutdown.clone(),
        );

        let reason = tokio::select! {
            _ = reader => ShutdownReason::StreamClosed,
            reason = signal => reason,
            reason = self.shutdown.triggered() => reason,
        };

        if !self.shutdown.begin(reason) {
            tracing::debug!(%reason, "Teardown already started");
        }

        let active = manager.active_count().await;
        tracing::info!(active, "Stopping active executions");
        if tokio::time::timeout(self.config.shutdown_timeout, manager.stop_all())
            .await
            .is_err()
        {
            tracing::warn!(
                timeout_secs = self.config.shutdown_timeout.as_secs(),
                "Timed out waiting for executions to stop"
            );
        }

        close.cancel();
        match writer_task.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::warn!(error = %e, "Writer failed while draining"),
            Err(e) => tracing::error!(error = %e, "Writer task failed"),
        }

        let outcome = ShutdownOutcome {
            reason,
            exit_code: self.shutdown.exit_code(reason),
        };
        tracing::info!(%reason, exit_code = outcome.exit_code, "Bridge stopped");
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::codec::{decode_line, encode_line};
    use crate::bridge::protocol::{ExecutionRequest, ExecutionStatus, ResourceLimits};
    use crate::engine::mock::MockEngine;
    use std::collections::BTreeMap;
    use std::time::Duration;
    use tokio::io::{
        AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream, Lines, ReadHalf, WriteHalf,
    };
    use tokio::sync::oneshot;
    use tokio::task::JoinHandle;

    fn execute(id: &str) -> String {
        let line = encode_line(&Envelope::Execute {
            request: ExecutionRequest {
                execution_id: id.to_string(),
                task_id: "task".to_string(),
                agent_id: "agent".to_string(),
                model: "sonnet".to_string(),
                prompt: "hi".to_string(),
                provider: "anthropic".to_string(),
                container_image: "agent:latest".to_string(),
                resource_limits: ResourceLimits::default(),
                workspace_path: None,
                env: BTreeMap::new(),
            },
        });
        format!("{line}\n")
    }

    struct Harness {
        engine: Arc<MockEngine>,
        shutdown: ShutdownCoordinator,
        input: WriteHalf<DuplexStream>,
        output: Lines<BufReader<ReadHalf<DuplexStream>>>,
        signal: Option<oneshot::Sender<()>>,
        service: JoinHandle<ShutdownOutcome>,
    }

    impl Harness {
        fn start(engine: MockEngine) -> Self {
            let engine = Arc::new(engine);
            let (client, server) = tokio::io::duplex(64 * 1024);
            let (bridge_read, bridge_write) = tokio::io::split(server);
            let (client_read, client_write) = tokio::io::split(client);

            let service = BridgeService::new(
                BridgeConfig::default().with_shutdown_timeout(Duration::from_secs(5)),
                engine.clone(),
            );
            let shutdown = service.shutdown_handle();
            let (signal_tx, signal_rx) = oneshot::channel::<()>();
            let signal = async move {
                let _ = signal_rx.await;
                ShutdownReason::Signal("SIGTERM")
            };

            let service = tokio::spawn(service.run(bridge_read, bridge_write, signal));
            Self {
                engine,
                shutdown,
                input: client_write,
                output: BufReader::new(client_read).lines(),
                signal: Some(signal_tx),
                service,
            }
        }

        async fn send(&mut self, line: &str) {
            self.input.write_all(line.as_bytes()).await.unwrap();
        }

        async fn recv(&mut self) -> Envelope {
            let line = tokio::time::timeout(Duration::from_secs(5), self.output.next_line())
                .await
                .expect("timed out waiting for output")
                .unwrap()
                .expect("output closed");
            decode_line(&line).unwrap()
        }

        /// Wait for the service to exit and collect everything it wrote after `recv`.
        async fn finish(mut self) -> (ShutdownOutcome, Vec<Envelope>) {
            let outcome = tokio::time::timeout(Duration::from_secs(10), self.service)
                .await
                .expect("service did not stop")
                .unwrap();
            let mut rest = Vec::new();
            while let Ok(Ok(Some(line))) =
                tokio::time::timeout(Duration::from_secs(1), self.output.next_line()).await
            {
                rest.push(decode_line(&line).unwrap());
            }
            (outcome, rest)
        }
    }

    fn cancelled(envelopes: &[Envelope]) -> Vec<String> {
        let mut ids: Vec<String> = envelopes
            .iter()
            .filter_map(|e| match e {
                Envelope::ExecutionComplete {
                    execution_id,
                    status: ExecutionStatus::Cancelled,
                    ..
                } => Some(execution_id.clone()),
                _ => None,
            })
            .collect();
        ids.sort();
        ids
    }

    #[tokio::test]
    async fn readiness_pong_comes_first() {
        let mut h = Harness::start(MockEngine::new());
        match h.recv().await {
            Envelope::Pong { version } => {
                assert_eq!(version.as_deref(), Some(crate::BRIDGE_VERSION));
            }
            other => panic!("expected pong, got {other:?}"),
        }

        h.send("{\"type\":\"ping\"}\n").await;
        assert!(matches!(h.recv().await, Envelope::Pong { .. }));
    }

    #[tokio::test]
    async fn execute_emits_started() {
        let mut h = Harness::start(MockEngine::new());
        h.recv().await;

        h.send(&execute("a")).await;
        match h.recv().await {
            Envelope::ExecutionStarted { response } => {
                assert_eq!(response.execution_id, "a");
                assert_eq!(response.session_id, "mock-a");
            }
            other => panic!("expected started, got {other:?}"),
        }
        assert_eq!(
            h.engine.prompts(),
            vec![("a".to_string(), "hi".to_string())]
        );
    }

    #[tokio::test]
    async fn invalid_line_reports_error() {
        let mut h = Harness::start(MockEngine::new());
        h.recv().await;

        h.send("{\"type\":\"execute\"}\n").await;
        match h.recv().await {
            Envelope::Error {
                execution_id,
                error,
                ..
            } => {
                assert_eq!(execution_id, None);
                assert!(error.starts_with("invalid envelope"));
            }
            other => panic!("expected error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn stream_close_cancels_active_sessions() {
        let mut h = Harness::start(MockEngine::new());
        h.recv().await;
        h.send(&execute("a")).await;
        assert!(matches!(h.recv().await, Envelope::ExecutionStarted { .. }));

        h.input.shutdown().await.unwrap();
        let (outcome, rest) = h.finish().await;

        assert_eq!(outcome.reason, ShutdownReason::StreamClosed);
        assert_eq!(outcome.exit_code, 0);
        assert_eq!(cancelled(&rest), vec!["a".to_string()]);
    }

    #[tokio::test]
    async fn signal_cancels_every_session() {
        let mut h = Harness::start(MockEngine::new());
        h.recv().await;
        h.send(&execute("a")).await;
        h.send(&execute("b")).await;
        assert!(matches!(h.recv().await, Envelope::ExecutionStarted { .. }));
        assert!(matches!(h.recv().await, Envelope::ExecutionStarted { .. }));

        if let Some(signal) = h.signal.take() {
            signal.send(()).unwrap();
        }
        let (outcome, rest) = h.finish().await;

        assert_eq!(outcome.reason, ShutdownReason::Signal("SIGTERM"));
        assert_eq!(outcome.exit_code, 0);
        assert_eq!(cancelled(&rest), vec!["a".to_string(), "b".to_string()]);
    }

    #[tokio::test]
    async fn fault_exits_with_failure() {
        let mut h = Harness::start(MockEngine::new());
        h.recv().await;
        h.send(&execute("a")).await;
        h.recv().await;

        h.shutdown.trigger(ShutdownReason::Fault);
        let (outcome, rest) = h.finish().await;

        assert_eq!(outcome.reason, ShutdownReason::Fault);
        assert_eq!(outcome.exit_code, 1);
        assert_eq!(cancelled(&rest), vec!["a".to_string()]);
    }

    #[tokio::test]
    async fn fault_during_shutdown_still_fails() {
        let mut h = Harness::start(MockEngine::new());
        h.recv().await;

        h.shutdown.trigger(ShutdownReason::StreamClosed);
        h.shutdown.trigger(ShutdownReason::Fault);
        let (outcome, _) = h.finish().await;

        assert_eq!(outcome.reason, ShutdownReason::StreamClosed);
        assert_eq!(outcome.exit_code, 1);
    }
}
