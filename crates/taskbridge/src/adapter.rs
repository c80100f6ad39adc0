//! Execution engine adapter.
//!
//! Translates an [`ExecutionRequest`] into one engine session and the engine's answer
//! into the bridge's [`ExecutionResponse`]. The event subscription is handed over at
//! session creation, before the prompt is issued, so no engine event can be missed.

use std::sync::Arc;
use std::time::Duration;

use crate::bridge::protocol::{ExecutionRequest, ExecutionResponse, ExecutionStatus};
use crate::engine::{EngineError, EngineEvents, EngineSession, ExecutionEngine, SessionConfig};

pub struct EngineAdapter {
    engine: Arc<dyn ExecutionEngine>,
    stop_timeout: Duration,
}

impl EngineAdapter {
    pub fn new(engine: Arc<dyn ExecutionEngine>) -> Self {
        Self {
            engine,
            stop_timeout: Duration::from_secs(30),
        }
    }

    pub fn with_stop_timeout(mut self, timeout: Duration) -> Self {
        self.stop_timeout = timeout;
        self
    }

    pub fn engine_name(&self) -> &str {
        self.engine.name()
    }

    /// Map request fields onto the engine's configuration shape.
    pub fn session_config(request: &ExecutionRequest) -> SessionConfig {
        let limits = &request.resource_limits;
        SessionConfig {
            execution_id: request.execution_id.clone(),
            task_id: request.task_id.clone(),
            agent_id: request.agent_id.clone(),
            model: request.model.clone(),
            provider: request.provider.clone(),
            image: request.container_image.clone(),
            memory_mb: limits.memory_mb,
            cpu_cores: limits.cpu_cores,
            timeout: (limits.timeout_seconds > 0)
                .then(|| Duration::from_secs(limits.timeout_seconds)),
            workspace: request.workspace_path.clone(),
            env: request.env.clone(),
        }
    }

    /// Create the engine session and dispatch the prompt.
    ///
    /// Returns as soon as the engine accepted the task; the task itself keeps running
    /// and reports through `events`. A session whose prompt was rejected is stopped
    /// before the error is returned.
    pub async fn begin(
        &self,
        request: &ExecutionRequest,
        events: EngineEvents,
    ) -> Result<(EngineSession, ExecutionResponse), EngineError> {
        let config = Self::session_config(request);
        let session = self.engine.create_session(config, events).await?;

        tracing::debug!(
            execution_id = %request.execution_id,
            session_id = %session.session_id,
            container_id = %session.container_id,
            "Engine session created"
        );

        if let Err(e) = self.engine.prompt(&session, &request.prompt).await {
            tracing::warn!(
                execution_id = %request.execution_id,
                error = %e,
                "Prompt dispatch failed, stopping session"
            );
            if let Err(stop_err) = self.stop(&session).await {
                tracing::warn!(
                    execution_id = %request.execution_id,
                    error = %stop_err,
                    "Failed to stop half-created session"
                );
            }
            return Err(e);
        }

        let response = ExecutionResponse {
            execution_id: request.execution_id.clone(),
            container_id: session.container_id.clone(),
            status: ExecutionStatus::Running,
            container_status: session.container_status.clone(),
            session_id: session.session_id.clone(),
            error: None,
        };
        Ok((session, response))
    }

    pub async fn stop(&self, session: &EngineSession) -> Result<(), EngineError> {
        tokio::time::timeout(self.stop_timeout, self.engine.stop_session(session))
            .await
            .map_err(|_| EngineError::Timeout(self.stop_timeout))?
    }

    pub fn failed_response(execution_id: &str, error: &EngineError) -> ExecutionResponse {
        ExecutionResponse {
            execution_id: execution_id.to_string(),
            container_id: String::new(),
            status: ExecutionStatus::Failed,
            container_status: "not_created".to_string(),
            session_id: String::new(),
            error: Some(error.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::protocol::ResourceLimits;
    use crate::engine::mock::MockEngine;
    use std::collections::BTreeMap;
    use std::path::PathBuf;
    use tokio::sync::mpsc;

    fn request(id: &str) -> ExecutionRequest {
        ExecutionRequest {
            execution_id: id.to_string(),
            task_id: "task-1".to_string(),
            agent_id: "agent-1".to_string(),
            model: "sonnet".to_string(),
            prompt: "fix the tests".to_string(),
            provider: "anthropic".to_string(),
            container_image: "agent:latest".to_string(),
            resource_limits: ResourceLimits {
                memory_mb: 1024,
                cpu_cores: 2.0,
                timeout_seconds: 90,
            },
            workspace_path: Some(PathBuf::from("/work")),
            env: BTreeMap::from([("DEBUG".to_string(), "1".to_string())]),
        }
    }

    #[test]
    fn session_config_maps_limits() {
        let config = EngineAdapter::session_config(&request("a"));
        assert_eq!(config.memory_mb, 1024);
        assert_eq!(config.cpu_cores, 2.0);
        assert_eq!(config.timeout, Some(Duration::from_secs(90)));
        assert_eq!(config.image, "agent:latest");
        assert_eq!(config.provider, "anthropic");
        assert_eq!(config.workspace, Some(PathBuf::from("/work")));
        assert_eq!(config.env.get("DEBUG").map(String::as_str), Some("1"));
    }

    #[test]
    fn zero_timeout_means_unbounded() {
        let mut req = request("a");
        req.resource_limits.timeout_seconds = 0;
        assert_eq!(EngineAdapter::session_config(&req).timeout, None);
    }

    #[tokio::test]
    async fn begin_creates_session_and_dispatches_prompt() {
        let engine = Arc::new(MockEngine::new());
        let adapter = EngineAdapter::new(engine.clone());
        let (tx, _rx) = mpsc::unbounded_channel();

        let (session, response) = adapter
            .begin(&request("a"), EngineEvents::new("a", tx))
            .await
            .unwrap();

        assert_eq!(session.session_id, "mock-a");
        assert_eq!(response.status, ExecutionStatus::Running);
        assert_eq!(response.container_id, "container-a");
        assert_eq!(response.session_id, "mock-a");
        assert_eq!(
            engine.prompts(),
            vec![("a".to_string(), "fix the tests".to_string())]
        );
        assert_eq!(engine.configs()[0].timeout, Some(Duration::from_secs(90)));
    }

    #[tokio::test]
    async fn rejected_prompt_stops_session() {
        let engine = Arc::new(MockEngine::new().with_failing_prompt());
        let adapter = EngineAdapter::new(engine.clone());
        let (tx, _rx) = mpsc::unbounded_channel();

        let err = adapter
            .begin(&request("a"), EngineEvents::new("a", tx))
            .await
            .unwrap_err();

        assert!(matches!(err, EngineError::Rejected(_)));
        assert_eq!(engine.stopped(), vec!["a".to_string()]);
    }

    #[test]
    fn failed_response_carries_error() {
        let err = EngineError::Rejected("no such image".to_string());
        let response = EngineAdapter::failed_response("a", &err);
        assert_eq!(response.status, ExecutionStatus::Failed);
        assert_eq!(response.container_status, "not_created");
        assert_eq!(
            response.error.as_deref(),
            Some("engine rejected request: no such image")
        );
    }
}
