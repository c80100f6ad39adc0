//! Scripted in-memory engine for tests.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;

use super::{EngineError, EngineEvents, EngineSession, ExecutionEngine, SessionConfig};
use crate::bridge::protocol::LogLevel;

/// Engine whose sessions are driven by the test through [`MockEngine::events`].
#[derive(Default)]
pub(crate) struct MockEngine {
    subscriptions: Mutex<HashMap<String, EngineEvents>>,
    configs: Mutex<Vec<SessionConfig>>,
    prompts: Mutex<Vec<(String, String)>>,
    stopped: Mutex<Vec<String>>,
    fail_create_once: Mutex<HashSet<String>>,
    fail_prompt: AtomicBool,
    fail_stop: AtomicBool,
    boot_log: AtomicBool,
    create_delay: Mutex<Option<Duration>>,
    created: AtomicUsize,
}

impl MockEngine {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// The next creation of `execution_id` fails; later attempts succeed.
    pub(crate) fn fail_create_once(self, execution_id: &str) -> Self {
        self.fail_create_once
            .lock()
            .unwrap()
            .insert(execution_id.to_string());
        self
    }

    pub(crate) fn with_failing_prompt(self) -> Self {
        self.fail_prompt.store(true, Ordering::SeqCst);
        self
    }

    pub(crate) fn with_failing_stop(self) -> Self {
        self.fail_stop.store(true, Ordering::SeqCst);
        self
    }

    /// Emit a log from inside `create_session`, before the bridge saw the session.
    pub(crate) fn with_boot_log(self) -> Self {
        self.boot_log.store(true, Ordering::SeqCst);
        self
    }

    pub(crate) fn with_create_delay(self, delay: Duration) -> Self {
        *self.create_delay.lock().unwrap() = Some(delay);
        self
    }

    pub(crate) fn events(&self, execution_id: &str) -> EngineEvents {
        self.subscriptions
            .lock()
            .unwrap()
            .get(execution_id)
            .cloned()
            .unwrap_or_else(|| panic!("no session created for {execution_id}"))
    }

    pub(crate) fn configs(&self) -> Vec<SessionConfig> {
        self.configs.lock().unwrap().clone()
    }

    pub(crate) fn prompts(&self) -> Vec<(String, String)> {
        self.prompts.lock().unwrap().clone()
    }

    pub(crate) fn stopped(&self) -> Vec<String> {
        self.stopped.lock().unwrap().clone()
    }

    pub(crate) fn created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }
}

fn execution_of(session: &EngineSession) -> String {
    session
        .session_id
        .strip_prefix("mock-")
        .unwrap_or(&session.session_id)
        .to_string()
}

#[async_trait]
impl ExecutionEngine for MockEngine {
    fn name(&self) -> &str {
        "mock"
    }

    async fn create_session(
        &self,
        config: SessionConfig,
        events: EngineEvents,
    ) -> Result<EngineSession, EngineError> {
        let delay = *self.create_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let id = config.execution_id.clone();
        if self.fail_create_once.lock().unwrap().remove(&id) {
            return Err(EngineError::Rejected(format!("image {} not found", config.image)));
        }

        if self.boot_log.load(Ordering::SeqCst) {
            let _ = events.log(LogLevel::Info, "booting");
        }

        self.subscriptions
            .lock()
            .unwrap()
            .insert(id.clone(), events);
        self.configs.lock().unwrap().push(config);
        self.created.fetch_add(1, Ordering::SeqCst);

        Ok(EngineSession {
            session_id: format!("mock-{id}"),
            container_id: format!("container-{id}"),
            container_status: "running".to_string(),
        })
    }

    async fn prompt(&self, session: &EngineSession, prompt: &str) -> Result<(), EngineError> {
        if self.fail_prompt.load(Ordering::SeqCst) {
            return Err(EngineError::Rejected("provider unavailable".to_string()));
        }
        self.prompts
            .lock()
            .unwrap()
            .push((execution_of(session), prompt.to_string()));
        Ok(())
    }

    async fn stop_session(&self, session: &EngineSession) -> Result<(), EngineError> {
        self.stopped.lock().unwrap().push(execution_of(session));
        if self.fail_stop.load(Ordering::SeqCst) {
            return Err(EngineError::Rejected("container runtime unreachable".to_string()));
        }
        Ok(())
    }
}
